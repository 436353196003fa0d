//! Event bus: typed handler registration, priority-ordered dispatch.
//!
//! Handlers are registered through a [`Subscriptions`] builder instead of
//! being discovered by reflection: a plugin hands its handlers to the bus
//! when it is enabled, keyed by its name, and the whole set is removed
//! when it is disabled.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::pool::WorkerPool;

/// Cooperative cancellation flag embedded in cancellable events.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    /// Create a flag in the not-cancelled state.
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Whether the event has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Mark the event cancelled.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Set or clear cancellation.
    pub fn set(&self, cancelled: bool) {
        self.0.store(cancelled, Ordering::Relaxed);
    }
}

/// An application event.
///
/// Events that support cancellation embed a [`CancelFlag`] and return it
/// from [`Event::cancel_flag`]; handlers registered with
/// `ignore_cancelled` are skipped once the flag is raised.
pub trait Event: Any + Send + Sync + 'static {
    /// The event's cancellation flag, if it is cancellable.
    fn cancel_flag(&self) -> Option<&CancelFlag> {
        None
    }
}

/// Handler priority; higher priorities are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Runs last.
    Lowest = 0,
    /// Runs late.
    Low = 1,
    /// Default.
    Normal = 2,
    /// Runs early.
    High = 3,
    /// Runs first.
    Highest = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

type ErasedHandler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

struct HandlerRecord {
    owner: String,
    priority: Priority,
    ignore_cancelled: bool,
    seq: u64,
    invoke: ErasedHandler,
}

/// Builder collecting a listener's typed handlers before registration.
#[derive(Default)]
pub struct Subscriptions {
    records: Vec<(TypeId, Priority, bool, ErasedHandler)>,
}

impl Subscriptions {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events of type `E` at `priority`.
    pub fn on<E, F>(&mut self, priority: Priority, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.on_with(priority, false, handler)
    }

    /// Register a handler that also states whether it wants to see
    /// already-cancelled events.
    pub fn on_with<E, F>(&mut self, priority: Priority, ignore_cancelled: bool, handler: F) -> &mut Self
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |any: &(dyn Any + Send + Sync)| {
            if let Some(event) = any.downcast_ref::<E>() {
                handler(event);
            }
        });
        self.records
            .push((TypeId::of::<E>(), priority, ignore_cancelled, erased));
        self
    }

    /// Number of handlers collected.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no handlers were collected.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Dispatches events to registered handlers.
///
/// Within one firing, handlers are submitted in priority-descending order
/// (registration order breaks ties); execution across handlers is
/// concurrent on a fixed worker pool and not causally ordered.
/// [`EventBus::fire_sync`] runs the same order inline on the caller's
/// thread. Errors inside one handler never stop the others.
pub struct EventBus {
    handlers: RwLock<HashMap<TypeId, Vec<HandlerRecord>>>,
    pool: WorkerPool,
    seq: AtomicU64,
}

impl EventBus {
    /// Create a bus with `workers` dispatch threads.
    pub fn new(workers: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pool: WorkerPool::new("event-bus", workers),
            seq: AtomicU64::new(0),
        }
    }

    /// Create a bus with the default pool of 4 workers.
    pub fn default_pool() -> Self {
        Self::new(4)
    }

    /// Register a listener's handlers under `owner`.
    pub fn register(&self, owner: &str, subs: Subscriptions) {
        if subs.is_empty() {
            return;
        }
        let mut handlers = self.handlers.write();
        let mut touched = Vec::new();
        for (type_id, priority, ignore_cancelled, invoke) in subs.records {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            handlers.entry(type_id).or_default().push(HandlerRecord {
                owner: owner.to_string(),
                priority,
                ignore_cancelled,
                seq,
                invoke,
            });
            touched.push(type_id);
        }
        for type_id in touched {
            if let Some(list) = handlers.get_mut(&type_id) {
                list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            }
        }
        tracing::debug!("registered event handlers for {}", owner);
    }

    /// Remove every handler registered under `owner`.
    pub fn unregister(&self, owner: &str) {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            list.retain(|record| record.owner != owner);
        }
        handlers.retain(|_, list| !list.is_empty());
    }

    /// Dispatch `event` concurrently on the worker pool.
    ///
    /// Handler submissions happen in priority order; the cancelled-skip
    /// rule is evaluated at submission time.
    pub fn fire<E: Event>(&self, event: E) {
        let event = Arc::new(event);
        let records: Vec<(bool, ErasedHandler)> = {
            let handlers = self.handlers.read();
            match handlers.get(&TypeId::of::<E>()) {
                Some(list) => list
                    .iter()
                    .map(|r| (r.ignore_cancelled, r.invoke.clone()))
                    .collect(),
                None => return,
            }
        };

        for (ignore_cancelled, invoke) in records {
            if ignore_cancelled && event.cancel_flag().is_some_and(|f| f.is_cancelled()) {
                continue;
            }
            let event = event.clone();
            self.pool.execute(Box::new(move || {
                invoke(&*event as &(dyn Any + Send + Sync));
            }));
        }
    }

    /// Dispatch `event` inline, in priority order, on the caller's thread.
    pub fn fire_sync<E: Event>(&self, event: &E) {
        let records: Vec<(bool, ErasedHandler)> = {
            let handlers = self.handlers.read();
            match handlers.get(&TypeId::of::<E>()) {
                Some(list) => list
                    .iter()
                    .map(|r| (r.ignore_cancelled, r.invoke.clone()))
                    .collect(),
                None => return,
            }
        };

        for (ignore_cancelled, invoke) in records {
            if ignore_cancelled && event.cancel_flag().is_some_and(|f| f.is_cancelled()) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| {
                invoke(event as &(dyn Any + Send + Sync))
            }))
            .is_err()
            {
                tracing::error!("error handling event in sync dispatch");
            }
        }
    }

    /// Number of handlers currently registered for `E`.
    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .read()
            .get(&TypeId::of::<E>())
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Drain and stop the dispatch pool.
    pub fn shutdown(&self) {
        self.pool.shutdown(Duration::from_secs(5));
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_types", &self.handlers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Ping {
        value: u32,
    }
    impl Event for Ping {}

    struct Cancellable {
        cancel: CancelFlag,
    }
    impl Event for Cancellable {
        fn cancel_flag(&self) -> Option<&CancelFlag> {
            Some(&self.cancel)
        }
    }

    #[test]
    fn test_sync_dispatch_priority_order() {
        let bus = EventBus::new(2);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut subs = Subscriptions::new();
        let o = order.clone();
        subs.on(Priority::Lowest, move |_: &Ping| o.lock().push("lowest"));
        let o = order.clone();
        subs.on(Priority::Highest, move |_: &Ping| o.lock().push("highest"));
        let o = order.clone();
        subs.on(Priority::Normal, move |_: &Ping| o.lock().push("normal"));
        bus.register("test", subs);

        bus.fire_sync(&Ping { value: 1 });
        assert_eq!(*order.lock(), vec!["highest", "normal", "lowest"]);
        bus.shutdown();
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let bus = EventBus::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut subs = Subscriptions::new();
        let o = order.clone();
        subs.on(Priority::Normal, move |_: &Ping| o.lock().push(1));
        let o = order.clone();
        subs.on(Priority::Normal, move |_: &Ping| o.lock().push(2));
        bus.register("test", subs);

        bus.fire_sync(&Ping { value: 1 });
        assert_eq!(*order.lock(), vec![1, 2]);
        bus.shutdown();
    }

    #[test]
    fn test_async_dispatch_runs_handlers() {
        let bus = EventBus::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut subs = Subscriptions::new();
        for _ in 0..3 {
            let c = counter.clone();
            subs.on(Priority::Normal, move |e: &Ping| {
                c.fetch_add(e.value as usize, Ordering::SeqCst);
            });
        }
        bus.register("test", subs);

        bus.fire(Ping { value: 2 });
        bus.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_cancelled_skip_rule() {
        let bus = EventBus::new(1);
        let seen = Arc::new(AtomicUsize::new(0));
        let always = Arc::new(AtomicUsize::new(0));

        let mut subs = Subscriptions::new();
        let s = seen.clone();
        subs.on_with(Priority::Normal, true, move |_: &Cancellable| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        let a = always.clone();
        subs.on_with(Priority::Normal, false, move |_: &Cancellable| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        bus.register("test", subs);

        let event = Cancellable {
            cancel: CancelFlag::new(),
        };
        event.cancel.cancel();
        bus.fire_sync(&event);

        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(always.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }

    #[test]
    fn test_handler_cancels_later_handlers_sync() {
        let bus = EventBus::new(1);
        let late = Arc::new(AtomicUsize::new(0));

        let mut subs = Subscriptions::new();
        subs.on(Priority::Highest, move |e: &Cancellable| {
            e.cancel.cancel();
        });
        let l = late.clone();
        subs.on_with(Priority::Lowest, true, move |_: &Cancellable| {
            l.fetch_add(1, Ordering::SeqCst);
        });
        bus.register("test", subs);

        bus.fire_sync(&Cancellable {
            cancel: CancelFlag::new(),
        });
        assert_eq!(late.load(Ordering::SeqCst), 0);
        bus.shutdown();
    }

    #[test]
    fn test_unregister_removes_all_owner_handlers() {
        let bus = EventBus::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut subs = Subscriptions::new();
        let c = counter.clone();
        subs.on(Priority::Normal, move |_: &Ping| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.register("gone", subs);
        assert_eq!(bus.handler_count::<Ping>(), 1);

        bus.unregister("gone");
        assert_eq!(bus.handler_count::<Ping>(), 0);

        bus.fire_sync(&Ping { value: 1 });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        bus.shutdown();
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut subs = Subscriptions::new();
        subs.on(Priority::Highest, move |_: &Ping| panic!("intentional"));
        let c = counter.clone();
        subs.on(Priority::Lowest, move |_: &Ping| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.register("test", subs);

        bus.fire_sync(&Ping { value: 1 });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        bus.shutdown();
    }
}
