//! Crate-internal worker pools and the delay queue behind the scheduler,
//! event bus, file watcher, and reload orchestrator.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counters shared with [`crate::scheduler::SchedulerStats`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PoolStats {
    pub active: usize,
    pub completed: u64,
    pub submitted: u64,
}

struct PoolShared {
    name: String,
    active: AtomicUsize,
    completed: AtomicU64,
    live_workers: Mutex<usize>,
    drained: Condvar,
}

/// Fixed-size worker pool fed by an unbounded channel.
///
/// Panics inside a job are contained and logged; they never take a worker
/// down. Shutdown drains queued jobs, then waits out a grace period for
/// in-flight work before abandoning the threads.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    tx: Mutex<Option<Sender<Job>>>,
    submitted: AtomicU64,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            active: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            live_workers: Mutex::new(size),
            drained: Condvar::new(),
        });

        let (tx, rx) = unbounded::<Job>();
        for i in 0..size {
            let rx = rx.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        shared.active.fetch_add(1, AtomicOrdering::Relaxed);
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!("panic in {} worker task", shared.name);
                        }
                        shared.active.fetch_sub(1, AtomicOrdering::Relaxed);
                        shared.completed.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    let mut live = shared.live_workers.lock();
                    *live -= 1;
                    shared.drained.notify_all();
                })
                .expect("failed to spawn pool worker");
        }

        Self {
            shared,
            tx: Mutex::new(Some(tx)),
            submitted: AtomicU64::new(0),
            size,
        }
    }

    /// Submit a job. Jobs submitted after shutdown are dropped with a warning.
    pub(crate) fn execute(&self, job: Job) {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                self.submitted.fetch_add(1, AtomicOrdering::Relaxed);
                let _ = tx.send(job);
            }
            None => tracing::warn!("{} pool is shut down, dropping task", self.shared.name),
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.shared.active.load(AtomicOrdering::Relaxed),
            completed: self.shared.completed.load(AtomicOrdering::Relaxed),
            submitted: self.submitted.load(AtomicOrdering::Relaxed),
        }
    }

    /// Close the queue and wait up to `grace` for the workers to finish.
    ///
    /// Cancellation is cooperative: threads still running after the grace
    /// period are abandoned, not interrupted.
    pub(crate) fn shutdown(&self, grace: Duration) {
        if self.tx.lock().take().is_none() {
            return;
        }

        let deadline = Instant::now() + grace;
        let mut live = self.shared.live_workers.lock();
        while *live > 0 {
            if self
                .shared
                .drained
                .wait_until(&mut live, deadline)
                .timed_out()
            {
                tracing::warn!(
                    "{} pool did not drain within {:?}, abandoning {} worker(s)",
                    self.shared.name,
                    grace,
                    *live
                );
                return;
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("size", &self.size)
            .field("active", &self.shared.active.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerShared {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// Delay queue: a dedicated timer thread pops due entries off a binary
/// heap and hands them to a [`WorkerPool`].
pub(crate) struct TimerPool {
    shared: Arc<TimerShared>,
    pool: WorkerPool,
}

impl TimerPool {
    pub(crate) fn new(name: &str, workers: usize) -> Self {
        let shared = Arc::new(TimerShared {
            heap: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        let pool = WorkerPool::new(name, workers);

        let timer_shared = shared.clone();
        let timer_tx = pool.tx.lock().clone();
        thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || loop {
                let mut heap = timer_shared.heap.lock();
                if timer_shared.shutdown.load(AtomicOrdering::Relaxed) {
                    break;
                }
                match heap.peek().map(|e| e.at) {
                    None => {
                        timer_shared.wakeup.wait(&mut heap);
                    }
                    Some(at) if at <= Instant::now() => {
                        let entry = heap.pop().expect("peeked entry vanished");
                        drop(heap);
                        if let Some(tx) = timer_tx.as_ref() {
                            let _ = tx.send(entry.job);
                        }
                    }
                    Some(at) => {
                        timer_shared.wakeup.wait_until(&mut heap, at);
                    }
                }
            })
            .expect("failed to spawn timer thread");

        Self { shared, pool }
    }

    /// Run `job` after `delay`. Entries scheduled after shutdown are dropped.
    pub(crate) fn schedule(&self, delay: Duration, job: Job) {
        self.schedule_at(Instant::now() + delay, job);
    }

    /// Run `job` at `at`.
    pub(crate) fn schedule_at(&self, at: Instant, job: Job) {
        if self.shared.shutdown.load(AtomicOrdering::Relaxed) {
            return;
        }
        let seq = self.shared.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.shared.heap.lock().push(TimerEntry { at, seq, job });
        self.shared.wakeup.notify_one();
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop the timer, drop pending entries, and drain the worker pool.
    pub(crate) fn shutdown(&self, grace: Duration) {
        self.shared.shutdown.store(true, AtomicOrdering::Relaxed);
        self.shared.heap.lock().clear();
        self.shared.wakeup.notify_all();
        self.pool.shutdown(grace);
    }
}

impl std::fmt::Debug for TimerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerPool")
            .field("pending", &self.shared.heap.lock().len())
            .field("pool", &self.pool)
            .finish()
    }
}
