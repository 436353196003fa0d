//! Task scheduling: one-shot, fixed-rate, fixed-delay, and immediate
//! background tasks with cooperative cancellation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::pool::{TimerPool, WorkerPool};

/// Pool sizes and shutdown behavior for [`TaskScheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Workers serving delayed and periodic tasks.
    pub scheduled_workers: usize,
    /// Workers serving immediate background tasks.
    pub async_workers: usize,
    /// How long shutdown waits for each pool to drain before abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduled_workers: 4,
            async_workers: 8,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheduled pool size.
    pub fn with_scheduled_workers(mut self, workers: usize) -> Self {
        self.scheduled_workers = workers;
        self
    }

    /// Set the async pool size.
    pub fn with_async_workers(mut self, workers: usize) -> Self {
        self.async_workers = workers;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[derive(Debug, Default)]
struct TaskFlags {
    cancelled: AtomicBool,
    interrupted: AtomicBool,
    done: AtomicBool,
}

/// Handle to a scheduled task.
///
/// Cancellation is cooperative: a cancelled task is never started again,
/// but a body already running is not interrupted. [`ScheduledTask::cancel_now`]
/// additionally raises an interrupt flag that long-running bodies may poll
/// through [`ScheduledTask::is_interrupted`].
#[derive(Clone)]
pub struct ScheduledTask {
    id: u64,
    repeating: bool,
    created: Instant,
    flags: Arc<TaskFlags>,
}

impl ScheduledTask {
    fn new(id: u64, repeating: bool) -> Self {
        Self {
            id,
            repeating,
            created: Instant::now(),
            flags: Arc::new(TaskFlags::default()),
        }
    }

    /// Task id, unique per scheduler.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the task re-arms itself.
    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::Relaxed)
    }

    /// Whether an interrupting cancel was requested.
    pub fn is_interrupted(&self) -> bool {
        self.flags.interrupted.load(Ordering::Relaxed)
    }

    /// Whether the task finished (completed or cancelled-and-reaped).
    pub fn is_done(&self) -> bool {
        self.flags.done.load(Ordering::Relaxed)
    }

    /// Time since the task was created.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Cancel without interrupting. Returns `false` when the task already
    /// completed or was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.flags.done.load(Ordering::Relaxed) {
            return false;
        }
        !self.flags.cancelled.swap(true, Ordering::Relaxed)
    }

    /// Cancel and raise the interrupt flag for cooperative bodies.
    pub fn cancel_now(&self) -> bool {
        self.flags.interrupted.store(true, Ordering::Relaxed);
        self.cancel()
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("repeating", &self.repeating)
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Result handle for [`TaskScheduler::run_async`].
pub struct TaskHandle<T> {
    rx: Receiver<std::result::Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(msg)) => Err(Error::plugin(msg)),
            Err(_) => Err(Error::plugin("async task was dropped before completing")),
        }
    }

    /// Block up to `timeout` for the task to complete. `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Some(Ok(value)),
            Ok(Err(msg)) => Some(Err(Error::plugin(msg))),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err(Error::plugin("async task was dropped before completing")))
            }
        }
    }
}

/// Scheduler statistics: the active-task table plus both pools' internals.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    /// Tracked tasks that have not yet completed.
    pub active_tasks: usize,
    /// Scheduled-pool workers currently running a body.
    pub scheduled_active: usize,
    /// Bodies the scheduled pool has finished.
    pub scheduled_completed: u64,
    /// Bodies ever handed to the scheduled pool.
    pub scheduled_total: u64,
    /// Async-pool workers currently running a body.
    pub async_active: usize,
    /// Bodies the async pool has finished.
    pub async_completed: u64,
    /// Bodies ever handed to the async pool.
    pub async_total: u64,
}

struct SchedulerInner {
    timer: TimerPool,
    async_pool: WorkerPool,
    counter: AtomicU64,
    active: DashMap<u64, ScheduledTask>,
    grace: Duration,
    shutdown: AtomicBool,
}

/// Two-pool task scheduler: a delay queue for timed work and an async pool
/// for immediate background work. Task bodies never propagate panics; a
/// failing body is logged and, for one-shot tasks, still removes itself
/// from the active table.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Create a scheduler from `config`.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                timer: TimerPool::new("scheduler", config.scheduled_workers),
                async_pool: WorkerPool::new("async-task", config.async_workers),
                counter: AtomicU64::new(0),
                active: DashMap::new(),
                grace: config.shutdown_grace,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Create a scheduler with explicit pool sizes.
    pub fn with_sizes(scheduled_workers: usize, async_workers: usize) -> Self {
        Self::new(
            SchedulerConfig::new()
                .with_scheduled_workers(scheduled_workers)
                .with_async_workers(async_workers),
        )
    }

    /// Schedule a one-shot task after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id();
        let handle = ScheduledTask::new(id, false);
        self.inner.active.insert(id, handle.clone());

        let inner = self.inner.clone();
        let flags = handle.flags.clone();
        self.inner.timer.schedule(
            delay,
            Box::new(move || {
                if !flags.cancelled.load(Ordering::Relaxed) {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!("error executing scheduled task {}", id);
                    }
                }
                flags.done.store(true, Ordering::Relaxed);
                inner.active.remove(&id);
            }),
        );

        handle
    }

    /// Schedule a fixed-rate repeating task; missed ticks coalesce instead
    /// of bunching up.
    pub fn schedule_repeating<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_periodic(initial_delay, period, true, task)
    }

    /// Schedule a repeating task with a fixed delay between the end of one
    /// run and the start of the next.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_periodic(initial_delay, delay, false, task)
    }

    fn schedule_periodic<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        fixed_rate: bool,
        task: F,
    ) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id();
        let handle = ScheduledTask::new(id, true);
        self.inner.active.insert(id, handle.clone());

        let first_at = Instant::now() + initial_delay;
        tick(
            self.inner.clone(),
            id,
            handle.flags.clone(),
            Arc::new(task),
            first_at,
            period,
            fixed_rate,
        );

        handle
    }

    /// Submit a task to the async pool right away. The returned handle
    /// yields the task's result.
    pub fn run_async<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.inner.async_pool.execute(Box::new(move || {
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                }
                Err(_) => {
                    tracing::error!("error executing async task");
                    let _ = tx.send(Err("async task panicked".to_string()));
                }
            }
        }));
        TaskHandle { rx }
    }

    /// Cancel a tracked task. Idempotent: returns `false` when the task is
    /// unknown, already completed, or already cancelled.
    pub fn cancel(&self, id: u64) -> bool {
        match self.inner.active.remove(&id) {
            Some((_, task)) => task.cancel(),
            None => false,
        }
    }

    /// Cancel a tracked task and raise its interrupt flag.
    pub fn cancel_now(&self, id: u64) -> bool {
        match self.inner.active.remove(&id) {
            Some((_, task)) => task.cancel_now(),
            None => false,
        }
    }

    /// Cancel every tracked task.
    pub fn cancel_all(&self) {
        for entry in self.inner.active.iter() {
            entry.value().cancel();
        }
        self.inner.active.clear();
    }

    /// Whether a task id is still tracked.
    pub fn is_active(&self, id: u64) -> bool {
        self.inner.active.contains_key(&id)
    }

    /// Number of tracked tasks.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Ids of all tracked tasks.
    pub fn active_ids(&self) -> Vec<u64> {
        self.inner.active.iter().map(|e| *e.key()).collect()
    }

    /// Scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        let scheduled = self.inner.timer.stats();
        let async_ = self.inner.async_pool.stats();
        SchedulerStats {
            active_tasks: self.inner.active.len(),
            scheduled_active: scheduled.active,
            scheduled_completed: scheduled.completed,
            scheduled_total: scheduled.submitted,
            async_active: async_.active,
            async_completed: async_.completed,
            async_total: async_.submitted,
        }
    }

    /// Whether [`TaskScheduler::shutdown`] has run.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Relaxed)
    }

    /// Cancel everything and stop both pools, waiting out the configured
    /// grace period for each before abandoning stragglers.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::info!("shutting down task scheduler");
        self.cancel_all();
        self.inner.timer.shutdown(self.inner.grace);
        self.inner.async_pool.shutdown(self.inner.grace);
        tracing::info!("task scheduler shutdown complete");
    }

    fn next_id(&self) -> u64 {
        self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("active_tasks", &self.inner.active.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// One execution of a periodic task, re-arming itself afterwards.
fn tick(
    inner: Arc<SchedulerInner>,
    id: u64,
    flags: Arc<TaskFlags>,
    task: Arc<dyn Fn() + Send + Sync>,
    at: Instant,
    period: Duration,
    fixed_rate: bool,
) {
    let timer = inner.clone();
    timer.timer.schedule_at(
        at,
        Box::new(move || {
            if flags.cancelled.load(Ordering::Relaxed) {
                flags.done.store(true, Ordering::Relaxed);
                inner.active.remove(&id);
                return;
            }

            if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                tracing::error!("error executing repeating task {}", id);
            }

            if flags.cancelled.load(Ordering::Relaxed)
                || inner.shutdown.load(Ordering::Relaxed)
            {
                flags.done.store(true, Ordering::Relaxed);
                inner.active.remove(&id);
                return;
            }

            let next = if fixed_rate {
                // Coalesce missed ticks rather than firing them back to back.
                let mut next = at + period;
                let now = Instant::now();
                if next < now {
                    next = now;
                }
                next
            } else {
                Instant::now() + period
            };
            tick(inner.clone(), id, flags.clone(), task.clone(), next, period, fixed_rate);
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_one_shot_runs_and_untracks() {
        let scheduler = TaskScheduler::with_sizes(2, 2);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let task = scheduler.schedule(Duration::from_millis(20), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.is_active(task.id()));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_active(task.id()));
        assert!(task.is_done());
        scheduler.shutdown();
    }

    #[test]
    fn test_one_shot_untracks_on_panic() {
        let scheduler = TaskScheduler::with_sizes(1, 1);
        let task = scheduler.schedule(Duration::from_millis(10), || panic!("intentional"));

        thread::sleep(Duration::from_millis(200));
        assert!(!scheduler.is_active(task.id()));
        scheduler.shutdown();
    }

    #[test]
    fn test_repeating_task() {
        let scheduler = TaskScheduler::with_sizes(2, 1);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let task = scheduler.schedule_repeating(
            Duration::from_millis(10),
            Duration::from_millis(30),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        thread::sleep(Duration::from_millis(320));
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 runs, saw {}", seen);

        assert!(scheduler.cancel(task.id()));
        let at_cancel = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        let after = counter.load(Ordering::SeqCst);
        assert!(after <= at_cancel + 1, "task kept running after cancel");
        scheduler.shutdown();
    }

    #[test]
    fn test_cancel_before_fire() {
        let scheduler = TaskScheduler::with_sizes(1, 1);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let task = scheduler.schedule(Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(task.id()));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let scheduler = TaskScheduler::with_sizes(1, 1);
        let task = scheduler.schedule(Duration::from_secs(60), || {});

        assert!(scheduler.cancel(task.id()));
        assert!(!scheduler.cancel(task.id()));
        assert!(!task.cancel());

        // Cancelling a completed task also returns false.
        let done = scheduler.schedule(Duration::from_millis(5), || {});
        thread::sleep(Duration::from_millis(150));
        assert!(!scheduler.cancel(done.id()));
        scheduler.shutdown();
    }

    #[test]
    fn test_monotonic_ids() {
        let scheduler = TaskScheduler::with_sizes(1, 1);
        let a = scheduler.schedule(Duration::from_secs(60), || {});
        let b = scheduler.schedule(Duration::from_secs(60), || {});
        assert!(b.id() > a.id());
        scheduler.shutdown();
    }

    #[test]
    fn test_run_async_result() {
        let scheduler = TaskScheduler::with_sizes(1, 2);
        let handle = scheduler.run_async(|| 6 * 7);
        assert_eq!(handle.wait().unwrap(), 42);

        let handle: TaskHandle<()> = scheduler.run_async(|| panic!("intentional"));
        assert!(handle.wait().is_err());
        scheduler.shutdown();
    }

    #[test]
    fn test_cancel_all_and_stats() {
        let scheduler = TaskScheduler::with_sizes(1, 1);
        scheduler.schedule(Duration::from_secs(60), || {});
        scheduler.schedule(Duration::from_secs(60), || {});
        assert_eq!(scheduler.active_count(), 2);
        assert_eq!(scheduler.stats().active_tasks, 2);

        scheduler.cancel_all();
        assert_eq!(scheduler.active_count(), 0);
        scheduler.shutdown();
        assert!(scheduler.is_shutdown());
    }
}
