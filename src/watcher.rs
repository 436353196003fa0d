//! Bundle directory watching with stability gating.
//!
//! Raw filesystem events are noisy: editors and copiers write in many
//! small bursts. The watcher only fires its callback once a file's
//! `(size, mtime)` identity has stopped changing: an event schedules a
//! settle check, the settle check snapshots the identity and schedules a
//! short verification re-read, and any drift between the two loops back
//! to the start. A periodic rescan catches changes the event channel
//! missed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, UNIX_EPOCH};

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pool::TimerPool;

/// Configuration for [`BundleWatcher`].
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// How long a file must sit quiet after an event before the first
    /// stability read.
    pub stability_wait: Duration,
    /// Delay between the stability snapshot and its verification re-read.
    pub verify_delay: Duration,
    /// Delay before the first drift rescan.
    pub rescan_initial_delay: Duration,
    /// Interval between drift rescans.
    pub rescan_interval: Duration,
    /// File extensions that count as bundles.
    pub extensions: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            stability_wait: Duration::from_millis(500),
            verify_delay: Duration::from_millis(200),
            rescan_initial_delay: Duration::from_secs(10),
            rescan_interval: Duration::from_secs(30),
            extensions: vec!["plugin".to_string()],
        }
    }
}

impl WatchConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stability wait.
    pub fn with_stability_wait(mut self, wait: Duration) -> Self {
        self.stability_wait = wait;
        self
    }

    /// Set the verification delay.
    pub fn with_verify_delay(mut self, delay: Duration) -> Self {
        self.verify_delay = delay;
        self
    }

    /// Set the rescan cadence.
    pub fn with_rescan_interval(mut self, initial: Duration, interval: Duration) -> Self {
        self.rescan_initial_delay = initial;
        self.rescan_interval = interval;
        self
    }

    /// Set the watched extensions.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }
}

/// Lightweight change-detection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    size: u64,
    modified_ms: u64,
}

fn identity(path: &Path) -> Option<FileIdentity> {
    let meta = fs::metadata(path).ok()?;
    let modified_ms = meta
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_millis() as u64;
    Some(FileIdentity {
        size: meta.len(),
        modified_ms,
    })
}

type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

struct WatcherInner {
    dir: PathBuf,
    config: WatchConfig,
    callback: ChangeCallback,
    states: DashMap<PathBuf, FileIdentity>,
    // Path -> generation of the newest pending stability check. Inserting
    // a fresh generation atomically supersedes (cancels) the old check.
    pending: DashMap<PathBuf, u64>,
    generation: AtomicU64,
    timer: TimerPool,
    running: AtomicBool,
}

impl WatcherInner {
    fn is_watched(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.config.extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }

    fn scan_initial(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() && self.is_watched(&path) {
                if let Some(id) = identity(&path) {
                    self.states.insert(path, id);
                }
            }
        }
    }

    /// Drop tracking for missing files and fire callbacks for identity
    /// drift the event channel missed.
    fn rescan(&self) {
        let tracked: Vec<PathBuf> = self.states.iter().map(|e| e.key().clone()).collect();
        for path in tracked {
            match identity(&path) {
                None => {
                    self.states.remove(&path);
                    tracing::info!("file no longer exists, dropping: {}", path.display());
                }
                Some(current) => {
                    let stored = self.states.get(&path).map(|r| *r.value());
                    if stored != Some(current) {
                        tracing::info!("drift detected on rescan: {}", path.display());
                        self.states.insert(path.clone(), current);
                        (self.callback)(&path);
                    }
                }
            }
        }
    }
}

fn handle_event(inner: &Arc<WatcherInner>, event: Event) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => {
            for path in event.paths {
                if inner.is_watched(&path) {
                    tracing::debug!("file event for {}", path.display());
                    schedule_stability_check(inner, path);
                }
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths {
                if inner.is_watched(&path) {
                    inner.states.remove(&path);
                    tracing::info!("file deleted: {}", path.display());
                }
            }
        }
        _ => {}
    }
}

/// Atomically cancel any pending check for `path` and schedule a new one:
/// the newest generation written to the pending map wins, and a check
/// that wakes up to find a different generation drops itself.
fn schedule_stability_check(inner: &Arc<WatcherInner>, path: PathBuf) {
    let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
    if inner.pending.insert(path.clone(), generation).is_some() {
        tracing::debug!(
            "superseding pending check for {} - file still changing",
            path.display()
        );
    }
    let job_inner = inner.clone();
    inner.timer.schedule(
        inner.config.stability_wait,
        Box::new(move || check_stability(&job_inner, path, generation)),
    );
}

fn check_stability(inner: &Arc<WatcherInner>, path: PathBuf, generation: u64) {
    if !inner.running.load(Ordering::Relaxed) {
        return;
    }
    match inner.pending.get(&path).map(|g| *g.value()) {
        Some(current) if current == generation => {}
        _ => return,
    }
    inner.pending.remove_if(&path, |_, g| *g == generation);

    let Some(current) = identity(&path) else {
        tracing::debug!("file no longer exists, skipping: {}", path.display());
        return;
    };

    if inner.states.get(&path).map(|r| *r.value()) == Some(current) {
        tracing::debug!("file unchanged, skipping: {}", path.display());
        return;
    }

    // Snapshot now; verify the same fields again shortly.
    let job_inner = inner.clone();
    inner.timer.schedule(
        inner.config.verify_delay,
        Box::new(move || verify_stability(&job_inner, path, current)),
    );
}

fn verify_stability(inner: &Arc<WatcherInner>, path: PathBuf, snapshot: FileIdentity) {
    if !inner.running.load(Ordering::Relaxed) {
        return;
    }
    let Some(current) = identity(&path) else {
        tracing::debug!("file deleted during stability check: {}", path.display());
        return;
    };

    if current != snapshot {
        tracing::debug!(
            "file still changing, rescheduling stability check: {}",
            path.display()
        );
        schedule_stability_check(inner, path);
        return;
    }

    inner.states.insert(path.clone(), current);
    tracing::info!("file stable and changed: {}", path.display());
    (inner.callback)(&path);
}

fn schedule_rescan(inner: Arc<WatcherInner>, delay: Duration) {
    let timer_inner = inner.clone();
    timer_inner.timer.schedule(
        delay,
        Box::new(move || {
            if !inner.running.load(Ordering::Relaxed) {
                return;
            }
            inner.rescan();
            let interval = inner.config.rescan_interval;
            schedule_rescan(inner.clone(), interval);
        }),
    );
}

/// Watches one directory for bundle creation, modification, and deletion,
/// invoking the change callback only for stable changes.
pub struct BundleWatcher {
    inner: Arc<WatcherInner>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl BundleWatcher {
    /// Create a watcher over `dir` delivering stable changes to `callback`.
    pub fn new<F>(dir: impl Into<PathBuf>, config: WatchConfig, callback: F) -> Self
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WatcherInner {
                dir: dir.into(),
                config,
                callback: Arc::new(callback),
                states: DashMap::new(),
                pending: DashMap::new(),
                generation: AtomicU64::new(0),
                timer: TimerPool::new("file-watcher", 2),
                running: AtomicBool::new(false),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Start watching: take a baseline of existing bundles, register with
    /// the platform watcher, and begin the periodic drift rescan.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        self.inner.scan_initial();

        let weak: Weak<WatcherInner> = Arc::downgrade(&self.inner);
        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.running.load(Ordering::Relaxed) {
                    return;
                }
                match result {
                    Ok(event) => handle_event(&inner, event),
                    Err(err) => tracing::warn!("watch error: {}", err),
                }
            },
            notify::Config::default(),
        )
        .map_err(|err| Error::Watch(err.to_string()))?;

        watcher
            .watch(&self.inner.dir, RecursiveMode::NonRecursive)
            .map_err(|err| {
                self.inner.running.store(false, Ordering::Relaxed);
                Error::Watch(err.to_string())
            })?;
        *self.watcher.lock() = Some(watcher);

        schedule_rescan(self.inner.clone(), self.inner.config.rescan_initial_delay);

        tracing::info!("file watcher started for {}", self.inner.dir.display());
        Ok(())
    }

    /// Stop watching and release the timer threads.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::Relaxed) {
            return;
        }
        *self.watcher.lock() = None;
        self.inner.timer.shutdown(Duration::from_secs(2));
        tracing::info!("file watcher stopped");
    }

    /// Whether the watcher is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Files currently tracked with a stable identity.
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        self.inner.states.iter().map(|e| e.key().clone()).collect()
    }
}

impl Drop for BundleWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BundleWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleWatcher")
            .field("dir", &self.inner.dir)
            .field("running", &self.is_running())
            .field("tracked", &self.inner.states.len())
            .finish()
    }
}
