//! Hot reload: the multi-phase, state-preserving swap of a running
//! plugin's code, with file-level rollback.
//!
//! At most one reload is in flight per plugin name; reloads of distinct
//! plugins run concurrently on the reload pool. Before the old instance
//! is torn down the bundle file is copied aside, and any failure in a
//! later phase restores it byte-for-byte and re-loads the old version, so
//! a failed reload ends with the plugin enabled (rolled back) or in the
//! error state, never silently disabled.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::manager::PluginManager;
use crate::pool::{TimerPool, WorkerPool};
use crate::snapshot::{SnapshotStore, StateSnapshot};
use crate::watcher::{BundleWatcher, WatchConfig};

/// Phases of a reload operation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadPhase {
    /// Setup before the first real phase.
    Initializing,
    /// Plugin exists, is enabled, and agrees to be reloaded.
    Validating,
    /// Capturing config, custom data, and active task ids.
    CapturingState,
    /// Letting the plugin finish in-flight work, with a timeout.
    GracefulShutdown,
    /// Disabling and unloading the old instance.
    Disabling,
    /// Loading and registering the new instance.
    LoadingNewVersion,
    /// Restoring the captured state into the new instance.
    RestoringState,
    /// Enabling the new instance.
    Enabling,
    /// Done.
    Completed,
    /// Undoing a failed reload.
    RollingBack,
}

impl std::fmt::Display for ReloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Validating => "validating",
            Self::CapturingState => "capturing-state",
            Self::GracefulShutdown => "graceful-shutdown",
            Self::Disabling => "disabling",
            Self::LoadingNewVersion => "loading-new-version",
            Self::RestoringState => "restoring-state",
            Self::Enabling => "enabling",
            Self::Completed => "completed",
            Self::RollingBack => "rolling-back",
        };
        write!(f, "{}", name)
    }
}

/// Options controlling one reload attempt.
#[derive(Debug, Clone)]
pub struct ReloadOptions {
    /// Capture and restore runtime state across the swap.
    pub preserve_state: bool,
    /// Proceed even when validation or graceful shutdown fails.
    pub force: bool,
    /// Explicitly clear the loader's staging for the plugin before
    /// loading the new version.
    pub clear_staging: bool,
    /// How long to wait for the plugin's `prepare_for_reload`.
    pub shutdown_timeout: Duration,
}

impl Default for ReloadOptions {
    fn default() -> Self {
        Self {
            preserve_state: true,
            force: false,
            clear_staging: true,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ReloadOptions {
    /// Safe defaults for operator-initiated reloads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options used for watcher-triggered reloads: same behavior with a
    /// shorter shutdown timeout.
    pub fn auto() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Force the reload through validation and shutdown timeouts.
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

/// Outcome of a reload attempt, with per-phase timings.
#[derive(Debug, Clone)]
pub struct ReloadResult {
    /// Whether the reload completed.
    pub success: bool,
    /// Plugin that was reloaded.
    pub plugin: String,
    /// Total duration.
    pub duration: Duration,
    /// Whether captured state was restored into the new instance.
    pub state_preserved: bool,
    /// The phase that failed, for unsuccessful reloads.
    pub failed_phase: Option<ReloadPhase>,
    /// Failure description, for unsuccessful reloads.
    pub error: Option<String>,
    /// Duration of each phase that ran.
    pub phases: Vec<(ReloadPhase, Duration)>,
}

impl ReloadResult {
    fn success(
        plugin: &str,
        duration: Duration,
        state_preserved: bool,
        phases: Vec<(ReloadPhase, Duration)>,
    ) -> Self {
        Self {
            success: true,
            plugin: plugin.to_string(),
            duration,
            state_preserved,
            failed_phase: None,
            error: None,
            phases,
        }
    }

    fn failure(
        plugin: &str,
        phase: ReloadPhase,
        error: impl Into<String>,
        duration: Duration,
        phases: Vec<(ReloadPhase, Duration)>,
    ) -> Self {
        Self {
            success: false,
            plugin: plugin.to_string(),
            duration,
            state_preserved: false,
            failed_phase: Some(phase),
            error: Some(error.into()),
            phases,
        }
    }
}

/// Configuration for [`HotReloadOrchestrator`].
#[derive(Debug, Clone)]
pub struct ReloadConfig {
    /// React to bundle changes automatically.
    pub auto_reload: bool,
    /// Reloads of distinct plugins allowed in flight at once.
    pub max_concurrent_reloads: usize,
    /// Extra debounce applied to watcher-triggered reloads.
    pub debounce: Duration,
    /// Directory for state snapshots and rollback backups.
    pub state_dir: PathBuf,
    /// Watcher configuration for auto reload.
    pub watch: WatchConfig,
}

impl ReloadConfig {
    /// Create a configuration with snapshots under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            auto_reload: true,
            max_concurrent_reloads: 3,
            debounce: Duration::from_secs(1),
            state_dir: state_dir.into(),
            watch: WatchConfig::default(),
        }
    }

    /// Enable or disable automatic reloads.
    pub fn with_auto_reload(mut self, auto: bool) -> Self {
        self.auto_reload = auto;
        self
    }

    /// Set the concurrent reload limit.
    pub fn with_max_concurrent_reloads(mut self, max: usize) -> Self {
        self.max_concurrent_reloads = max;
        self
    }

    /// Set the orchestrator-level debounce for auto reloads.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the watcher configuration.
    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }
}

/// Tracks phase timings for one reload.
struct ReloadOperation {
    current: ReloadPhase,
    phase_started: Instant,
    phases: Vec<(ReloadPhase, Duration)>,
}

impl ReloadOperation {
    fn new() -> Self {
        Self {
            current: ReloadPhase::Initializing,
            phase_started: Instant::now(),
            phases: Vec::new(),
        }
    }

    fn set_phase(&mut self, phase: ReloadPhase) {
        let elapsed = self.phase_started.elapsed();
        self.phases.push((self.current, elapsed));
        tracing::debug!("reload phase {} -> {} ({:?})", self.current, phase, elapsed);
        self.current = phase;
        self.phase_started = Instant::now();
    }

    fn finish(mut self) -> Vec<(ReloadPhase, Duration)> {
        let elapsed = self.phase_started.elapsed();
        self.phases.push((self.current, elapsed));
        self.phases
    }
}

struct ReloadInner {
    manager: Arc<PluginManager>,
    snapshots: SnapshotStore,
    config: ReloadConfig,
    pool: WorkerPool,
    trigger: TimerPool,
    active: DashMap<String, Arc<AtomicBool>>,
}

/// Handle to an asynchronous reload started with
/// [`HotReloadOrchestrator::reload_async`].
pub struct ReloadTicket {
    plugin: String,
    rx: Receiver<ReloadResult>,
}

impl ReloadTicket {
    /// Block until the reload finishes.
    pub fn wait(self) -> ReloadResult {
        let plugin = self.plugin;
        self.rx.recv().unwrap_or_else(|_| {
            ReloadResult::failure(
                &plugin,
                ReloadPhase::Initializing,
                "reload worker exited before completing",
                Duration::ZERO,
                Vec::new(),
            )
        })
    }

    /// Block up to `timeout` for the reload to finish.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ReloadResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ReloadResult::failure(
                &self.plugin,
                ReloadPhase::Initializing,
                "reload worker exited before completing",
                Duration::ZERO,
                Vec::new(),
            )),
        }
    }
}

/// Orchestrates state-preserving plugin reloads and the automatic trigger
/// wired to the bundle watcher.
pub struct HotReloadOrchestrator {
    inner: Arc<ReloadInner>,
    watcher: Mutex<Option<BundleWatcher>>,
}

impl HotReloadOrchestrator {
    /// Create an orchestrator driving `manager`.
    pub fn new(manager: Arc<PluginManager>, config: ReloadConfig) -> Result<Self> {
        let snapshots = SnapshotStore::new(&config.state_dir)?;
        let pool = WorkerPool::new("hot-reload", config.max_concurrent_reloads);
        let trigger = TimerPool::new("reload-trigger", 1);

        Ok(Self {
            inner: Arc::new(ReloadInner {
                manager,
                snapshots,
                config,
                pool,
                trigger,
                active: DashMap::new(),
            }),
            watcher: Mutex::new(None),
        })
    }

    /// The snapshot store.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.inner.snapshots
    }

    /// Begin watching the plugin directory for automatic reloads. No-op
    /// when auto reload is disabled.
    pub fn start_watching(&self) -> Result<()> {
        if !self.inner.config.auto_reload {
            tracing::debug!("auto reload disabled, not watching");
            return Ok(());
        }

        let weak: Weak<ReloadInner> = Arc::downgrade(&self.inner);
        let watcher = BundleWatcher::new(
            self.inner.manager.plugin_dir(),
            self.inner.config.watch.clone(),
            move |path| {
                if let Some(inner) = weak.upgrade() {
                    on_file_changed(&inner, path);
                }
            },
        );
        watcher.start()?;
        *self.watcher.lock() = Some(watcher);
        tracing::info!("hot reload file watching started");
        Ok(())
    }

    /// Stop watching for automatic reloads.
    pub fn stop_watching(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
            tracing::info!("hot reload file watching stopped");
        }
    }

    /// Stop watching and drain the reload pool.
    pub fn shutdown(&self) {
        self.stop_watching();
        self.inner.trigger.shutdown(Duration::from_secs(2));
        self.inner.pool.shutdown(Duration::from_secs(5));
    }

    /// Whether a reload for `name` is currently in flight.
    pub fn is_reloading(&self, name: &str) -> bool {
        self.inner.active.contains_key(name)
    }

    /// Raise the cancellation flag of an in-flight reload. The flag is
    /// checked at phase boundaries; in-flight phase work is not
    /// interrupted. Returns whether a reload was active.
    pub fn cancel(&self, name: &str) -> bool {
        match self.inner.active.get(name) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Reload `name` synchronously with default options.
    pub fn reload(&self, name: &str) -> ReloadResult {
        self.reload_with(name, ReloadOptions::default())
    }

    /// Reload `name` synchronously.
    pub fn reload_with(&self, name: &str, options: ReloadOptions) -> ReloadResult {
        perform(&self.inner, name, options)
    }

    /// Reload `name` on the reload pool, returning a ticket for the
    /// result.
    pub fn reload_async(&self, name: &str, options: ReloadOptions) -> ReloadTicket {
        let (tx, rx) = bounded(1);
        let inner = self.inner.clone();
        let plugin = name.to_string();
        let job_plugin = plugin.clone();
        self.inner.pool.execute(Box::new(move || {
            let result = perform(&inner, &job_plugin, options);
            let _ = tx.send(result);
        }));
        ReloadTicket { plugin, rx }
    }
}

impl std::fmt::Debug for HotReloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotReloadOrchestrator")
            .field("active", &self.inner.active.len())
            .field("auto_reload", &self.inner.config.auto_reload)
            .finish()
    }
}

impl Drop for HotReloadOrchestrator {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

/// Watcher callback: identify the plugin from the changed bundle and
/// enqueue a debounced auto reload.
fn on_file_changed(inner: &Arc<ReloadInner>, path: &Path) {
    if !inner.config.auto_reload {
        return;
    }
    let metadata = match inner.manager.loader().load_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::error!("cannot identify changed bundle {}: {}", path.display(), err);
            return;
        }
    };
    let name = metadata.name;

    let trigger_inner = inner.clone();
    inner.trigger.schedule(
        inner.config.debounce,
        Box::new(move || {
            if trigger_inner.active.contains_key(&name) {
                tracing::debug!("reload already in flight for {}, skipping trigger", name);
                return;
            }
            tracing::info!("file change detected, auto-reloading plugin {}", name);
            let result = perform(&trigger_inner, &name, ReloadOptions::auto());
            if result.success {
                tracing::info!("auto-reload successful for {}", name);
            } else {
                tracing::warn!(
                    "auto-reload failed for {}: {}",
                    name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }),
    );
}

/// Run one reload under the per-plugin in-flight guard.
fn perform(inner: &Arc<ReloadInner>, name: &str, options: ReloadOptions) -> ReloadResult {
    let cancel = Arc::new(AtomicBool::new(false));
    match inner.active.entry(name.to_string()) {
        Entry::Occupied(_) => {
            return ReloadResult::failure(
                name,
                ReloadPhase::Initializing,
                "plugin is already being reloaded",
                Duration::ZERO,
                Vec::new(),
            );
        }
        Entry::Vacant(vacant) => {
            vacant.insert(cancel.clone());
        }
    }

    let result = run_phases(inner, name, &options, &cancel);
    inner.active.remove(name);
    result
}

fn run_phases(
    inner: &Arc<ReloadInner>,
    name: &str,
    options: &ReloadOptions,
    cancel: &AtomicBool,
) -> ReloadResult {
    let start = Instant::now();
    let mut op = ReloadOperation::new();
    tracing::info!("starting hot reload for plugin {}", name);

    let fail = |op: ReloadOperation, phase: ReloadPhase, reason: String| {
        tracing::warn!("hot reload failed for {} during {}: {}", name, phase, reason);
        ReloadResult::failure(name, phase, reason, start.elapsed(), op.finish())
    };

    // Phase 1: validation.
    op.set_phase(ReloadPhase::Validating);
    let Some(handle) = inner.manager.get(name) else {
        return fail(op, ReloadPhase::Validating, format!("plugin not found: {}", name));
    };
    if !inner.manager.registry().is_enabled(name) {
        return fail(
            op,
            ReloadPhase::Validating,
            format!("plugin {} is not enabled", name),
        );
    }
    if !options.force {
        if let Some(aware) = handle.instance().hot_reload() {
            if !aware.can_hot_reload() {
                return fail(
                    op,
                    ReloadPhase::Validating,
                    format!("plugin {} declined hot reload", name),
                );
            }
        }
    }

    let bundle = handle.metadata().source.clone();

    // Phase 2: state capture.
    op.set_phase(ReloadPhase::CapturingState);
    let snapshot: Option<StateSnapshot> = if options.preserve_state {
        match inner.snapshots.capture(&handle) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                return fail(op, ReloadPhase::CapturingState, err.to_string());
            }
        }
    } else {
        None
    };

    if cancel.load(Ordering::Relaxed) {
        return fail(op, ReloadPhase::CapturingState, "reload cancelled".to_string());
    }

    // Phase 3: graceful shutdown with timeout.
    op.set_phase(ReloadPhase::GracefulShutdown);
    if handle.instance().hot_reload().is_some() {
        let instance = handle.instance().clone();
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name(format!("reload-prepare-{}", name))
            .spawn(move || {
                if let Some(aware) = instance.hot_reload() {
                    aware.prepare_for_reload();
                }
                let _ = tx.send(());
            })
            .ok();

        match rx.recv_timeout(options.shutdown_timeout) {
            Ok(()) => {}
            Err(_) => {
                if options.force {
                    tracing::warn!("graceful shutdown timeout, forcing reload for {}", name);
                } else {
                    return fail(
                        op,
                        ReloadPhase::GracefulShutdown,
                        "graceful shutdown timeout".to_string(),
                    );
                }
            }
        }
    }

    if cancel.load(Ordering::Relaxed) {
        return fail(op, ReloadPhase::GracefulShutdown, "reload cancelled".to_string());
    }

    // Rollback backup of the bundle file, taken before anything is torn
    // down so a failed swap can restore it byte-for-byte.
    let rollback_backup = rollback_backup_path(inner, name, &bundle);
    if let Err(err) = fs::copy(&bundle, &rollback_backup) {
        return fail(
            op,
            ReloadPhase::GracefulShutdown,
            format!("failed to back up bundle: {}", err),
        );
    }

    // Phase 4: disable and unload the old instance.
    op.set_phase(ReloadPhase::Disabling);
    if let Err(err) = inner.manager.disable(name) {
        return rollback(inner, name, &bundle, &rollback_backup, op, start, err.to_string());
    }
    if let Err(err) = inner.manager.unload(name) {
        return rollback(inner, name, &bundle, &rollback_backup, op, start, err.to_string());
    }

    // Phase 5: load the new version.
    op.set_phase(ReloadPhase::LoadingNewVersion);
    if cancel.load(Ordering::Relaxed) {
        return rollback(
            inner,
            name,
            &bundle,
            &rollback_backup,
            op,
            start,
            "reload cancelled".to_string(),
        );
    }
    if !bundle.exists() {
        return rollback(
            inner,
            name,
            &bundle,
            &rollback_backup,
            op,
            start,
            "bundle file not found".to_string(),
        );
    }
    if options.clear_staging {
        inner.manager.loader().cleanup(name);
    }
    let loaded = inner
        .manager
        .load_single(name, &bundle)
        .unwrap_or(false);
    if !loaded {
        return rollback(
            inner,
            name,
            &bundle,
            &rollback_backup,
            op,
            start,
            "failed to load new plugin version".to_string(),
        );
    }
    let Some(new_handle) = inner.manager.get(name) else {
        return rollback(
            inner,
            name,
            &bundle,
            &rollback_backup,
            op,
            start,
            "new plugin version missing from registry".to_string(),
        );
    };

    // Phase 6: restore captured state. Failure here is logged but does
    // not fail the reload.
    op.set_phase(ReloadPhase::RestoringState);
    let state_preserved = match &snapshot {
        Some(snapshot) => {
            let restored = inner.snapshots.restore(&new_handle, snapshot);
            if !restored {
                tracing::warn!("state not restored for {}, continuing without it", name);
            }
            restored
        }
        None => false,
    };

    // Phase 7: enable the new instance.
    op.set_phase(ReloadPhase::Enabling);
    if cancel.load(Ordering::Relaxed) {
        return rollback(
            inner,
            name,
            &bundle,
            &rollback_backup,
            op,
            start,
            "reload cancelled".to_string(),
        );
    }
    if let Err(err) = inner.manager.enable(name) {
        return rollback(inner, name, &bundle, &rollback_backup, op, start, err.to_string());
    }
    if let Some(aware) = new_handle.instance().hot_reload() {
        aware.on_reload_complete();
    }

    // Phase 8: done.
    op.set_phase(ReloadPhase::Completed);
    remove_quietly(&rollback_backup);

    let duration = start.elapsed();
    tracing::info!("successfully hot reloaded plugin {} in {:?}", name, duration);
    ReloadResult::success(name, duration, state_preserved, op.finish())
}

fn rollback_backup_path(inner: &ReloadInner, name: &str, bundle: &Path) -> PathBuf {
    let extension = bundle
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("plugin");
    inner
        .snapshots
        .dir()
        .join(format!("{}.rollback.{}", name, extension))
}

/// Undo a failed reload: restore the bundle file from the pre-reload
/// backup, then re-load and re-enable the old version. Best effort; if
/// the old version cannot be brought back the plugin is left in (or
/// defaults to) the error state.
fn rollback(
    inner: &Arc<ReloadInner>,
    name: &str,
    bundle: &Path,
    backup: &Path,
    mut op: ReloadOperation,
    start: Instant,
    reason: String,
) -> ReloadResult {
    let failed_phase = op.current;
    op.set_phase(ReloadPhase::RollingBack);
    tracing::warn!("rolling back reload for {}: {}", name, reason);

    if backup.exists() {
        if let Err(err) = fs::copy(backup, bundle) {
            tracing::error!("failed to restore bundle for {}: {}", name, err);
        }
    }

    let restored = if inner.manager.get(name).is_none() {
        match inner.manager.load_single(name, bundle) {
            Ok(true) => inner.manager.enable(name).is_ok(),
            _ => false,
        }
    } else if !inner.manager.registry().is_enabled(name) {
        inner.manager.enable(name).is_ok()
    } else {
        true
    };

    if restored {
        tracing::info!("rollback restored previous version of {}", name);
    } else if inner.manager.get(name).is_some() {
        inner
            .manager
            .registry()
            .force_state(name, crate::lifecycle::PluginState::Error);
        tracing::error!("rollback failed for {}, plugin left in error state", name);
    } else {
        tracing::error!("rollback failed for {}, plugin no longer registered", name);
    }

    remove_quietly(backup);
    ReloadResult::failure(
        name,
        failed_phase,
        format!("{} (rollback {})", reason, if restored { "succeeded" } else { "failed" }),
        start.elapsed(),
        op.finish(),
    )
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}
