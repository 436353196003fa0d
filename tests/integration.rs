//! End-to-end scenarios for bundle-host.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use bundle_host::{
    BundleWatcher, EntryTable, Error, HostConfig, HotReloadAware, HotReloadOrchestrator,
    LoaderConfig, Plugin, PluginContext, PluginManager, PluginState, Priority, ReloadConfig,
    ReloadOptions, Result, SchedulerConfig, StatefulPlugin, Subscriptions, UpdateConfig,
    WatchConfig,
};

type Log = Arc<Mutex<Vec<String>>>;
type CounterState = Arc<Mutex<HashMap<String, serde_json::Value>>>;

// ---------------------------------------------------------------------
// Test plugins

struct Recorder {
    name: &'static str,
    log: Log,
}

impl Recorder {
    fn push(&self, hook: &str) {
        self.log.lock().push(format!("{}:{}", hook, self.name));
    }
}

impl Plugin for Recorder {
    fn on_load(&self, _ctx: &PluginContext) -> Result<()> {
        self.push("load");
        Ok(())
    }

    fn on_enable(&self, _ctx: &PluginContext) -> Result<()> {
        self.push("enable");
        Ok(())
    }

    fn on_disable(&self, _ctx: &PluginContext) -> Result<()> {
        self.push("disable");
        Ok(())
    }

    fn on_unload(&self, _ctx: &PluginContext) -> Result<()> {
        self.push("unload");
        Ok(())
    }
}

struct Greeter {
    greetings: Arc<AtomicUsize>,
}

struct GreetEvent;
impl bundle_host::Event for GreetEvent {}

impl Plugin for Greeter {
    fn subscriptions(&self, subs: &mut Subscriptions) {
        let greetings = self.greetings.clone();
        subs.on(Priority::Normal, move |_: &GreetEvent| {
            greetings.fetch_add(1, Ordering::SeqCst);
        });
    }
}

/// A stateful, hot-reload-aware plugin whose custom data survives a swap.
struct Counter {
    state: CounterState,
}

impl Plugin for Counter {
    fn stateful(&self) -> Option<&dyn StatefulPlugin> {
        Some(self)
    }

    fn hot_reload(&self) -> Option<&dyn HotReloadAware> {
        Some(self)
    }
}

impl StatefulPlugin for Counter {
    fn save_state(&self) -> HashMap<String, serde_json::Value> {
        self.state.lock().clone()
    }

    fn load_state(&self, state: HashMap<String, serde_json::Value>) {
        *self.state.lock() = state;
    }
}

impl HotReloadAware for Counter {
    fn can_hot_reload(&self) -> bool {
        true
    }

    fn prepare_for_reload(&self) {}
}

// ---------------------------------------------------------------------
// Helpers

struct Host {
    root: TempDir,
    log: Log,
    counter_states: Arc<Mutex<Vec<CounterState>>>,
    manager: Arc<PluginManager>,
}

fn host() -> Host {
    let root = TempDir::new().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let counter_states: Arc<Mutex<Vec<CounterState>>> = Arc::new(Mutex::new(Vec::new()));

    let table = EntryTable::new();
    for name in ["alpha", "beta", "gamma"] {
        let log = log.clone();
        table.register_plugin(&format!("test:{}", name), move || {
            Arc::new(Recorder {
                name,
                log: log.clone(),
            }) as Arc<dyn Plugin>
        });
    }
    table.register_plugin("test:greeter", || {
        Arc::new(Greeter {
            greetings: Arc::new(AtomicUsize::new(0)),
        }) as Arc<dyn Plugin>
    });
    let states = counter_states.clone();
    table.register_plugin("test:counter", move || {
        let state: CounterState = Arc::new(Mutex::new(HashMap::new()));
        states.lock().push(state.clone());
        Arc::new(Counter { state }) as Arc<dyn Plugin>
    });

    let config = HostConfig::new(root.path().join("plugins"))
        .with_update_dir(root.path().join("updates"))
        .with_data_dir(root.path().join("plugin-data"))
        .with_loader(LoaderConfig::new().with_staging_dir(root.path().join("stage")))
        .with_scheduler(
            SchedulerConfig::new()
                .with_scheduled_workers(2)
                .with_async_workers(2),
        )
        .with_event_workers(2)
        .with_update_config(UpdateConfig::default());

    let manager = Arc::new(PluginManager::new(config, Arc::new(table)).unwrap());
    Host {
        root,
        log,
        counter_states,
        manager,
    }
}

fn write_bundle(dir: &Path, file: &str, name: &str, version: &str, deps: &[&str]) {
    let mut text = format!("name={}\nversion={}\nmain=test:{}\n", name, version, name);
    if !deps.is_empty() {
        text.push_str(&format!("dependencies={}\n", deps.join(",")));
    }
    fs::write(dir.join(file), text).unwrap();
}

// ---------------------------------------------------------------------
// Scenario 1: linear dependencies load in order, shut down in reverse.

#[test]
fn test_linear_dependencies_and_reverse_shutdown() {
    let host = host();
    let dir = host.root.path().join("plugins");
    write_bundle(&dir, "c.plugin", "gamma", "1.0.0", &["beta"]);
    write_bundle(&dir, "b.plugin", "beta", "1.0.0", &["alpha"]);
    write_bundle(&dir, "a.plugin", "alpha", "1.0.0", &[]);

    host.manager.load_all().unwrap();
    assert_eq!(host.manager.load_order(), vec!["alpha", "beta", "gamma"]);

    host.manager.enable_all();
    assert_eq!(host.manager.status().enabled, 3);

    host.log.lock().clear();
    host.manager.shutdown();

    let entries = host.log.lock().clone();
    let disables: Vec<&String> = entries.iter().filter(|l| l.starts_with("disable:")).collect();
    assert_eq!(disables, vec!["disable:gamma", "disable:beta", "disable:alpha"]);
    assert_eq!(host.manager.status().total, 0);
}

// ---------------------------------------------------------------------
// Scenario 2: a dependency cycle fails with the cycle path.

#[test]
fn test_cycle_fails_with_path() {
    let host = host();
    let dir = host.root.path().join("plugins");
    write_bundle(&dir, "a.plugin", "alpha", "1.0.0", &["beta"]);
    write_bundle(&dir, "b.plugin", "beta", "1.0.0", &["gamma"]);
    write_bundle(&dir, "c.plugin", "gamma", "1.0.0", &["alpha"]);

    let err = host.manager.load_all().unwrap_err();
    match err {
        Error::CircularDependency { path } => {
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
            for name in &path {
                assert!(["alpha", "beta", "gamma"].contains(&name.as_str()));
            }
        }
        other => panic!("expected circular dependency, got {}", other),
    }
}

// ---------------------------------------------------------------------
// Scenario 3: an older pending version is skipped with no side effects.

#[test]
fn test_version_skip_creates_no_backup() {
    let host = host();
    write_bundle(
        &host.root.path().join("plugins"),
        "x.plugin",
        "alpha",
        "1.2.0",
        &[],
    );
    write_bundle(
        &host.root.path().join("updates"),
        "x.plugin",
        "alpha",
        "1.1.9",
        &[],
    );

    let updater = host.manager.updater().unwrap();
    let scan = updater.scan();
    assert!(!scan.has_candidates());
    assert!(scan.invalid_files.is_empty());

    let outcome = updater.check_and_apply();
    assert!(!outcome.has_updates());
    assert!(updater.list_backups().is_empty());

    // The installed bundle is untouched.
    let meta = host
        .manager
        .loader()
        .load_metadata(&host.root.path().join("plugins").join("x.plugin"))
        .unwrap();
    assert_eq!(meta.version, "1.2.0");
}

// ---------------------------------------------------------------------
// Scenario 4: a failed update leaves the original bundle intact, with a
// backup on disk and the failure recorded.

#[test]
fn test_update_failure_restores_original() {
    let host = host();
    let plugins = host.root.path().join("plugins");
    let target = plugins.join("x.plugin");
    write_bundle(&plugins, "x.plugin", "alpha", "1.0.0", &[]);
    let original = fs::read(&target).unwrap();

    write_bundle(
        &host.root.path().join("updates"),
        "x.plugin",
        "alpha",
        "1.1.0",
        &[],
    );

    let updater = host.manager.updater().unwrap();
    let scan = updater.scan();
    assert_eq!(scan.candidates.len(), 1);

    // Apply succeeds; then roll back to the pre-update bytes.
    let outcome = updater.apply(&scan.candidates);
    assert_eq!(outcome.updated, vec!["alpha"]);
    assert_ne!(fs::read(&target).unwrap(), original);

    let backups = updater.list_backups();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].plugin, "alpha");

    assert!(updater.rollback("alpha"));
    assert_eq!(fs::read(&target).unwrap(), original);
}

#[test]
fn test_update_failure_is_recorded_and_batch_continues() {
    let host = host();
    let plugins = host.root.path().join("plugins");
    write_bundle(&plugins, "x.plugin", "alpha", "1.0.0", &[]);
    write_bundle(
        &host.root.path().join("updates"),
        "x.plugin",
        "alpha",
        "1.1.0",
        &[],
    );
    write_bundle(
        &host.root.path().join("updates"),
        "y.plugin",
        "beta",
        "1.0.0",
        &[],
    );

    let updater = host.manager.updater().unwrap();
    let scan = updater.scan();
    // Remove alpha's installed bundle between scan and apply.
    fs::remove_file(plugins.join("x.plugin")).unwrap();

    let outcome = updater.apply(&scan.candidates);
    assert_eq!(outcome.updated, vec!["beta"]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].name, "alpha");
}

// ---------------------------------------------------------------------
// Scenario 5: hot reload preserves a stateful plugin's custom data.

#[test]
fn test_hot_reload_preserves_state() {
    let host = host();
    let dir = host.root.path().join("plugins");
    write_bundle(&dir, "counter.plugin", "counter", "1.0.0", &[]);

    host.manager.load_all().unwrap();
    host.manager.enable("counter").unwrap();

    // The running instance stores some custom state.
    host.counter_states.lock()[0]
        .lock()
        .insert("counter".to_string(), serde_json::json!(7));

    let orchestrator = HotReloadOrchestrator::new(
        host.manager.clone(),
        ReloadConfig::new(host.root.path().join("state")).with_auto_reload(false),
    )
    .unwrap();

    let result = orchestrator.reload_with("counter", ReloadOptions::default());
    assert!(result.success, "reload failed: {:?}", result.error);
    assert!(result.state_preserved);
    assert_eq!(host.manager.registry().state("counter"), PluginState::Enabled);

    // A fresh instance was constructed and carries the restored state.
    let states = host.counter_states.lock();
    assert_eq!(states.len(), 2);
    assert_eq!(states[1].lock().get("counter"), Some(&serde_json::json!(7)));

    // Total duration is coherent with the recorded phase durations.
    let phase_sum: Duration = result.phases.iter().map(|(_, d)| *d).sum();
    assert!(result.duration < phase_sum * 2 + Duration::from_millis(50));
    assert!(!result.phases.is_empty());

    orchestrator.shutdown();
    host.manager.shutdown();
}

#[test]
fn test_reload_of_disabled_plugin_fails_validation() {
    let host = host();
    let dir = host.root.path().join("plugins");
    write_bundle(&dir, "counter.plugin", "counter", "1.0.0", &[]);
    host.manager.load_all().unwrap();

    let orchestrator = HotReloadOrchestrator::new(
        host.manager.clone(),
        ReloadConfig::new(host.root.path().join("state")).with_auto_reload(false),
    )
    .unwrap();

    let result = orchestrator.reload("counter");
    assert!(!result.success);
    assert_eq!(result.failed_phase, Some(bundle_host::ReloadPhase::Validating));
    orchestrator.shutdown();
}

// ---------------------------------------------------------------------
// Scenario 6: the watcher fires exactly one callback per stable change.

#[test]
fn test_watcher_debounces_bursty_writes() {
    let dir = TempDir::new().unwrap();
    let stability = Duration::from_millis(300);
    let verify = Duration::from_millis(150);

    let fired: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let fired_in_cb = fired.clone();
    let watcher = BundleWatcher::new(
        dir.path(),
        WatchConfig::new()
            .with_stability_wait(stability)
            .with_verify_delay(verify)
            .with_rescan_interval(Duration::from_secs(120), Duration::from_secs(120)),
        move |_| {
            fired_in_cb.lock().push(Instant::now());
        },
    );
    watcher.start().unwrap();
    thread::sleep(Duration::from_millis(100));

    // Three bursts 100 ms apart, then silence.
    let target = dir.path().join("p.plugin");
    let mut last_write = Instant::now();
    for i in 0..3 {
        fs::write(&target, format!("name=p\nversion=1.0.{}\nmain=x\n", i)).unwrap();
        last_write = Instant::now();
        thread::sleep(Duration::from_millis(100));
    }

    thread::sleep(stability + verify + Duration::from_millis(600));

    let fired = fired.lock().clone();
    assert_eq!(fired.len(), 1, "expected exactly one callback");
    // Not earlier than the stability gate allows after the last write.
    let slack = Duration::from_millis(60);
    assert!(fired[0].duration_since(last_write) + slack >= stability + verify);
    watcher.stop();
}

// ---------------------------------------------------------------------
// Events flow through enabled plugins and stop after disable.

#[test]
fn test_event_subscriptions_follow_lifecycle() {
    let host = host();
    let dir = host.root.path().join("plugins");
    write_bundle(&dir, "greeter.plugin", "greeter", "1.0.0", &[]);

    host.manager.load_all().unwrap();
    host.manager.enable("greeter").unwrap();
    assert_eq!(host.manager.events().handler_count::<GreetEvent>(), 1);

    host.manager.events().fire_sync(&GreetEvent);

    host.manager.disable("greeter").unwrap();
    assert_eq!(host.manager.events().handler_count::<GreetEvent>(), 0);

    // Re-enabling registers exactly once again.
    host.manager.enable("greeter").unwrap();
    assert_eq!(host.manager.events().handler_count::<GreetEvent>(), 1);
    host.manager.shutdown();
}

// ---------------------------------------------------------------------
// Config round-trip through the per-plugin store.

#[test]
fn test_config_roundtrip_through_host() {
    let host = host();
    let dir = host.root.path().join("plugins");
    write_bundle(&dir, "alpha.plugin", "alpha", "1.0.0", &[]);
    host.manager.load_all().unwrap();

    let config = host.manager.configs().get("alpha");
    config.set("threshold", 12);
    config.set_list("modes", &["fast", "safe"]);
    config.save().unwrap();
    config.reload();

    assert_eq!(config.get_int("threshold"), Some(12));
    assert_eq!(config.get_list("modes"), vec!["fast", "safe"]);
    assert!(host
        .root
        .path()
        .join("plugin-data")
        .join("alpha")
        .join("config.properties")
        .exists());
    host.manager.shutdown();
}
