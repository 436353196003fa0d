//! Hot reload of a stateful plugin, with per-phase timings.
//!
//! Run with: `cargo run --example hot_reload`

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;

use bundle_host::{
    EntryTable, HostConfig, HotReloadAware, HotReloadOrchestrator, Plugin, PluginManager,
    ReloadConfig, ReloadOptions, Result, StatefulPlugin,
};

struct CounterPlugin {
    state: Mutex<HashMap<String, serde_json::Value>>,
}

impl Plugin for CounterPlugin {
    fn stateful(&self) -> Option<&dyn StatefulPlugin> {
        Some(self)
    }

    fn hot_reload(&self) -> Option<&dyn HotReloadAware> {
        Some(self)
    }
}

impl StatefulPlugin for CounterPlugin {
    fn save_state(&self) -> HashMap<String, serde_json::Value> {
        self.state.lock().clone()
    }

    fn load_state(&self, state: HashMap<String, serde_json::Value>) {
        println!("restored state: {:?}", state);
        *self.state.lock() = state;
    }
}

impl HotReloadAware for CounterPlugin {
    fn can_hot_reload(&self) -> bool {
        true
    }

    fn prepare_for_reload(&self) {
        println!("finishing in-flight work before reload");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let root = tempfile::tempdir()?;
    let plugin_dir = root.path().join("plugins");
    fs::create_dir_all(&plugin_dir)?;
    fs::write(
        plugin_dir.join("counter.plugin"),
        "name=counter\nversion=1.0.0\nmain=demo:counter\n",
    )?;

    let entries = EntryTable::new();
    entries.register_plugin("demo:counter", || {
        Arc::new(CounterPlugin {
            state: Mutex::new(HashMap::new()),
        }) as Arc<dyn Plugin>
    });

    let manager = Arc::new(PluginManager::new(
        HostConfig::new(&plugin_dir),
        Arc::new(entries),
    )?);
    manager.load_all()?;
    manager.enable("counter")?;

    // Simulate accumulated runtime state.
    manager.configs().get("counter").set("requests", 42);

    let orchestrator = HotReloadOrchestrator::new(
        manager.clone(),
        ReloadConfig::new(root.path().join("state")).with_auto_reload(false),
    )?;

    let result = orchestrator.reload_with("counter", ReloadOptions::default());
    println!(
        "reload success={} state_preserved={} in {:?}",
        result.success, result.state_preserved, result.duration
    );
    for (phase, duration) in &result.phases {
        println!("  {:<20} {:?}", phase.to_string(), duration);
    }

    orchestrator.shutdown();
    manager.shutdown();
    Ok(())
}
