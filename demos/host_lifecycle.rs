//! Full host lifecycle: discovery, dependency-ordered loading, events,
//! and shutdown.
//!
//! Run with: `cargo run --example host_lifecycle`

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bundle_host::{
    EntryTable, Event, HostConfig, Plugin, PluginContext, PluginManager, Priority, Result,
    Subscriptions,
};

struct TickEvent;
impl Event for TickEvent {}

struct CorePlugin;

impl Plugin for CorePlugin {
    fn on_enable(&self, ctx: &PluginContext) -> Result<()> {
        println!("core enabled as {}", ctx.name());
        Ok(())
    }
}

struct MetricsPlugin {
    ticks: Arc<AtomicUsize>,
}

impl Plugin for MetricsPlugin {
    fn subscriptions(&self, subs: &mut Subscriptions) {
        let ticks = self.ticks.clone();
        subs.on(Priority::Normal, move |_: &TickEvent| {
            ticks.fetch_add(1, Ordering::SeqCst);
        });
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let root = tempfile::tempdir()?;
    let plugin_dir = root.path().join("plugins");
    fs::create_dir_all(&plugin_dir)?;

    fs::write(
        plugin_dir.join("core.plugin"),
        "name=core\nversion=1.0.0\nmain=demo:core\n",
    )?;
    fs::write(
        plugin_dir.join("metrics.plugin"),
        "name=metrics\nversion=1.0.0\nmain=demo:metrics\ndependencies=core\n",
    )?;

    let ticks = Arc::new(AtomicUsize::new(0));
    let entries = EntryTable::new();
    entries.register_plugin("demo:core", || Arc::new(CorePlugin) as Arc<dyn Plugin>);
    let handler_ticks = ticks.clone();
    entries.register_plugin("demo:metrics", move || {
        Arc::new(MetricsPlugin {
            ticks: handler_ticks.clone(),
        }) as Arc<dyn Plugin>
    });

    let manager = PluginManager::new(HostConfig::new(&plugin_dir), Arc::new(entries))?;
    manager.load_all()?;
    println!("load order: {:?}", manager.load_order());

    manager.enable_all();
    println!("status: {:?}", manager.status());

    for _ in 0..3 {
        manager.events().fire_sync(&TickEvent);
    }
    println!("ticks observed: {}", ticks.load(Ordering::SeqCst));

    manager.shutdown();
    Ok(())
}
