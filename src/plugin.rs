//! The plugin contract, per-plugin context, and registered handles.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::PluginConfig;
use crate::error::Result;
use crate::events::{EventBus, Subscriptions};
use crate::manifest::PluginMetadata;
use crate::scheduler::{ScheduledTask, TaskScheduler};

/// The contract every plugin implements.
///
/// Hooks take `&self`; plugins keep their own state behind interior
/// mutability so instances can be shared with the event bus and the
/// scheduler.
pub trait Plugin: Send + Sync {
    /// Called once after the instance is constructed, before registration.
    fn on_load(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin transitions to enabled.
    fn on_enable(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin transitions to disabled.
    fn on_disable(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Called before the instance is dropped and unregistered.
    fn on_unload(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Hand event handlers to the bus. Invoked when the plugin is enabled;
    /// everything registered here is removed again when it is disabled.
    fn subscriptions(&self, _subs: &mut Subscriptions) {}

    /// Access the stateful capability, if the plugin carries runtime state
    /// that should survive hot reloads.
    fn stateful(&self) -> Option<&dyn StatefulPlugin> {
        None
    }

    /// Access the hot-reload capability, if the plugin wants a say in when
    /// and how it is reloaded.
    fn hot_reload(&self) -> Option<&dyn HotReloadAware> {
        None
    }
}

/// Capability for plugins whose runtime state should survive a hot reload.
pub trait StatefulPlugin: Send + Sync {
    /// Capture the plugin's custom state.
    fn save_state(&self) -> HashMap<String, serde_json::Value>;

    /// Restore previously captured state into a fresh instance.
    fn load_state(&self, state: HashMap<String, serde_json::Value>);

    /// Recreate scheduled work from the task ids that were active before
    /// the reload.
    fn restore_tasks(&self, _task_ids: BTreeSet<u64>) {}
}

/// Capability for plugins that participate in hot-reload decisions.
pub trait HotReloadAware: Send + Sync {
    /// Whether the plugin can be safely reloaded right now.
    fn can_hot_reload(&self) -> bool;

    /// Finish in-flight work before the old instance is torn down.
    fn prepare_for_reload(&self);

    /// Called on the new instance after a successful reload.
    fn on_reload_complete(&self) {}
}

/// Per-plugin services handed to every lifecycle hook.
///
/// Tasks scheduled through the context are tagged as owned by this plugin
/// so a hot-reload snapshot can collect them.
pub struct PluginContext {
    name: String,
    events: Arc<EventBus>,
    scheduler: Arc<TaskScheduler>,
    config: Arc<PluginConfig>,
    owned_tasks: Mutex<HashSet<u64>>,
}

impl PluginContext {
    /// Create a context for `name` backed by the host's services.
    pub fn new(
        name: impl Into<String>,
        events: Arc<EventBus>,
        scheduler: Arc<TaskScheduler>,
        config: Arc<PluginConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            scheduler,
            config,
            owned_tasks: Mutex::new(HashSet::new()),
        }
    }

    /// The owning plugin's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The host task scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// This plugin's persistent configuration.
    pub fn config(&self) -> &Arc<PluginConfig> {
        &self.config
    }

    /// Schedule a one-shot task owned by this plugin.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.scheduler.schedule(delay, task);
        self.owned_tasks.lock().insert(handle.id());
        handle
    }

    /// Schedule a fixed-rate repeating task owned by this plugin.
    pub fn schedule_repeating<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = self.scheduler.schedule_repeating(initial_delay, period, task);
        self.owned_tasks.lock().insert(handle.id());
        handle
    }

    /// Ids of this plugin's tasks that are still active, pruning anything
    /// that already completed or was cancelled.
    pub fn active_task_ids(&self) -> BTreeSet<u64> {
        let mut owned = self.owned_tasks.lock();
        owned.retain(|id| self.scheduler.is_active(*id));
        owned.iter().copied().collect()
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("owned_tasks", &self.owned_tasks.lock().len())
            .finish()
    }
}

/// A registered plugin: instance, context, and the metadata it was loaded
/// from. Cloning is cheap; everything is shared.
#[derive(Clone)]
pub struct PluginHandle {
    metadata: Arc<PluginMetadata>,
    instance: Arc<dyn Plugin>,
    context: Arc<PluginContext>,
}

impl PluginHandle {
    /// Bind an instance to its context and metadata.
    pub fn new(
        metadata: PluginMetadata,
        instance: Arc<dyn Plugin>,
        context: Arc<PluginContext>,
    ) -> Self {
        Self {
            metadata: Arc::new(metadata),
            instance,
            context,
        }
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Plugin version string.
    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    /// The metadata the plugin was loaded from.
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// The live plugin instance.
    pub fn instance(&self) -> &Arc<dyn Plugin> {
        &self.instance
    }

    /// The plugin's context.
    pub fn context(&self) -> &Arc<PluginContext> {
        &self.context
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.metadata.name)
            .field("version", &self.metadata.version)
            .finish()
    }
}
