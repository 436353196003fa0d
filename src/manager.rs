//! The plugin manager: discovery, dependency-ordered loading, lifecycle
//! operations, and shutdown.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::ConfigManager;
use crate::error::{Error, PluginOp, Result};
use crate::events::{EventBus, Subscriptions};
use crate::extensions::{AnyExtension, ExtensionManager, ExtensionPointInfo};
use crate::lifecycle::PluginState;
use crate::loader::{EntryTable, LoaderConfig, PluginLoader};
use crate::manifest::PluginMetadata;
use crate::plugin::{PluginContext, PluginHandle};
use crate::registry::{PluginRegistry, RegistryStatus};
use crate::scheduler::{SchedulerConfig, TaskScheduler};
use crate::updater::{UpdateConfig, UpdateManager, UpdateOutcome};

/// Configuration for [`PluginManager`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory holding active bundles.
    pub plugin_dir: PathBuf,
    /// Directory holding pending bundles; updates are disabled when unset.
    pub update_dir: Option<PathBuf>,
    /// Per-plugin data directory; `<plugin_dir>/../plugin-data` when unset.
    pub data_dir: Option<PathBuf>,
    /// Extension of manifest bundles.
    pub bundle_extension: String,
    /// Loader configuration.
    pub loader: LoaderConfig,
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
    /// Event bus dispatch workers.
    pub event_workers: usize,
    /// Update manager configuration.
    pub update: UpdateConfig,
}

impl HostConfig {
    /// Create a configuration rooted at `plugin_dir`.
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            update_dir: None,
            data_dir: None,
            bundle_extension: "plugin".to_string(),
            loader: LoaderConfig::default(),
            scheduler: SchedulerConfig::default(),
            event_workers: 4,
            update: UpdateConfig::default(),
        }
    }

    /// Enable updates from `update_dir`.
    pub fn with_update_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.update_dir = Some(dir.into());
        self
    }

    /// Set the per-plugin data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the manifest bundle extension.
    pub fn with_bundle_extension(mut self, extension: impl Into<String>) -> Self {
        self.bundle_extension = extension.into();
        self
    }

    /// Set the loader configuration.
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Set the scheduler configuration.
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the event bus worker count.
    pub fn with_event_workers(mut self, workers: usize) -> Self {
        self.event_workers = workers;
        self
    }

    /// Set the update configuration.
    pub fn with_update_config(mut self, update: UpdateConfig) -> Self {
        self.update = update;
        self
    }
}

/// Composes registry, loader, resolver, event bus, scheduler, config
/// store, extension manager, and updater into the host's lifecycle:
/// discovery, dependency-ordered loading, enable/disable, reload, and
/// reverse-order shutdown.
pub struct PluginManager {
    plugin_dir: PathBuf,
    bundle_extensions: Vec<String>,
    registry: Arc<PluginRegistry>,
    events: Arc<EventBus>,
    scheduler: Arc<TaskScheduler>,
    configs: Arc<ConfigManager>,
    extensions: Arc<ExtensionManager>,
    loader: Arc<PluginLoader>,
    resolver: crate::resolver::DependencyResolver,
    updater: Option<Arc<UpdateManager>>,
    metadata: DashMap<String, PluginMetadata>,
    load_order: Mutex<Vec<String>>,
}

impl PluginManager {
    /// Create a manager; manifest bundles resolve against `entries`.
    pub fn new(config: HostConfig, entries: Arc<EntryTable>) -> Result<Self> {
        fs::create_dir_all(&config.plugin_dir)?;

        let data_dir = config.data_dir.clone().unwrap_or_else(|| {
            config
                .plugin_dir
                .parent()
                .map(|parent| parent.join("plugin-data"))
                .unwrap_or_else(|| PathBuf::from("plugin-data"))
        });

        let mut bundle_extensions = vec![config.bundle_extension.clone()];
        bundle_extensions.extend(config.loader.native_extensions.iter().cloned());

        let loader = Arc::new(PluginLoader::new(config.loader.clone(), entries)?);

        let updater = match &config.update_dir {
            Some(update_dir) => Some(Arc::new(UpdateManager::new(
                config.plugin_dir.clone(),
                update_dir.clone(),
                bundle_extensions.clone(),
                loader.clone(),
                config.update.clone(),
            )?)),
            None => None,
        };

        tracing::info!(
            "plugin manager initialized, plugin directory: {}",
            config.plugin_dir.display()
        );

        Ok(Self {
            plugin_dir: config.plugin_dir,
            bundle_extensions,
            registry: Arc::new(PluginRegistry::new()),
            events: Arc::new(EventBus::new(config.event_workers)),
            scheduler: Arc::new(TaskScheduler::new(config.scheduler)),
            configs: Arc::new(ConfigManager::new(data_dir)),
            extensions: Arc::new(ExtensionManager::new()),
            loader,
            resolver: crate::resolver::DependencyResolver::new(),
            updater,
            metadata: DashMap::new(),
            load_order: Mutex::new(Vec::new()),
        })
    }

    /// The plugin directory.
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// The plugin registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The task scheduler.
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// The per-plugin config manager.
    pub fn configs(&self) -> &Arc<ConfigManager> {
        &self.configs
    }

    /// The extension manager.
    pub fn extensions(&self) -> &Arc<ExtensionManager> {
        &self.extensions
    }

    /// The bundle loader.
    pub fn loader(&self) -> &Arc<PluginLoader> {
        &self.loader
    }

    /// The update manager, when updates are configured.
    pub fn updater(&self) -> Option<&Arc<UpdateManager>> {
        self.updater.as_ref()
    }

    /// Cached metadata for `name`.
    pub fn metadata(&self, name: &str) -> Option<PluginMetadata> {
        self.metadata.get(name).map(|m| m.value().clone())
    }

    /// A plugin handle by name.
    pub fn get(&self, name: &str) -> Option<PluginHandle> {
        self.registry.get(name)
    }

    /// Registry status summary.
    pub fn status(&self) -> RegistryStatus {
        self.registry.status()
    }

    /// Load order as resolved at `load_all`, for diagnostics.
    pub fn load_order(&self) -> Vec<String> {
        self.load_order.lock().clone()
    }

    // ------------------------------------------------------------------
    // Loading

    /// Apply pending updates (when configured), discover bundles, resolve
    /// the dependency order, and load each plugin in order.
    ///
    /// Per-plugin load failures are logged and the batch continues, with
    /// one exception: a state-transition error is mapped to an operation
    /// error and propagates.
    pub fn load_all(&self) -> Result<()> {
        tracing::info!("starting plugin loading");

        if let Some(updater) = &self.updater {
            let outcome = updater.check_and_apply();
            if outcome.has_updates() {
                tracing::info!("applied {} plugin updates: {:?}", outcome.updated.len(), outcome.updated);
            }
            if outcome.has_failures() {
                tracing::warn!("{} plugin updates failed", outcome.failed.len());
            }
        }

        let files = self.discover();
        if files.is_empty() {
            tracing::info!("no plugins found to load");
            return Ok(());
        }

        let known: HashMap<String, PluginMetadata> = files
            .keys()
            .filter_map(|name| self.metadata(name).map(|meta| (name.clone(), meta)))
            .collect();
        let order = self.resolver.resolve(&known)?;
        tracing::info!("plugin load order resolved: {:?}", order);

        let mut loaded = 0;
        for name in &order {
            let Some(file) = files.get(name) else { continue };
            match self.load_single(name, file) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(err) => return Err(err),
            }
        }

        tracing::info!(
            "plugin loading completed: {}/{} plugins loaded, {} extension points registered",
            loaded,
            files.len(),
            self.extensions.point_count()
        );
        Ok(())
    }

    /// Enumerate bundle files and cache their metadata, keyed by plugin
    /// name. Bundles with unreadable metadata are indexed under a
    /// filename-derived fallback.
    fn discover(&self) -> HashMap<String, PathBuf> {
        let mut files = HashMap::new();

        let Ok(entries) = fs::read_dir(&self.plugin_dir) else {
            tracing::warn!("plugin directory is not accessible");
            return files;
        };

        let mut bundles: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.is_bundle(path))
            .collect();
        bundles.sort();

        for bundle in bundles {
            let metadata = match self.loader.load_metadata(&bundle) {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!(
                        "failed to read metadata from {}: {}",
                        bundle.display(),
                        err
                    );
                    PluginMetadata::fallback(&bundle)
                }
            };
            tracing::debug!(
                "discovered plugin {} v{} from {}",
                metadata.name,
                metadata.version,
                bundle.display()
            );
            files.insert(metadata.name.clone(), bundle);
            self.metadata.insert(metadata.name.clone(), metadata);
        }

        tracing::info!("discovered {} plugins", files.len());
        files
    }

    fn is_bundle(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.bundle_extensions.iter().any(|e| e == ext))
            .unwrap_or(false)
    }

    /// Load one plugin: instance, context, `on_load`, registration.
    ///
    /// Returns `Ok(false)` after logging when the plugin could not be
    /// loaded; no partial state leaks into the registry. A registry
    /// transition error is mapped to an operation error and returned.
    pub fn load_single(&self, name: &str, file: &Path) -> Result<bool> {
        tracing::debug!("loading plugin {}", name);

        let metadata = match self.metadata(name) {
            Some(metadata) => metadata,
            None => match self.loader.load_metadata(file) {
                Ok(metadata) => {
                    self.metadata.insert(name.to_string(), metadata.clone());
                    metadata
                }
                Err(err) => {
                    tracing::error!("failed to load metadata for {}: {}", name, err);
                    return Ok(false);
                }
            },
        };

        let instance = match self.loader.load_plugin(file, &metadata, &self.extensions) {
            Ok(instance) => instance,
            Err(err) => {
                tracing::error!("failed to load plugin {}: {}", name, err);
                return Ok(false);
            }
        };

        let context = Arc::new(PluginContext::new(
            name,
            self.events.clone(),
            self.scheduler.clone(),
            self.configs.get(name),
        ));
        let handle = PluginHandle::new(metadata.clone(), instance, context);

        if let Err(err) = handle.instance().on_load(handle.context()) {
            tracing::error!("on_load failed for {}: {}", name, err);
            self.loader.cleanup(name);
            return Ok(false);
        }

        match self.registry.register(name, handle) {
            Ok(()) => {}
            Err(err @ Error::InvalidTransition { .. }) => {
                self.loader.cleanup(name);
                return Err(Error::operation(PluginOp::Load, name, err));
            }
            Err(err) => {
                tracing::error!("failed to register plugin {}: {}", name, err);
                self.loader.cleanup(name);
                return Ok(false);
            }
        }

        let mut order = self.load_order.lock();
        if !order.iter().any(|n| n == name) {
            order.push(name.to_string());
        }
        drop(order);

        tracing::info!("successfully loaded plugin {} v{}", name, metadata.version);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Enable a plugin: register its event handlers, run `on_enable`, and
    /// transition to enabled. Enabling an already-enabled plugin is a
    /// no-op. On failure the plugin moves to the error state, its event
    /// handlers are removed again, and an operation error is surfaced.
    pub fn enable(&self, name: &str) -> Result<()> {
        let handle = self.registry.get(name).ok_or_else(|| Error::not_found(name))?;

        if self.registry.state(name) == PluginState::Enabled {
            tracing::debug!("plugin {} is already enabled", name);
            return Ok(());
        }

        tracing::debug!("enabling plugin {}", name);
        let mut subs = Subscriptions::new();
        handle.instance().subscriptions(&mut subs);
        self.events.register(name, subs);

        let result = handle
            .instance()
            .on_enable(handle.context())
            .and_then(|()| self.registry.set_state(name, PluginState::Enabled));

        match result {
            Ok(()) => {
                tracing::info!("successfully enabled plugin {}", name);
                Ok(())
            }
            Err(err) => {
                if self.registry.set_state(name, PluginState::Error).is_err() {
                    self.registry.force_state(name, PluginState::Error);
                }
                self.events.unregister(name);
                Err(Error::operation(PluginOp::Enable, name, err))
            }
        }
    }

    /// Disable a plugin: remove its event handlers, run `on_disable`,
    /// drop its extensions, and transition to disabled. Disabling an
    /// already-disabled plugin is a no-op.
    pub fn disable(&self, name: &str) -> Result<()> {
        let handle = self.registry.get(name).ok_or_else(|| Error::not_found(name))?;

        if self.registry.state(name) == PluginState::Disabled {
            tracing::debug!("plugin {} is already disabled", name);
            return Ok(());
        }

        tracing::debug!("disabling plugin {}", name);
        self.events.unregister(name);

        let result = handle
            .instance()
            .on_disable(handle.context())
            .and_then(|()| {
                self.extensions.unregister_plugin(name);
                self.registry.set_state(name, PluginState::Disabled)
            });

        match result {
            Ok(()) => {
                tracing::info!("successfully disabled plugin {}", name);
                Ok(())
            }
            Err(err) => {
                if self.registry.set_state(name, PluginState::Error).is_err() {
                    self.registry.force_state(name, PluginState::Error);
                }
                Err(Error::operation(PluginOp::Disable, name, err))
            }
        }
    }

    /// Reload a plugin from its bundle file: disable if enabled, unload,
    /// flush cached metadata, load again, and re-enable if it was enabled.
    pub fn reload(&self, name: &str) -> Result<()> {
        tracing::info!("reloading plugin {}", name);

        let handle = self.registry.get(name).ok_or_else(|| Error::not_found(name))?;
        let bundle = handle.metadata().source.clone();
        if !bundle.exists() {
            return Err(Error::operation(
                PluginOp::Reload,
                name,
                Error::load(bundle.display().to_string(), "bundle file not found"),
            ));
        }

        let was_enabled = self.registry.is_enabled(name);

        if was_enabled {
            self.disable(name)?;
        }
        self.unload(name)?;
        self.metadata.remove(name);

        match self.load_single(name, &bundle)? {
            true => {
                if was_enabled {
                    self.enable(name)?;
                }
                tracing::info!("successfully reloaded plugin {}", name);
                Ok(())
            }
            false => Err(Error::operation(
                PluginOp::Reload,
                name,
                Error::load(
                    bundle.display().to_string(),
                    "failed to load plugin after unloading",
                ),
            )),
        }
    }

    /// Unload a plugin: best-effort disable, `on_unload`, staging
    /// teardown, unregistration, and metadata drop.
    pub fn unload(&self, name: &str) -> Result<()> {
        let handle = self.registry.get(name).ok_or_else(|| Error::not_found(name))?;

        if self.registry.is_enabled(name) {
            if let Err(err) = self.disable(name) {
                tracing::warn!("error disabling {} during unload: {}", name, err);
            }
        }

        if let Err(err) = handle.instance().on_unload(handle.context()) {
            tracing::warn!("error during on_unload for {}: {}", name, err);
        }

        self.loader.cleanup(name);
        self.registry.unregister(name);
        self.metadata.remove(name);
        self.load_order.lock().retain(|n| n != name);
        tracing::debug!("unloaded plugin {}", name);
        Ok(())
    }

    /// Enable every loaded plugin in load order. Per-plugin failures are
    /// logged; returns how many were enabled.
    pub fn enable_all(&self) -> usize {
        tracing::info!("enabling all loaded plugins");
        let order = self.load_order();
        let mut enabled = 0;
        for name in &order {
            if !self.registry.is_enabled(name) {
                match self.enable(name) {
                    Ok(()) => enabled += 1,
                    Err(err) => tracing::error!("failed to enable {}: {}", name, err),
                }
            }
        }
        tracing::info!("enabled {}/{} plugins", enabled, order.len());
        enabled
    }

    /// Disable every enabled plugin in reverse load order. Per-plugin
    /// failures are logged; returns how many were disabled.
    pub fn disable_all(&self) -> usize {
        tracing::info!("disabling all enabled plugins");
        let mut disabled = 0;
        for name in self.load_order().iter().rev() {
            if self.registry.is_enabled(name) {
                match self.disable(name) {
                    Ok(()) => disabled += 1,
                    Err(err) => tracing::error!("failed to disable {}: {}", name, err),
                }
            }
        }
        tracing::info!("disabled {} plugins", disabled);
        disabled
    }

    // ------------------------------------------------------------------
    // Updates

    /// Scan and apply pending updates now.
    pub fn check_and_apply_updates(&self) -> Result<UpdateOutcome> {
        match &self.updater {
            Some(updater) => Ok(updater.check_and_apply()),
            None => Err(Error::plugin("plugin updates not configured")),
        }
    }

    // ------------------------------------------------------------------
    // Extension passthroughs

    /// All extensions for `point`, in ordinal order.
    pub fn get_extensions(&self, point: &str) -> Vec<AnyExtension> {
        self.extensions.get(point)
    }

    /// The highest-priority extension for `point`.
    pub fn get_extension(&self, point: &str) -> Option<AnyExtension> {
        self.extensions.first(point)
    }

    /// Extensions for `point` owned by `plugin`.
    pub fn get_extensions_by_plugin(&self, point: &str, plugin: &str) -> Vec<AnyExtension> {
        self.extensions.get_by_plugin(point, plugin)
    }

    /// Register an extension point that does not come from a bundle.
    pub fn register_extension_point(&self, point: &str, description: &str) -> Result<()> {
        self.extensions.register_point(point, description)
    }

    /// Extension point diagnostics.
    pub fn extension_info(&self) -> Vec<ExtensionPointInfo> {
        self.extensions.info()
    }

    // ------------------------------------------------------------------
    // Shutdown

    /// Shut the host down: disable everything in reverse load order,
    /// unload everything, clear the extension manager, stop the
    /// scheduler, tear down loader staging, clear the registry, and shut
    /// down the event bus.
    pub fn shutdown(&self) {
        tracing::info!("shutting down plugin manager");

        self.disable_all();

        for name in self.load_order().iter().rev() {
            if let Err(err) = self.unload(name) {
                tracing::error!("error unloading {} during shutdown: {}", name, err);
            }
        }

        self.metadata.clear();
        self.extensions.clear_all();
        self.scheduler.shutdown();
        self.loader.cleanup_all();
        self.registry.clear();
        self.configs.shutdown();
        self.events.shutdown();

        tracing::info!("plugin manager shutdown completed");
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugin_dir", &self.plugin_dir)
            .field("plugins", &self.registry.len())
            .finish()
    }
}
