//! # bundle-host
//!
//! Host runtime for pluggable applications: discovers self-contained
//! plugin bundles on disk, loads them in dependency order into isolated
//! namespaces, drives each through its lifecycle (load, enable, disable,
//! unload), dispatches events and scheduled tasks to them, applies
//! atomic on-disk upgrades, and hot-reloads running plugins while
//! preserving their state.
//!
//! This crate provides:
//! - **Registry & lifecycle** - validated state transitions per plugin
//! - **Dependency resolution** - topological load order with cycle detection
//! - **Isolated loading** - staged bundle copies behind disposable namespace handles
//! - **Events & scheduling** - priority-ordered dispatch and cancellable tasks
//! - **Updates** - scan/apply/rollback with timestamped backups
//! - **Hot reload** - multi-phase swap with state capture and file-level rollback
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bundle_host::{EntryTable, HostConfig, PluginManager};
//!
//! let entries = std::sync::Arc::new(EntryTable::new());
//! entries.register_plugin("demo:plugin", || std::sync::Arc::new(MyPlugin::new()));
//!
//! let manager = PluginManager::new(HostConfig::new("plugins"), entries)?;
//! manager.load_all()?;
//! manager.enable_all();
//! ```
//!
//! Bundles come in two kinds: manifest bundles (a key/value manifest
//! whose `main` names a constructor in the host's [`EntryTable`]) and
//! native bundles (dynamic libraries exporting a `bundle_manifest`
//! symbol and the constructor symbol named by `main`).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod config;
mod error;
mod events;
mod extensions;
mod lifecycle;
mod loader;
mod manager;
mod manifest;
mod plugin;
mod pool;
mod registry;
mod reload;
mod resolver;
mod scheduler;
mod snapshot;
mod updater;
mod watcher;

pub use config::{ConfigManager, PluginConfig};
pub use error::{Error, PluginOp, Result};
pub use events::{CancelFlag, Event, EventBus, Priority, Subscriptions};
pub use extensions::{
    AnyExtension, ExtensionCtor, ExtensionDecl, ExtensionInfo, ExtensionManager,
    ExtensionPointInfo, ExtensionWrapper,
};
pub use lifecycle::PluginState;
pub use loader::{
    EntryDef, EntryTable, LoaderConfig, NativeExtension, PluginCtor, PluginLoader,
    PluginNamespace, TempStats,
};
pub use manager::{HostConfig, PluginManager};
pub use manifest::{PluginMetadata, Version};
pub use plugin::{HotReloadAware, Plugin, PluginContext, PluginHandle, StatefulPlugin};
pub use registry::{PluginRegistry, RegistryStatus};
pub use reload::{
    HotReloadOrchestrator, ReloadConfig, ReloadOptions, ReloadPhase, ReloadResult, ReloadTicket,
};
pub use resolver::{DependencyAnalysis, DependencyResolver};
pub use scheduler::{ScheduledTask, SchedulerConfig, SchedulerStats, TaskHandle, TaskScheduler};
pub use snapshot::{SnapshotStore, StateSnapshot};
pub use updater::{
    BackupRecord, UpdateCandidate, UpdateConfig, UpdateFailure, UpdateKind, UpdateManager,
    UpdateOutcome, UpdateScan, UpdateStage, UpdateStats,
};
pub use watcher::{BundleWatcher, WatchConfig};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
