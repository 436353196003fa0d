//! Runtime state snapshots for hot reload.
//!
//! The snapshot schema is explicit and language-neutral: config entries as
//! strings, custom data as JSON values, and the set of active task ids.
//! Snapshots are persisted atomically (`.tmp` then rename) under
//! `<state_dir>/<plugin>.state`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::manifest::Version;
use crate::plugin::PluginHandle;

/// A captured plugin state, sufficient to restore the same logical state
/// into a freshly loaded instance of a compatible version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Plugin the state belongs to.
    pub plugin_name: String,
    /// Plugin version at capture time.
    pub version: String,
    /// Capture time in milliseconds since the epoch.
    pub timestamp: u64,
    /// Config entries at capture time.
    pub config_data: BTreeMap<String, String>,
    /// Custom data supplied by the plugin's stateful capability.
    pub custom_data: HashMap<String, serde_json::Value>,
    /// Ids of the plugin's tasks that were active at capture time.
    pub active_task_ids: BTreeSet<u64>,
}

impl StateSnapshot {
    /// Whether this snapshot may be restored into `new_version`: exact
    /// match, or same major with the new minor at least the captured one.
    pub fn is_compatible_with(&self, new_version: &str) -> bool {
        Version::state_compatible(&self.version, new_version)
    }
}

/// Persists and restores [`StateSnapshot`]s under a state directory.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for `plugin`.
    pub fn path(&self, plugin: &str) -> PathBuf {
        self.dir.join(format!("{}.state", plugin))
    }

    /// Capture a plugin's state and persist it.
    ///
    /// Gathers the full config map, the custom data map from the stateful
    /// capability (empty when the plugin has none), and the plugin's
    /// active task ids.
    pub fn capture(&self, handle: &PluginHandle) -> Result<StateSnapshot> {
        let name = handle.name().to_string();
        tracing::info!("capturing state for plugin {}", name);

        let config_data = handle.context().config().entries();
        let custom_data = handle
            .instance()
            .stateful()
            .map(|stateful| stateful.save_state())
            .unwrap_or_default();
        let active_task_ids = handle.context().active_task_ids();

        let snapshot = StateSnapshot {
            plugin_name: name.clone(),
            version: handle.version().to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            config_data,
            custom_data,
            active_task_ids,
        };

        self.persist(&snapshot)?;
        tracing::info!("captured state for plugin {}", name);
        Ok(snapshot)
    }

    /// Restore a snapshot into a freshly loaded instance.
    ///
    /// Skips restoration (returning `false`) when the snapshot's version
    /// is not compatible with the new instance. Restore failures are
    /// contained and logged; they never propagate.
    pub fn restore(&self, handle: &PluginHandle, snapshot: &StateSnapshot) -> bool {
        let name = handle.name();
        if !snapshot.is_compatible_with(handle.version()) {
            tracing::warn!(
                "version incompatible ({} -> {}), skipping state restore for {}",
                snapshot.version,
                handle.version(),
                name
            );
            return false;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let config = handle.context().config();
            for (key, value) in &snapshot.config_data {
                config.set(key, value);
            }

            if let Some(stateful) = handle.instance().stateful() {
                if !snapshot.custom_data.is_empty() {
                    stateful.load_state(snapshot.custom_data.clone());
                }
                stateful.restore_tasks(snapshot.active_task_ids.clone());
            }
        }));

        match outcome {
            Ok(()) => {
                tracing::info!("restored state for plugin {}", name);
                true
            }
            Err(_) => {
                tracing::error!("failed to restore state for plugin {}", name);
                false
            }
        }
    }

    /// Write a snapshot atomically: serialize to a `.tmp` sibling, then
    /// rename into place.
    pub fn persist(&self, snapshot: &StateSnapshot) -> Result<()> {
        let path = self.path(&snapshot.plugin_name);
        let tmp = path.with_extension("state.tmp");

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|err| Error::state(format!("failed to serialize snapshot: {}", err)))?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load the persisted snapshot for `plugin`, if one exists.
    pub fn load(&self, plugin: &str) -> Result<Option<StateSnapshot>> {
        let path = self.path(plugin);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let snapshot = serde_json::from_str(&text)
            .map_err(|err| Error::state(format!("failed to parse snapshot: {}", err)))?;
        Ok(Some(snapshot))
    }

    /// Delete the persisted snapshot for `plugin`, if any.
    pub fn delete(&self, plugin: &str) {
        let path = self.path(plugin);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to delete snapshot {}: {}", path.display(), err);
            }
        }
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").field("dir", &self.dir).finish()
    }
}
