//! Per-plugin persistent configuration backed by properties files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::Result;

/// Key/value store persisted at `<data>/<plugin>/config.properties`.
///
/// Values are strings on disk; typed getters parse on read. Lists are
/// stored comma-separated. Saving is atomic: the file is written to a
/// `.tmp` sibling and renamed into place.
pub struct PluginConfig {
    path: Option<PathBuf>,
    values: RwLock<BTreeMap<String, String>>,
}

impl PluginConfig {
    /// Open the config file at `path`, creating it with defaults when it
    /// does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let config = Self {
            path: Some(path.into()),
            values: RwLock::new(BTreeMap::new()),
        };
        config.reload();
        config
    }

    /// A config with no backing file. Used for embedded and test plugins;
    /// `save` is a no-op.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Raw string value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// String value with a default.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Integer value; `None` when absent or unparseable.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        match value.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("invalid integer value for key {}: {}", key, value);
                None
            }
        }
    }

    /// Integer value with a default.
    pub fn get_int_or(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    /// Float value; `None` when absent or unparseable.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        let value = self.get(key)?;
        match value.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!("invalid float value for key {}: {}", key, value);
                None
            }
        }
    }

    /// Float value with a default.
    pub fn get_float_or(&self, key: &str, default: f64) -> f64 {
        self.get_float(key).unwrap_or(default)
    }

    /// Boolean value. `true`, `yes`, `1`, and `on` (case-insensitive)
    /// parse as true; any other present value is false.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "1" | "on"
            )
        })
    }

    /// Boolean value with a default.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Comma-separated list value; empty when absent.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set a value.
    pub fn set(&self, key: &str, value: impl ToString) {
        self.values
            .write()
            .insert(key.to_string(), value.to_string());
    }

    /// Set a list value, persisted comma-separated.
    pub fn set_list<S: ToString>(&self, key: &str, values: &[S]) {
        let joined = values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.set(key, joined);
    }

    /// Remove a key.
    pub fn remove(&self, key: &str) {
        self.values.write().remove(key);
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }

    /// Write the config to disk atomically.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = format!(
            "# Plugin configuration - generated {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        for (key, value) in self.values.read().iter() {
            out.push_str(&format!("{}={}\n", key, value));
        }

        let tmp = path.with_extension("properties.tmp");
        fs::write(&tmp, out)?;
        fs::rename(&tmp, path)?;
        tracing::debug!("config saved to {}", path.display());
        Ok(())
    }

    /// Re-read from disk, replacing in-memory values. A missing file is
    /// recreated with defaults.
    pub fn reload(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };

        let mut values = self.values.write();
        values.clear();

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(text) => {
                    for line in text.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                            continue;
                        }
                        if let Some((key, value)) = line.split_once('=') {
                            values.insert(key.trim().to_string(), value.trim().to_string());
                        }
                    }
                    tracing::debug!("config loaded from {}", path.display());
                }
                Err(err) => {
                    tracing::error!("failed to load config from {}: {}", path.display(), err);
                }
            }
        } else {
            values.insert("plugin.enabled".to_string(), "true".to_string());
            values.insert("plugin.debug".to_string(), "false".to_string());
            drop(values);
            if let Err(err) = self.save() {
                tracing::error!("failed to create default config: {}", err);
            }
            tracing::debug!("created default config at {}", path.display());
        }
    }
}

impl std::fmt::Debug for PluginConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConfig")
            .field("path", &self.path)
            .field("keys", &self.values.read().len())
            .finish()
    }
}

/// Hands out one [`PluginConfig`] per plugin under a shared data directory.
pub struct ConfigManager {
    data_dir: PathBuf,
    configs: DashMap<String, Arc<PluginConfig>>,
}

impl ConfigManager {
    /// Create a manager rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        if let Err(err) = fs::create_dir_all(&data_dir) {
            tracing::error!(
                "failed to create config data directory {}: {}",
                data_dir.display(),
                err
            );
        }
        Self {
            data_dir,
            configs: DashMap::new(),
        }
    }

    /// The config for `plugin`, created on first access.
    pub fn get(&self, plugin: &str) -> Arc<PluginConfig> {
        self.configs
            .entry(plugin.to_string())
            .or_insert_with(|| {
                let path = self.data_dir.join(plugin).join("config.properties");
                Arc::new(PluginConfig::open(path))
            })
            .clone()
    }

    /// Whether a config was already opened for `plugin`.
    pub fn has(&self, plugin: &str) -> bool {
        self.configs.contains_key(plugin)
    }

    /// Reload a plugin's config from disk.
    pub fn reload(&self, plugin: &str) {
        if let Some(config) = self.configs.get(plugin) {
            config.reload();
        }
    }

    /// Save every opened config.
    pub fn save_all(&self) {
        for entry in self.configs.iter() {
            if let Err(err) = entry.value().save() {
                tracing::error!("failed to save config for {}: {}", entry.key(), err);
            }
        }
    }

    /// Save and drop a plugin's config.
    pub fn remove(&self, plugin: &str) {
        if let Some((_, config)) = self.configs.remove(plugin) {
            if let Err(err) = config.save() {
                tracing::error!("failed to save config for {}: {}", plugin, err);
            }
        }
    }

    /// Save everything and drop the cache.
    pub fn shutdown(&self) {
        self.save_all();
        self.configs.clear();
    }

    /// The root data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("data_dir", &self.data_dir)
            .field("configs", &self.configs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.properties");

        let config = PluginConfig::open(&path);
        assert!(path.exists());
        assert_eq!(config.get_bool("plugin.enabled"), Some(true));
        assert_eq!(config.get_bool("plugin.debug"), Some(false));
    }

    #[test]
    fn test_typed_getters() {
        let config = PluginConfig::in_memory();
        config.set("count", 42);
        config.set("ratio", 0.5);
        config.set("flag", "yes");
        config.set("off", "nope");
        config.set_list("names", &["a", "b", "c"]);

        assert_eq!(config.get_int("count"), Some(42));
        assert_eq!(config.get_int_or("missing", 7), 7);
        assert_eq!(config.get_float("ratio"), Some(0.5));
        assert_eq!(config.get_bool("flag"), Some(true));
        // A present but unrecognized value is false, not the default.
        assert_eq!(config.get_bool_or("off", true), false);
        assert_eq!(config.get_bool_or("missing", true), true);
        assert_eq!(config.get_list("names"), vec!["a", "b", "c"]);
        assert!(config.get_list("missing").is_empty());
    }

    #[test]
    fn test_invalid_number_falls_back() {
        let config = PluginConfig::in_memory();
        config.set("count", "not-a-number");
        assert_eq!(config.get_int("count"), None);
        assert_eq!(config.get_int_or("count", 3), 3);
    }

    #[test]
    fn test_save_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.properties");

        let config = PluginConfig::open(&path);
        config.set("greeting", "hello world");
        config.set("count", 5);
        config.set_list("tags", &["x", "y"]);
        config.save().unwrap();

        let reopened = PluginConfig::open(&path);
        assert_eq!(reopened.keys(), config.keys());
        assert_eq!(reopened.get("greeting").as_deref(), Some("hello world"));
        assert_eq!(reopened.get_int("count"), Some(5));
        assert_eq!(reopened.get_list("tags"), vec!["x", "y"]);
    }

    #[test]
    fn test_reload_discards_unsaved_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.properties");

        let config = PluginConfig::open(&path);
        config.set("kept", "v1");
        config.save().unwrap();

        config.set("kept", "v2");
        config.set("transient", "x");
        config.reload();

        assert_eq!(config.get("kept").as_deref(), Some("v1"));
        assert!(!config.contains("transient"));
    }

    #[test]
    fn test_manager_caches_per_plugin() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path());

        let a = manager.get("alpha");
        let b = manager.get("alpha");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.has("alpha"));
        assert!(dir.path().join("alpha").join("config.properties").exists());

        a.set("key", "value");
        manager.shutdown();
        assert!(!manager.has("alpha"));

        let again = ConfigManager::new(dir.path()).get("alpha");
        assert_eq!(again.get("key").as_deref(), Some("value"));
    }
}
