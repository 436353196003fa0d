//! Extension points and extensions, ordered by ordinal.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::loader::PluginNamespace;

/// A live extension instance, downcastable to its concrete type.
pub type AnyExtension = Arc<dyn Any + Send + Sync>;

/// Zero-argument extension constructor.
pub type ExtensionCtor = Arc<dyn Fn() -> AnyExtension + Send + Sync>;

/// A declared extension candidate, produced by the loader from the
/// bundle's manifest declarations.
pub struct ExtensionDecl {
    /// Entry identifier the declaration was resolved from.
    pub entry: String,
    /// Identifier of the extension point this extension satisfies.
    pub point: String,
    /// Sort key; lower ordinals come first (= higher priority).
    pub ordinal: i32,
    /// Human-readable description.
    pub description: String,
    /// Disabled declarations are skipped at registration.
    pub enabled: bool,
    /// Constructor for the extension instance.
    pub construct: ExtensionCtor,
}

impl std::fmt::Debug for ExtensionDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionDecl")
            .field("entry", &self.entry)
            .field("point", &self.point)
            .field("ordinal", &self.ordinal)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// A registered extension together with its bookkeeping.
///
/// The wrapper keeps the owning plugin's namespace handle alive so the
/// extension's code cannot be reclaimed while it is still registered.
pub struct ExtensionWrapper {
    instance: AnyExtension,
    entry: String,
    point: String,
    ordinal: i32,
    description: String,
    plugin: String,
    #[allow(dead_code)]
    namespace: Arc<PluginNamespace>,
}

impl ExtensionWrapper {
    /// The live extension instance.
    pub fn instance(&self) -> &AnyExtension {
        &self.instance
    }

    /// Entry identifier of the extension.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Extension point this extension belongs to.
    pub fn point(&self) -> &str {
        &self.point
    }

    /// Sort ordinal.
    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    /// Description from the declaration.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Name of the owning plugin.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }
}

/// Diagnostics for one extension.
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    /// Entry identifier.
    pub entry: String,
    /// Owning plugin.
    pub plugin: String,
    /// Sort ordinal.
    pub ordinal: i32,
    /// Description.
    pub description: String,
}

/// Diagnostics for one extension point.
#[derive(Debug, Clone)]
pub struct ExtensionPointInfo {
    /// Point identifier.
    pub point: String,
    /// Point description.
    pub description: String,
    /// Registered extensions in ordinal order.
    pub extensions: Vec<ExtensionInfo>,
}

/// Registry of extension points and the extensions satisfying them.
///
/// Two cross-indexed maps: point id to wrappers (sorted by ordinal
/// ascending) and plugin name to wrappers (for cleanup on unload). The
/// `DashMap` entry locks are the per-list synchronization.
pub struct ExtensionManager {
    by_point: DashMap<String, Vec<Arc<ExtensionWrapper>>>,
    by_plugin: DashMap<String, Vec<Arc<ExtensionWrapper>>>,
    points: DashMap<String, String>,
}

impl ExtensionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            by_point: DashMap::new(),
            by_plugin: DashMap::new(),
            points: DashMap::new(),
        }
    }

    /// Register an extension point, creating its (initially empty) list.
    ///
    /// Fails when `point` is not a usable identifier.
    pub fn register_point(&self, point: &str, description: &str) -> Result<()> {
        if point.trim().is_empty() {
            return Err(Error::plugin("extension point identifier must not be empty"));
        }
        self.points
            .entry(point.to_string())
            .or_insert_with(|| description.to_string());
        self.by_point.entry(point.to_string()).or_default();
        tracing::info!("registered extension point {}", point);
        Ok(())
    }

    /// Whether an extension point is registered.
    pub fn has_point(&self, point: &str) -> bool {
        self.points.contains_key(point)
    }

    /// Register a plugin's extension candidates.
    ///
    /// Disabled candidates are skipped, as are candidates naming an
    /// unregistered extension point. Instances are constructed via the
    /// declaration's zero-argument constructor; every point list is
    /// re-sorted by ordinal afterwards.
    pub fn register_extensions(
        &self,
        plugin: &str,
        namespace: Arc<PluginNamespace>,
        candidates: Vec<ExtensionDecl>,
    ) {
        let mut registered = Vec::new();

        for decl in candidates {
            if !decl.enabled {
                continue;
            }
            if !self.points.contains_key(&decl.point) {
                tracing::warn!(
                    "no registered extension point {} for extension {}",
                    decl.point,
                    decl.entry
                );
                continue;
            }

            let wrapper = Arc::new(ExtensionWrapper {
                instance: (decl.construct)(),
                entry: decl.entry.clone(),
                point: decl.point.clone(),
                ordinal: decl.ordinal,
                description: decl.description,
                plugin: plugin.to_string(),
                namespace: namespace.clone(),
            });

            self.by_point
                .entry(decl.point.clone())
                .or_default()
                .push(wrapper.clone());
            registered.push(wrapper);

            tracing::info!(
                "registered extension {} for {} from plugin {}",
                decl.entry,
                decl.point,
                plugin
            );
        }

        if !registered.is_empty() {
            self.by_plugin
                .entry(plugin.to_string())
                .or_default()
                .extend(registered);
            self.sort_all();
        }
    }

    fn sort_all(&self) {
        for mut entry in self.by_point.iter_mut() {
            entry.value_mut().sort_by_key(|w| w.ordinal);
        }
    }

    /// All extension instances for `point`, in ordinal order.
    pub fn get(&self, point: &str) -> Vec<AnyExtension> {
        self.by_point
            .get(point)
            .map(|list| list.iter().map(|w| w.instance.clone()).collect())
            .unwrap_or_default()
    }

    /// Extensions for `point` downcast to `T`, in ordinal order.
    pub fn get_as<T: Any + Send + Sync>(&self, point: &str) -> Vec<Arc<T>> {
        self.get(point)
            .into_iter()
            .filter_map(|instance| instance.downcast::<T>().ok())
            .collect()
    }

    /// The highest-priority extension for `point`, if any.
    pub fn first(&self, point: &str) -> Option<AnyExtension> {
        self.by_point
            .get(point)
            .and_then(|list| list.first().map(|w| w.instance.clone()))
    }

    /// The highest-priority extension for `point` downcast to `T`.
    pub fn first_as<T: Any + Send + Sync>(&self, point: &str) -> Option<Arc<T>> {
        self.get_as(point).into_iter().next()
    }

    /// Extensions for `point` owned by `plugin`, in ordinal order.
    pub fn get_by_plugin(&self, point: &str, plugin: &str) -> Vec<AnyExtension> {
        self.by_point
            .get(point)
            .map(|list| {
                list.iter()
                    .filter(|w| w.plugin == plugin)
                    .map(|w| w.instance.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every extension owned by `plugin` from both indexes.
    pub fn unregister_plugin(&self, plugin: &str) {
        let Some((_, owned)) = self.by_plugin.remove(plugin) else {
            return;
        };
        for wrapper in &owned {
            if let Some(mut list) = self.by_point.get_mut(&wrapper.point) {
                list.retain(|w| !Arc::ptr_eq(w, wrapper));
            }
        }
        tracing::info!(
            "unregistered {} extensions from plugin {}",
            owned.len(),
            plugin
        );
    }

    /// Diagnostics for every registered extension point.
    pub fn info(&self) -> Vec<ExtensionPointInfo> {
        let mut infos: Vec<ExtensionPointInfo> = self
            .points
            .iter()
            .map(|entry| {
                let extensions = self
                    .by_point
                    .get(entry.key())
                    .map(|list| {
                        list.iter()
                            .map(|w| ExtensionInfo {
                                entry: w.entry.clone(),
                                plugin: w.plugin.clone(),
                                ordinal: w.ordinal,
                                description: w.description.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                ExtensionPointInfo {
                    point: entry.key().clone(),
                    description: entry.value().clone(),
                    extensions,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.point.cmp(&b.point));
        infos
    }

    /// Number of registered extension points.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Drop everything. Shutdown use only.
    pub fn clear_all(&self) {
        self.by_point.clear();
        self.by_plugin.clear();
        self.points.clear();
        tracing::info!("cleared all extensions");
    }
}

impl Default for ExtensionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("points", &self.points.len())
            .field("plugins", &self.by_plugin.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::EntryTable;

    struct Formatter {
        tag: &'static str,
    }

    fn namespace() -> Arc<PluginNamespace> {
        Arc::new(PluginNamespace::shared(
            "test",
            std::path::PathBuf::from("test.plugin"),
            Arc::new(EntryTable::new()),
        ))
    }

    fn decl(entry: &str, point: &str, ordinal: i32, enabled: bool, tag: &'static str) -> ExtensionDecl {
        ExtensionDecl {
            entry: entry.to_string(),
            point: point.to_string(),
            ordinal,
            description: String::new(),
            enabled,
            construct: Arc::new(move || -> AnyExtension { Arc::new(Formatter { tag }) }),
        }
    }

    #[test]
    fn test_register_point_validation() {
        let manager = ExtensionManager::new();
        assert!(manager.register_point("", "bad").is_err());
        manager.register_point("format", "formatters").unwrap();
        assert!(manager.has_point("format"));
        // Re-registration is harmless.
        manager.register_point("format", "other").unwrap();
        assert_eq!(manager.point_count(), 1);
    }

    #[test]
    fn test_ordinal_ordering() {
        let manager = ExtensionManager::new();
        manager.register_point("format", "").unwrap();

        manager.register_extensions(
            "alpha",
            namespace(),
            vec![
                decl("e-late", "format", 50, true, "late"),
                decl("e-early", "format", 1, true, "early"),
                decl("e-mid", "format", 10, true, "mid"),
            ],
        );

        let tags: Vec<&str> = manager
            .get_as::<Formatter>("format")
            .iter()
            .map(|f| f.tag)
            .collect();
        assert_eq!(tags, vec!["early", "mid", "late"]);

        let first = manager.first_as::<Formatter>("format").unwrap();
        assert_eq!(first.tag, "early");
    }

    #[test]
    fn test_disabled_and_unknown_point_skipped() {
        let manager = ExtensionManager::new();
        manager.register_point("format", "").unwrap();

        manager.register_extensions(
            "alpha",
            namespace(),
            vec![
                decl("off", "format", 0, false, "off"),
                decl("dangling", "missing-point", 0, true, "dangling"),
                decl("ok", "format", 0, true, "ok"),
            ],
        );

        assert_eq!(manager.get("format").len(), 1);
        assert!(manager.get("missing-point").is_empty());
    }

    #[test]
    fn test_unregister_plugin_removes_everywhere() {
        let manager = ExtensionManager::new();
        manager.register_point("format", "").unwrap();

        manager.register_extensions(
            "alpha",
            namespace(),
            vec![decl("a1", "format", 0, true, "a")],
        );
        manager.register_extensions(
            "beta",
            namespace(),
            vec![decl("b1", "format", 1, true, "b")],
        );
        assert_eq!(manager.get("format").len(), 2);

        manager.unregister_plugin("alpha");
        let remaining = manager.info();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].extensions.len(), 1);
        assert_eq!(remaining[0].extensions[0].plugin, "beta");

        // Unregistering again is a no-op.
        manager.unregister_plugin("alpha");
        assert_eq!(manager.get("format").len(), 1);
    }

    #[test]
    fn test_get_by_plugin() {
        let manager = ExtensionManager::new();
        manager.register_point("format", "").unwrap();

        manager.register_extensions(
            "alpha",
            namespace(),
            vec![decl("a1", "format", 0, true, "a")],
        );
        manager.register_extensions(
            "beta",
            namespace(),
            vec![decl("b1", "format", 1, true, "b")],
        );

        assert_eq!(manager.get_by_plugin("format", "alpha").len(), 1);
        assert_eq!(manager.get_by_plugin("format", "ghost").len(), 0);
    }

    #[test]
    fn test_clear_all() {
        let manager = ExtensionManager::new();
        manager.register_point("format", "").unwrap();
        manager.register_extensions(
            "alpha",
            namespace(),
            vec![decl("a1", "format", 0, true, "a")],
        );

        manager.clear_all();
        assert_eq!(manager.point_count(), 0);
        assert!(manager.get("format").is_empty());
    }
}
