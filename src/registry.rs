//! Thread-safe registry of plugin instances and their lifecycle states.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::lifecycle::PluginState;
use crate::plugin::PluginHandle;

/// Counts per state plus the total, as returned by [`PluginRegistry::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatus {
    /// Total registered plugins.
    pub total: usize,
    /// Plugins currently enabled.
    pub enabled: usize,
    /// Plugins currently disabled.
    pub disabled: usize,
    /// Plugins loaded but never enabled.
    pub loaded: usize,
    /// Plugins in the error state.
    pub error: usize,
}

/// The authoritative map of plugin name to (instance, state).
///
/// Invariant: a name is present in the instance map iff it is present in
/// the state map. Transition validation and the state write happen under
/// a single per-name entry lock so two racing writers cannot both observe
/// the same "from" state and succeed.
pub struct PluginRegistry {
    plugins: DashMap<String, PluginHandle>,
    states: DashMap<String, PluginState>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: DashMap::new(),
            states: DashMap::new(),
        }
    }

    /// Register a plugin in the [`PluginState::Loaded`] state.
    ///
    /// Fails with [`Error::AlreadyRegistered`] when the name is taken.
    pub fn register(&self, name: &str, handle: PluginHandle) -> Result<()> {
        match self.plugins.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                self.states.insert(name.to_string(), PluginState::Loaded);
                tracing::debug!("registered plugin {} in loaded state", name);
                Ok(())
            }
        }
    }

    /// Remove a plugin and its state. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.plugins.remove(name);
        let state = self.states.remove(name);
        if removed.is_some() {
            tracing::debug!(
                "unregistered plugin {} (was {})",
                name,
                state.map(|(_, s)| s).unwrap_or(PluginState::Error)
            );
            true
        } else {
            false
        }
    }

    /// Get a plugin handle by name.
    pub fn get(&self, name: &str) -> Option<PluginHandle> {
        self.plugins.get(name).map(|r| r.value().clone())
    }

    /// All registered handles.
    pub fn all(&self) -> Vec<PluginHandle> {
        self.plugins.iter().map(|r| r.value().clone()).collect()
    }

    /// All registered names.
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|r| r.key().clone()).collect()
    }

    /// Whether a plugin is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Current state of a plugin.
    ///
    /// Defaults to [`PluginState::Error`] for unknown names; callers that
    /// need to distinguish must check [`PluginRegistry::contains`].
    pub fn state(&self, name: &str) -> PluginState {
        self.states
            .get(name)
            .map(|r| *r.value())
            .unwrap_or(PluginState::Error)
    }

    /// Whether a plugin is in the enabled state.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.state(name) == PluginState::Enabled && self.contains(name)
    }

    /// Whether a plugin is in the disabled state.
    pub fn is_disabled(&self, name: &str) -> bool {
        self.contains(name) && self.state(name) == PluginState::Disabled
    }

    /// Whether a plugin is in the error state.
    pub fn is_error(&self, name: &str) -> bool {
        self.contains(name) && self.state(name) == PluginState::Error
    }

    /// Transition a plugin to `new_state` with validation.
    ///
    /// Fails with [`Error::NotFound`] for unregistered names and
    /// [`Error::InvalidTransition`] when the transition is not in the
    /// table, unless the current state is [`PluginState::Error`]
    /// (recovery is always allowed).
    pub fn set_state(&self, name: &str, new_state: PluginState) -> Result<()> {
        if !self.plugins.contains_key(name) {
            return Err(Error::not_found(name));
        }
        // Entry guard: validation and write form one critical section.
        match self.states.entry(name.to_string()) {
            Entry::Vacant(_) => Err(Error::not_found(name)),
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                if current != PluginState::Error && !current.can_transition_to(new_state) {
                    return Err(Error::InvalidTransition {
                        name: name.to_string(),
                        from: current,
                        to: new_state,
                    });
                }
                entry.insert(new_state);
                tracing::debug!("plugin {} state changed: {} -> {}", name, current, new_state);
                Ok(())
            }
        }
    }

    /// Set a plugin's state without validation. Recovery use only.
    pub fn force_state(&self, name: &str, state: PluginState) {
        let old = self.states.insert(name.to_string(), state);
        tracing::warn!(
            "forced plugin {} state: {:?} -> {} (validation bypassed)",
            name,
            old,
            state
        );
    }

    /// Names of plugins currently in `state`.
    pub fn by_state(&self, state: PluginState) -> Vec<String> {
        self.states
            .iter()
            .filter(|r| *r.value() == state)
            .map(|r| r.key().clone())
            .collect()
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Summary counts per state.
    pub fn status(&self) -> RegistryStatus {
        let mut status = RegistryStatus {
            total: self.plugins.len(),
            ..RegistryStatus::default()
        };
        for entry in self.states.iter() {
            match entry.value() {
                PluginState::Enabled => status.enabled += 1,
                PluginState::Disabled => status.disabled += 1,
                PluginState::Loaded => status.loaded += 1,
                PluginState::Error => status.error += 1,
            }
        }
        status
    }

    /// Drop everything. Shutdown use only.
    pub fn clear(&self) {
        self.plugins.clear();
        self.states.clear();
        tracing::debug!("registry cleared");
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugin_count", &self.plugins.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::events::EventBus;
    use crate::manifest::PluginMetadata;
    use crate::plugin::{Plugin, PluginContext};
    use crate::scheduler::TaskScheduler;
    use std::path::Path;
    use std::sync::Arc;

    struct NoopPlugin;
    impl Plugin for NoopPlugin {}

    fn handle(name: &str) -> PluginHandle {
        let text = format!("name={}\nversion=1.0.0\nmain=test:noop\n", name);
        let meta = PluginMetadata::from_manifest(&text, Path::new("test.plugin")).unwrap();
        let events = Arc::new(EventBus::new(1));
        let scheduler = Arc::new(TaskScheduler::with_sizes(1, 1));
        let config = Arc::new(PluginConfig::in_memory());
        let ctx = Arc::new(PluginContext::new(name, events, scheduler, config));
        PluginHandle::new(meta, Arc::new(NoopPlugin), ctx)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = PluginRegistry::new();
        registry.register("alpha", handle("alpha")).unwrap();

        assert!(registry.contains("alpha"));
        assert_eq!(registry.state("alpha"), PluginState::Loaded);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_duplicate() {
        let registry = PluginRegistry::new();
        registry.register("alpha", handle("alpha")).unwrap();
        let err = registry.register("alpha", handle("alpha")).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[test]
    fn test_instance_iff_state() {
        let registry = PluginRegistry::new();
        registry.register("alpha", handle("alpha")).unwrap();

        for name in registry.names() {
            assert!(registry.states.contains_key(&name));
        }
        assert!(registry.unregister("alpha"));
        assert!(!registry.plugins.contains_key("alpha"));
        assert!(!registry.states.contains_key("alpha"));
        assert!(!registry.unregister("alpha"));
    }

    #[test]
    fn test_unknown_state_defaults_to_error() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.state("ghost"), PluginState::Error);
        assert!(!registry.is_error("ghost"));
    }

    #[test]
    fn test_valid_transitions() {
        let registry = PluginRegistry::new();
        registry.register("alpha", handle("alpha")).unwrap();

        registry.set_state("alpha", PluginState::Enabled).unwrap();
        registry.set_state("alpha", PluginState::Disabled).unwrap();
        registry.set_state("alpha", PluginState::Enabled).unwrap();
        registry.set_state("alpha", PluginState::Error).unwrap();
        // Recovery from error.
        registry.set_state("alpha", PluginState::Loaded).unwrap();
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let registry = PluginRegistry::new();
        registry.register("alpha", handle("alpha")).unwrap();

        let err = registry
            .set_state("alpha", PluginState::Disabled)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: PluginState::Loaded,
                to: PluginState::Disabled,
                ..
            }
        ));
        // Unchanged after rejection.
        assert_eq!(registry.state("alpha"), PluginState::Loaded);
    }

    #[test]
    fn test_set_state_unregistered() {
        let registry = PluginRegistry::new();
        let err = registry.set_state("ghost", PluginState::Enabled).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_force_state_bypasses_validation() {
        let registry = PluginRegistry::new();
        registry.register("alpha", handle("alpha")).unwrap();
        registry.force_state("alpha", PluginState::Disabled);
        assert_eq!(registry.state("alpha"), PluginState::Disabled);
    }

    #[test]
    fn test_status_counts() {
        let registry = PluginRegistry::new();
        registry.register("a", handle("a")).unwrap();
        registry.register("b", handle("b")).unwrap();
        registry.register("c", handle("c")).unwrap();
        registry.set_state("a", PluginState::Enabled).unwrap();
        registry.set_state("b", PluginState::Error).unwrap();

        let status = registry.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.enabled, 1);
        assert_eq!(status.error, 1);
        assert_eq!(status.loaded, 1);
        assert_eq!(status.disabled, 0);

        assert_eq!(registry.by_state(PluginState::Enabled), vec!["a"]);
    }
}
