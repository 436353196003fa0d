//! Plugin lifecycle states and the legal transitions between them.

/// Lifecycle state of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    /// Plugin is loaded and `on_load` has run, but it is not active.
    Loaded,
    /// Plugin is enabled and receiving events.
    Enabled,
    /// Plugin was disabled but remains in memory.
    Disabled,
    /// Something went wrong during loading, enabling, or at runtime.
    Error,
}

impl PluginState {
    /// Check if the plugin is actively running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Check if the plugin can transition to [`PluginState::Enabled`].
    pub fn can_enable(&self) -> bool {
        matches!(self, Self::Loaded | Self::Disabled)
    }

    /// Check if the plugin can transition to [`PluginState::Disabled`].
    pub fn can_disable(&self) -> bool {
        matches!(self, Self::Enabled)
    }

    /// Check if this is the error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }

    /// Check whether `self -> to` appears in the transition table.
    ///
    /// Recovery out of [`PluginState::Error`] is always allowed.
    pub fn can_transition_to(&self, to: PluginState) -> bool {
        match self {
            Self::Loaded => matches!(to, Self::Enabled | Self::Error),
            Self::Enabled => matches!(to, Self::Disabled | Self::Error),
            Self::Disabled => matches!(to, Self::Enabled | Self::Error),
            Self::Error => matches!(to, Self::Loaded | Self::Disabled | Self::Enabled),
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Loaded => "Plugin is loaded but not active",
            Self::Enabled => "Plugin is active and running",
            Self::Disabled => "Plugin is loaded but inactive",
            Self::Error => "Plugin encountered an error",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Error => "error",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(PluginState::Loaded.can_enable());
        assert!(PluginState::Disabled.can_enable());
        assert!(!PluginState::Enabled.can_enable());
        assert!(!PluginState::Error.can_enable());

        assert!(PluginState::Enabled.can_disable());
        assert!(!PluginState::Loaded.can_disable());
        assert!(!PluginState::Disabled.can_disable());

        assert!(PluginState::Enabled.is_active());
        assert!(!PluginState::Disabled.is_active());
    }

    #[test]
    fn test_transition_table() {
        use PluginState::*;

        assert!(Loaded.can_transition_to(Enabled));
        assert!(Loaded.can_transition_to(Error));
        assert!(!Loaded.can_transition_to(Disabled));

        assert!(Enabled.can_transition_to(Disabled));
        assert!(Enabled.can_transition_to(Error));
        assert!(!Enabled.can_transition_to(Loaded));

        assert!(Disabled.can_transition_to(Enabled));
        assert!(Disabled.can_transition_to(Error));
        assert!(!Disabled.can_transition_to(Loaded));

        // Recovery from error is always allowed.
        assert!(Error.can_transition_to(Loaded));
        assert!(Error.can_transition_to(Disabled));
        assert!(Error.can_transition_to(Enabled));
    }

    #[test]
    fn test_display() {
        assert_eq!(PluginState::Enabled.to_string(), "enabled");
        assert_eq!(PluginState::Error.to_string(), "error");
    }
}
