//! Error types for host runtime operations.

use thiserror::Error;

use crate::lifecycle::PluginState;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle operation names used by [`Error::Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginOp {
    /// Loading a bundle and constructing the instance.
    Load,
    /// Enabling a loaded plugin.
    Enable,
    /// Disabling an enabled plugin.
    Disable,
    /// Full reload (disable, unload, load, enable).
    Reload,
    /// Unloading and unregistering.
    Unload,
}

impl std::fmt::Display for PluginOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Reload => "reload",
            Self::Unload => "unload",
        };
        write!(f, "{}", name)
    }
}

/// Errors that can occur during plugin host operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bundle manifest is missing, unreadable, or lacks required fields.
    #[error("invalid metadata in {bundle}: {reason}")]
    Metadata {
        /// Bundle file the manifest came from.
        bundle: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Namespace construction or entry instantiation failed.
    #[error("failed to load {bundle}: {reason}")]
    Load {
        /// Bundle file being loaded.
        bundle: String,
        /// What failed.
        reason: String,
    },

    /// Plugin is not registered.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// A plugin with this name is already registered.
    #[error("plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// State machine violation.
    #[error("invalid state transition for {name}: {from} -> {to}")]
    InvalidTransition {
        /// Plugin whose transition was rejected.
        name: String,
        /// State it was in.
        from: PluginState,
        /// State that was requested.
        to: PluginState,
    },

    /// A listed dependency is not present among the discovered plugins.
    #[error("plugin {plugin} requires missing dependency {dependency}")]
    MissingDependency {
        /// Plugin declaring the dependency.
        plugin: String,
        /// The dependency that could not be found.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("circular dependency detected: {}", path.join(" -> "))]
    CircularDependency {
        /// The cycle, starting and ending with the same plugin name.
        path: Vec<String>,
    },

    /// A lifecycle operation failed; wraps the underlying error.
    #[error("{op} failed for {name}: {source}")]
    Operation {
        /// Which operation failed.
        op: PluginOp,
        /// Plugin the operation was applied to.
        name: String,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// State snapshot capture or restore failed.
    #[error("state snapshot error: {0}")]
    State(String),

    /// File watching failed.
    #[error("watch error: {0}")]
    Watch(String),

    /// A plugin hook reported a failure.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a metadata error.
    pub fn metadata(bundle: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Metadata {
            bundle: bundle.into(),
            reason: reason.into(),
        }
    }

    /// Create a load error.
    pub fn load(bundle: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            bundle: bundle.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a missing-dependency error.
    pub fn missing_dependency(plugin: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::MissingDependency {
            plugin: plugin.into(),
            dependency: dependency.into(),
        }
    }

    /// Wrap a cause in an operation failure.
    pub fn operation(op: PluginOp, name: impl Into<String>, source: Error) -> Self {
        Self::Operation {
            op,
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Create a plugin hook error.
    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    /// Create a state snapshot error.
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("sample");
        assert_eq!(err.to_string(), "plugin not found: sample");

        let err = Error::missing_dependency("a", "b");
        assert!(err.to_string().contains("a"));
        assert!(err.to_string().contains("b"));
    }

    #[test]
    fn test_cycle_display() {
        let err = Error::CircularDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_operation_wraps_cause() {
        let err = Error::operation(PluginOp::Enable, "sample", Error::plugin("boom"));
        let text = err.to_string();
        assert!(text.contains("enable failed for sample"));
        assert!(text.contains("boom"));
    }
}
