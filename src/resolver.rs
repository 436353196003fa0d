//! Dependency resolution: topological ordering with cycle detection.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::manifest::PluginMetadata;

/// Resolves plugin load order from declared dependencies.
///
/// Depth-first topological sort: every plugin appears after all of its
/// transitive dependencies. Plugins at equal depth are visited in
/// ascending name order so the result is deterministic.
#[derive(Debug, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a resolver.
    pub fn new() -> Self {
        Self
    }

    /// Resolve the load order for `plugins`.
    ///
    /// Fails with [`Error::MissingDependency`] when any listed dependency
    /// is absent, and with [`Error::CircularDependency`] when the graph
    /// has a cycle. Empty input yields an empty order.
    pub fn resolve(&self, plugins: &HashMap<String, PluginMetadata>) -> Result<Vec<String>> {
        if plugins.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!("resolving dependencies for {} plugins", plugins.len());

        self.validate(plugins)?;

        let mut resolved: Vec<String> = Vec::with_capacity(plugins.len());
        let mut resolving: BTreeSet<String> = BTreeSet::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut path: Vec<String> = Vec::new();

        let mut names: Vec<&String> = plugins.keys().collect();
        names.sort();

        for name in names {
            if !visited.contains(name.as_str()) {
                self.visit(name, plugins, &mut resolved, &mut resolving, &mut visited, &mut path)?;
            }
        }

        tracing::debug!("dependency resolution completed, load order: {:?}", resolved);
        Ok(resolved)
    }

    /// Validate that every listed dependency exists in the input map.
    fn validate(&self, plugins: &HashMap<String, PluginMetadata>) -> Result<()> {
        let mut names: Vec<&String> = plugins.keys().collect();
        names.sort();
        for name in names {
            for dep in &plugins[name].dependencies {
                if !plugins.contains_key(dep) {
                    return Err(Error::missing_dependency(name, dep));
                }
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        name: &str,
        plugins: &HashMap<String, PluginMetadata>,
        resolved: &mut Vec<String>,
        resolving: &mut BTreeSet<String>,
        visited: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> Result<()> {
        if resolved.iter().any(|r| r == name) {
            return Ok(());
        }

        if resolving.contains(name) {
            // Cycle: report the path from the first occurrence of the
            // repeated name back to the duplicate.
            let start = path.iter().position(|p| p == name).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].to_vec();
            cycle.push(name.to_string());
            return Err(Error::CircularDependency { path: cycle });
        }

        visited.insert(name.to_string());
        resolving.insert(name.to_string());
        path.push(name.to_string());

        let result = (|| {
            let metadata = plugins
                .get(name)
                .ok_or_else(|| Error::missing_dependency(name, name))?;
            for dep in &metadata.dependencies {
                if !resolved.iter().any(|r| r == dep) {
                    self.visit(dep, plugins, resolved, resolving, visited, path)?;
                }
            }
            resolved.push(name.to_string());
            Ok(())
        })();

        resolving.remove(name);
        path.pop();
        result
    }

    /// Non-failing structural analysis of the dependency graph.
    pub fn analyze(&self, plugins: &HashMap<String, PluginMetadata>) -> DependencyAnalysis {
        let mut forward: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut reverse: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut roots: BTreeSet<String> = BTreeSet::new();

        for (name, metadata) in plugins {
            forward.insert(
                name.clone(),
                metadata.dependencies.iter().cloned().collect(),
            );
            if metadata.dependencies.is_empty() {
                roots.insert(name.clone());
            }
            for dep in &metadata.dependencies {
                reverse.entry(dep.clone()).or_default().insert(name.clone());
            }
        }

        let leaves: BTreeSet<String> = plugins
            .keys()
            .filter(|name| !reverse.contains_key(*name))
            .cloned()
            .collect();

        DependencyAnalysis {
            forward,
            reverse,
            roots,
            leaves,
            total: plugins.len(),
        }
    }

    /// Enumerate every cycle in the graph without failing.
    pub fn find_cycles(&self, plugins: &HashMap<String, PluginMetadata>) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited = BTreeSet::new();
        let mut stack = BTreeSet::new();
        let mut path = Vec::new();

        let mut names: Vec<&String> = plugins.keys().collect();
        names.sort();

        for name in names {
            if !visited.contains(name.as_str()) {
                self.find_cycles_from(name, plugins, &mut visited, &mut stack, &mut path, &mut cycles);
            }
        }
        cycles
    }

    fn find_cycles_from(
        &self,
        name: &str,
        plugins: &HashMap<String, PluginMetadata>,
        visited: &mut BTreeSet<String>,
        stack: &mut BTreeSet<String>,
        path: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(name.to_string());
        stack.insert(name.to_string());
        path.push(name.to_string());

        if let Some(metadata) = plugins.get(name) {
            for dep in &metadata.dependencies {
                if !visited.contains(dep) {
                    self.find_cycles_from(dep, plugins, visited, stack, path, cycles);
                } else if stack.contains(dep) {
                    let start = path.iter().position(|p| p == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    cycles.push(cycle);
                }
            }
        }

        stack.remove(name);
        path.pop();
    }
}

/// Structural information about the dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyAnalysis {
    /// Plugin name to the set of plugins it depends on.
    pub forward: BTreeMap<String, BTreeSet<String>>,
    /// Plugin name to the set of plugins that depend on it.
    pub reverse: BTreeMap<String, BTreeSet<String>>,
    /// Plugins with no dependencies.
    pub roots: BTreeSet<String>,
    /// Plugins nothing depends on.
    pub leaves: BTreeSet<String>,
    /// Total plugins analyzed.
    pub total: usize,
}

impl DependencyAnalysis {
    /// Plugins that depend on `name`.
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.reverse.get(name).cloned().unwrap_or_default()
    }

    /// Plugins `name` depends on.
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.forward.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn meta(name: &str, deps: &[&str]) -> PluginMetadata {
        let mut text = format!("name={}\nversion=1.0.0\nmain=test:{}\n", name, name);
        if !deps.is_empty() {
            text.push_str(&format!("dependencies={}\n", deps.join(",")));
        }
        PluginMetadata::from_manifest(&text, Path::new("test.plugin")).unwrap()
    }

    fn graph(entries: &[(&str, &[&str])]) -> HashMap<String, PluginMetadata> {
        entries
            .iter()
            .map(|(name, deps)| (name.to_string(), meta(name, deps)))
            .collect()
    }

    #[test]
    fn test_empty_input() {
        let resolver = DependencyResolver::new();
        assert!(resolver.resolve(&HashMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_linear_chain() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);

        let order = resolver.resolve(&plugins).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_every_name_once_and_deps_first() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);

        let order = resolver.resolve(&plugins).unwrap();
        assert_eq!(order.len(), 4);
        for (name, metadata) in &plugins {
            let my_idx = order.iter().position(|o| o == name).unwrap();
            for dep in &metadata.dependencies {
                let dep_idx = order.iter().position(|o| o == dep).unwrap();
                assert!(dep_idx < my_idx, "{} must load before {}", dep, name);
            }
        }
    }

    #[test]
    fn test_deterministic_tie_break() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[("z", &[]), ("m", &[]), ("a", &[])]);
        assert_eq!(resolver.resolve(&plugins).unwrap(), vec!["a", "m", "z"]);
    }

    #[test]
    fn test_missing_dependency() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[("a", &["ghost"])]);

        let err = resolver.resolve(&plugins).unwrap_err();
        match err {
            Error::MissingDependency { plugin, dependency } => {
                assert_eq!(plugin, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cycle_detection() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);

        let err = resolver.resolve(&plugins).unwrap_err();
        match err {
            Error::CircularDependency { path } => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
                for name in &path {
                    assert!(plugins.contains_key(name));
                }
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_self_cycle() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[("a", &["a"])]);

        let err = resolver.resolve(&plugins).unwrap_err();
        match err {
            Error::CircularDependency { path } => {
                assert_eq!(path, vec!["a", "a"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_analysis() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);

        let analysis = resolver.analyze(&plugins);
        assert_eq!(analysis.total, 3);
        assert!(analysis.roots.contains("a"));
        assert!(analysis.leaves.contains("c"));
        assert!(analysis.dependents_of("a").contains("b"));
        assert!(analysis.dependencies_of("c").contains("b"));
    }

    #[test]
    fn test_find_cycles_non_failing() {
        let resolver = DependencyResolver::new();
        let plugins = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);

        let cycles = resolver.find_cycles(&plugins);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].first(), cycles[0].last());

        let clean = graph(&[("a", &[]), ("b", &["a"])]);
        assert!(resolver.find_cycles(&clean).is_empty());
    }
}
