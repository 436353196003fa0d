//! Bundle metadata and the key/value manifest format.
//!
//! A manifest is plain UTF-8 `key=value` text, one pair per line, with
//! `#` and `!` comment lines. Required keys are `name`, `version`, and
//! `main`; `dependencies`, `extension-points`, and `extensions` are
//! comma-separated lists.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Dotted-numeric version, compared component-wise with zero padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(Vec<u64>);

impl Version {
    /// Parse a version like `1.2.3`.
    ///
    /// Returns `None` when any component is non-numeric; callers decide
    /// whether that is fatal (version checking enabled) or not.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: std::result::Result<Vec<u64>, _> =
            s.split('.').map(|p| p.trim().parse::<u64>()).collect();
        parts.ok().filter(|p| !p.is_empty()).map(Version)
    }

    /// Compare two version strings numerically, padding the shorter one
    /// with zeros. `None` when either side fails to parse.
    pub fn compare(a: &str, b: &str) -> Option<Ordering> {
        let a = Version::parse(a)?;
        let b = Version::parse(b)?;
        Some(a.cmp(&b))
    }

    /// Major component (first), zero if absent.
    pub fn major(&self) -> u64 {
        self.0.first().copied().unwrap_or(0)
    }

    /// Minor component (second), zero if absent.
    pub fn minor(&self) -> u64 {
        self.0.get(1).copied().unwrap_or(0)
    }

    /// Whether runtime state captured under `old` may be restored into an
    /// instance of `new`: exact match, or same major with the new minor at
    /// least the old one. Unparseable versions fall back to exact match.
    pub fn state_compatible(old: &str, new: &str) -> bool {
        if old == new {
            return true;
        }
        match (Version::parse(old), Version::parse(new)) {
            (Some(o), Some(n)) => o.major() == n.major() && n.minor() >= o.minor(),
            _ => false,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Immutable metadata describing one bundle.
#[derive(Debug, Clone)]
pub struct PluginMetadata {
    /// Unique plugin name.
    pub name: String,
    /// Dotted numeric version, e.g. `1.2.3`.
    pub version: String,
    /// Human-readable description.
    pub description: String,
    /// Author string.
    pub author: String,
    /// Entry identifier inside the bundle: an entry-table id for manifest
    /// bundles, an exported symbol name for native bundles.
    pub entry: String,
    /// Names of plugins that must load before this one.
    pub dependencies: Vec<String>,
    /// Extension point identifiers this bundle declares.
    pub extension_points: Vec<String>,
    /// Extension entry identifiers this bundle declares.
    pub extensions: Vec<String>,
    /// Path of the bundle file on disk.
    pub source: PathBuf,
}

impl PluginMetadata {
    /// Parse manifest text for the bundle at `source`.
    ///
    /// Fails with [`Error::Metadata`] when `name`, `version`, or `main`
    /// is absent.
    pub fn from_manifest(text: &str, source: &Path) -> Result<Self> {
        let bundle = source.display().to_string();
        let mut name = None;
        let mut version = None;
        let mut entry = None;
        let mut description = String::new();
        let mut author = String::new();
        let mut dependencies = Vec::new();
        let mut extension_points = Vec::new();
        let mut extensions = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "name" => name = Some(value.to_string()),
                "version" => version = Some(value.to_string()),
                "main" => entry = Some(value.to_string()),
                "description" => description = value.to_string(),
                "author" => author = value.to_string(),
                "dependencies" => dependencies = split_list(value),
                "extension-points" => extension_points = split_list(value),
                "extensions" => extensions = split_list(value),
                _ => {}
            }
        }

        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::metadata(&bundle, "missing required field: name"))?;
        let version = version
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::metadata(&bundle, "missing required field: version"))?;
        let entry = entry
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::metadata(&bundle, "missing required field: main"))?;

        Ok(Self {
            name,
            version,
            description,
            author,
            entry,
            dependencies,
            extension_points,
            extensions,
            source: source.to_path_buf(),
        })
    }

    /// Minimal placeholder metadata derived from a bundle file name, used
    /// when the manifest is unreadable so the bundle still shows up in
    /// discovery results.
    pub fn fallback(source: &Path) -> Self {
        let name = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed")
            .to_string();
        Self {
            name,
            version: "0.0.0".to_string(),
            description: String::new(),
            author: String::new(),
            entry: String::new(),
            dependencies: Vec::new(),
            extension_points: Vec::new(),
            extensions: Vec::new(),
            source: source.to_path_buf(),
        }
    }

    /// Render the metadata back into manifest text.
    pub fn to_manifest(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("name={}\n", self.name));
        out.push_str(&format!("version={}\n", self.version));
        out.push_str(&format!("main={}\n", self.entry));
        if !self.description.is_empty() {
            out.push_str(&format!("description={}\n", self.description));
        }
        if !self.author.is_empty() {
            out.push_str(&format!("author={}\n", self.author));
        }
        if !self.dependencies.is_empty() {
            out.push_str(&format!("dependencies={}\n", self.dependencies.join(",")));
        }
        if !self.extension_points.is_empty() {
            out.push_str(&format!(
                "extension-points={}\n",
                self.extension_points.join(",")
            ));
        }
        if !self.extensions.is_empty() {
            out.push_str(&format!("extensions={}\n", self.extensions.join(",")));
        }
        out
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
