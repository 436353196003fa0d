//! Bundle loading: metadata reading, staged copies, isolated namespaces,
//! and declared-extension discovery.
//!
//! Two bundle kinds share one loading path. A *manifest bundle* is a
//! key/value manifest file whose `main` entry names a constructor in the
//! host's [`EntryTable`]. A *native bundle* is a dynamic library exporting
//! a `bundle_manifest` symbol for metadata and the constructor symbol
//! named by `main`; it must be built with the same toolchain as the host.
//! Either way the plugin's code is reached only through a
//! [`PluginNamespace`] handle owned by the loader, and dropping the last
//! handle invalidates it.

use std::ffi::c_char;
use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use libloading::Library;

use crate::error::{Error, Result};
use crate::extensions::{AnyExtension, ExtensionCtor, ExtensionDecl, ExtensionManager};
use crate::manifest::PluginMetadata;
use crate::plugin::Plugin;

/// Descriptor returned by a native bundle's extension entry symbol.
pub struct NativeExtension {
    /// Extension point identifier.
    pub point: &'static str,
    /// Sort ordinal.
    pub ordinal: i32,
    /// Description.
    pub description: &'static str,
    /// Whether the extension should be registered at all.
    pub enabled: bool,
    /// Zero-argument constructor for the extension instance.
    pub construct: fn() -> AnyExtension,
}

/// Zero-argument plugin constructor.
pub type PluginCtor = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// An entry the host application makes resolvable inside manifest bundles.
#[derive(Clone)]
pub enum EntryDef {
    /// A plugin constructor; referenced by a manifest's `main` key.
    Plugin(PluginCtor),
    /// An extension point declaration.
    ExtensionPoint {
        /// Point description for diagnostics.
        description: &'static str,
    },
    /// An extension declaration.
    Extension {
        /// Extension point the extension satisfies.
        point: &'static str,
        /// Sort ordinal.
        ordinal: i32,
        /// Description for diagnostics.
        description: &'static str,
        /// Whether the extension is registered at all.
        enabled: bool,
        /// Zero-argument constructor.
        construct: ExtensionCtor,
    },
}

impl std::fmt::Debug for EntryDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plugin(_) => f.write_str("EntryDef::Plugin"),
            Self::ExtensionPoint { .. } => f.write_str("EntryDef::ExtensionPoint"),
            Self::Extension { point, ordinal, .. } => f
                .debug_struct("EntryDef::Extension")
                .field("point", point)
                .field("ordinal", ordinal)
                .finish(),
        }
    }
}

/// Host-side registry of constructors for manifest bundles.
///
/// The embedding application registers its compiled-in plugin and
/// extension constructors here before loading; manifest bundles reference
/// them by identifier.
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: DashMap<String, EntryDef>,
}

impl EntryTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a plugin constructor under `id`.
    pub fn register_plugin<F>(&self, id: &str, construct: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.entries
            .insert(id.to_string(), EntryDef::Plugin(Arc::new(construct)));
    }

    /// Register an extension point declaration under `id`.
    pub fn register_extension_point(&self, id: &str, description: &'static str) {
        self.entries
            .insert(id.to_string(), EntryDef::ExtensionPoint { description });
    }

    /// Register an extension declaration under `id`.
    pub fn register_extension<F>(
        &self,
        id: &str,
        point: &'static str,
        ordinal: i32,
        description: &'static str,
        enabled: bool,
        construct: F,
    ) where
        F: Fn() -> AnyExtension + Send + Sync + 'static,
    {
        self.entries.insert(
            id.to_string(),
            EntryDef::Extension {
                point,
                ordinal,
                description,
                enabled,
                construct: Arc::new(construct),
            },
        );
    }

    /// Look up an entry.
    pub fn get(&self, id: &str) -> Option<EntryDef> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum Backend {
    Shared(Arc<EntryTable>),
    Native(Library),
}

/// A plugin's private code-resolution scope.
///
/// For native bundles the namespace owns the `Library` opened on the
/// staged copy; dropping the last handle closes it and invalidates the
/// plugin's code. For manifest bundles it is a view over the host's
/// [`EntryTable`] tied to the staged file.
pub struct PluginNamespace {
    plugin: String,
    staged: PathBuf,
    backend: Backend,
}

impl PluginNamespace {
    pub(crate) fn shared(plugin: &str, staged: PathBuf, table: Arc<EntryTable>) -> Self {
        Self {
            plugin: plugin.to_string(),
            staged,
            backend: Backend::Shared(table),
        }
    }

    fn native(plugin: &str, staged: PathBuf, library: Library) -> Self {
        Self {
            plugin: plugin.to_string(),
            staged,
            backend: Backend::Native(library),
        }
    }

    /// Name of the plugin this namespace belongs to.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Path of the staged bundle copy backing this namespace.
    pub fn staged_path(&self) -> &Path {
        &self.staged
    }

    /// Whether this namespace wraps a dynamic library.
    pub fn is_native(&self) -> bool {
        matches!(self.backend, Backend::Native(_))
    }

    fn resolve_plugin(&self, entry: &str, bundle: &str) -> Result<Arc<dyn Plugin>> {
        match &self.backend {
            Backend::Shared(table) => match table.get(entry) {
                Some(EntryDef::Plugin(construct)) => Ok(construct()),
                Some(_) => Err(Error::load(
                    bundle,
                    format!("entry {} is not a plugin constructor", entry),
                )),
                None => Err(Error::load(bundle, format!("unknown entry: {}", entry))),
            },
            Backend::Native(library) => unsafe {
                let constructor: libloading::Symbol<'_, unsafe fn() -> *mut dyn Plugin> =
                    library.get(entry.as_bytes()).map_err(|err| {
                        Error::load(bundle, format!("missing entry symbol {}: {}", entry, err))
                    })?;
                let raw = constructor();
                if raw.is_null() {
                    return Err(Error::load(
                        bundle,
                        format!("entry symbol {} returned null", entry),
                    ));
                }
                Ok(Arc::from(Box::from_raw(raw)))
            },
        }
    }

    /// Resolve a declared extension entry. Unresolvable entries yield
    /// `None`; the caller skips them.
    fn resolve_extension(&self, entry: &str) -> Option<ExtensionDecl> {
        match &self.backend {
            Backend::Shared(table) => match table.get(entry) {
                Some(EntryDef::Extension {
                    point,
                    ordinal,
                    description,
                    enabled,
                    construct,
                }) => Some(ExtensionDecl {
                    entry: entry.to_string(),
                    point: point.to_string(),
                    ordinal,
                    description: description.to_string(),
                    enabled,
                    construct,
                }),
                _ => None,
            },
            Backend::Native(library) => unsafe {
                let descriptor: libloading::Symbol<'_, unsafe fn() -> NativeExtension> =
                    library.get(entry.as_bytes()).ok()?;
                let native = descriptor();
                let construct = native.construct;
                Some(ExtensionDecl {
                    entry: entry.to_string(),
                    point: native.point.to_string(),
                    ordinal: native.ordinal,
                    description: native.description.to_string(),
                    enabled: native.enabled,
                    construct: Arc::new(construct),
                })
            },
        }
    }

    /// Resolve the extension point description a declared point entry
    /// carries, if any.
    fn point_description(&self, entry: &str) -> &'static str {
        if let Backend::Shared(table) = &self.backend {
            if let Some(EntryDef::ExtensionPoint { description }) = table.get(entry) {
                return description;
            }
        }
        ""
    }
}

impl std::fmt::Debug for PluginNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginNamespace")
            .field("plugin", &self.plugin)
            .field("staged", &self.staged)
            .field("native", &self.is_native())
            .finish()
    }
}

/// Staged-file statistics, as returned by [`PluginLoader::temp_stats`].
#[derive(Debug, Clone)]
pub struct TempStats {
    /// Number of staged bundle copies.
    pub file_count: usize,
    /// Total size of staged copies in bytes.
    pub total_bytes: u64,
    /// The staging directory.
    pub dir: PathBuf,
}

/// Configuration for [`PluginLoader`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Staging directory; a per-process directory under the system temp
    /// dir when unset.
    pub staging_dir: Option<PathBuf>,
    /// Extensions treated as native bundles.
    pub native_extensions: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            staging_dir: None,
            native_extensions: vec!["so".to_string(), "dylib".to_string(), "dll".to_string()],
        }
    }
}

impl LoaderConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the staging directory.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Set the extensions treated as native bundles.
    pub fn with_native_extensions(mut self, extensions: Vec<String>) -> Self {
        self.native_extensions = extensions;
        self
    }
}

struct StagedEntry {
    staged: PathBuf,
    namespace: Arc<PluginNamespace>,
    created: Instant,
}

/// Loads bundles into isolated namespaces via staged copies.
pub struct PluginLoader {
    entries: Arc<EntryTable>,
    staging_dir: PathBuf,
    native_extensions: Vec<String>,
    staged: DashMap<String, StagedEntry>,
    stage_counter: AtomicU64,
}

impl PluginLoader {
    /// Create a loader resolving manifest bundles against `entries`.
    pub fn new(config: LoaderConfig, entries: Arc<EntryTable>) -> Result<Self> {
        let staging_dir = config.staging_dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("bundle-host-stage-{}", std::process::id()))
        });
        fs::create_dir_all(&staging_dir)?;
        tracing::info!("bundle staging directory: {}", staging_dir.display());

        Ok(Self {
            entries,
            staging_dir,
            native_extensions: config.native_extensions,
            staged: DashMap::new(),
            stage_counter: AtomicU64::new(0),
        })
    }

    /// The host entry table.
    pub fn entries(&self) -> &Arc<EntryTable> {
        &self.entries
    }

    /// Whether `bundle` is a native (dynamic library) bundle.
    pub fn is_native_bundle(&self, bundle: &Path) -> bool {
        bundle
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.native_extensions.iter().any(|n| n == ext))
            .unwrap_or(false)
    }

    /// Read a bundle's metadata without keeping any code loaded.
    ///
    /// Manifest bundles are parsed directly. Native bundles are opened in
    /// a throwaway namespace just long enough to call their
    /// `bundle_manifest` symbol; the library is dropped before returning.
    pub fn load_metadata(&self, bundle: &Path) -> Result<PluginMetadata> {
        if self.is_native_bundle(bundle) {
            let text = read_native_manifest(bundle)?;
            PluginMetadata::from_manifest(&text, bundle)
        } else {
            let text = fs::read_to_string(bundle).map_err(|err| {
                Error::metadata(bundle.display().to_string(), format!("unreadable: {}", err))
            })?;
            PluginMetadata::from_manifest(&text, bundle)
        }
    }

    /// Load a plugin instance from `bundle`.
    ///
    /// Stages a copy of the bundle, constructs the isolated namespace on
    /// the staged copy, resolves and instantiates the `main` entry,
    /// registers declared extension points and extensions with
    /// `extensions`, and records the staging for later cleanup.
    pub fn load_plugin(
        &self,
        bundle: &Path,
        metadata: &PluginMetadata,
        extensions: &ExtensionManager,
    ) -> Result<Arc<dyn Plugin>> {
        let name = &metadata.name;
        let bundle_name = bundle.display().to_string();

        // Replace any staging left over from a previous load.
        self.cleanup(name);

        let staged = self.stage_bundle(bundle, name)?;

        let result = (|| {
            let namespace = if self.is_native_bundle(bundle) {
                let library = unsafe { Library::new(&staged) }.map_err(|err| {
                    Error::load(&bundle_name, format!("failed to open library: {}", err))
                })?;
                Arc::new(PluginNamespace::native(name, staged.clone(), library))
            } else {
                Arc::new(PluginNamespace::shared(
                    name,
                    staged.clone(),
                    self.entries.clone(),
                ))
            };

            let instance = namespace.resolve_plugin(&metadata.entry, &bundle_name)?;

            self.discover_extensions(metadata, &namespace, extensions);

            self.staged.insert(
                name.clone(),
                StagedEntry {
                    staged: staged.clone(),
                    namespace,
                    created: Instant::now(),
                },
            );

            tracing::info!(
                "loaded plugin {} from staged copy {}",
                name,
                staged.display()
            );
            Ok(instance)
        })();

        if result.is_err() {
            remove_file_logged(&staged);
        }
        result
    }

    fn stage_bundle(&self, bundle: &Path, name: &str) -> Result<PathBuf> {
        let counter = self.stage_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let extension = bundle
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("plugin");
        let staged = self
            .staging_dir
            .join(format!("{}_{}.{}", name, counter, extension));
        fs::copy(bundle, &staged)?;
        tracing::debug!("staged bundle copy: {}", staged.display());
        Ok(staged)
    }

    /// Resolve the bundle's declared extension points and extensions and
    /// hand them to the extension manager. Unresolvable entries are
    /// skipped.
    fn discover_extensions(
        &self,
        metadata: &PluginMetadata,
        namespace: &Arc<PluginNamespace>,
        extensions: &ExtensionManager,
    ) {
        for point in &metadata.extension_points {
            let description = namespace.point_description(point);
            if let Err(err) = extensions.register_point(point, description) {
                tracing::warn!("skipping extension point {}: {}", point, err);
            }
        }

        let mut candidates = Vec::new();
        for entry in &metadata.extensions {
            match namespace.resolve_extension(entry) {
                Some(decl) => candidates.push(decl),
                None => tracing::debug!("skipping unresolvable extension entry {}", entry),
            }
        }
        if !candidates.is_empty() {
            extensions.register_extensions(&metadata.name, namespace.clone(), candidates);
        }
    }

    /// Tear down a plugin's staging: drop the namespace handle and delete
    /// the staged copy. Safe to call for unknown names.
    pub fn cleanup(&self, name: &str) {
        if let Some((_, entry)) = self.staged.remove(name) {
            drop(entry.namespace);
            remove_file_logged(&entry.staged);
            tracing::debug!("cleaned up staging for plugin {}", name);
        }
    }

    /// Tear down every plugin and remove the staging directory.
    pub fn cleanup_all(&self) {
        let names: Vec<String> = self.staged.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.cleanup(&name);
        }
        if let Err(err) = fs::remove_dir_all(&self.staging_dir) {
            tracing::warn!(
                "failed to remove staging directory {}: {}",
                self.staging_dir.display(),
                err
            );
        }
    }

    /// Tear down stagings older than `age`. Returns how many were removed.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let stale: Vec<String> = self
            .staged
            .iter()
            .filter(|entry| entry.value().created.elapsed() > age)
            .map(|entry| entry.key().clone())
            .collect();
        let count = stale.len();
        for name in stale {
            tracing::info!("cleaning up stale staging for plugin {}", name);
            self.cleanup(&name);
        }
        count
    }

    /// Statistics about the staged copies currently on disk.
    pub fn temp_stats(&self) -> TempStats {
        let mut total_bytes = 0;
        for entry in self.staged.iter() {
            if let Ok(meta) = fs::metadata(&entry.value().staged) {
                total_bytes += meta.len();
            }
        }
        TempStats {
            file_count: self.staged.len(),
            total_bytes,
            dir: self.staging_dir.clone(),
        }
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("staging_dir", &self.staging_dir)
            .field("staged", &self.staged.len())
            .finish()
    }
}

/// Open `bundle` in a throwaway namespace and copy its manifest text out.
fn read_native_manifest(bundle: &Path) -> Result<String> {
    let bundle_name = bundle.display().to_string();
    let library = unsafe { Library::new(bundle) }.map_err(|err| {
        Error::metadata(&bundle_name, format!("failed to open library: {}", err))
    })?;
    let text = unsafe {
        let manifest: libloading::Symbol<'_, unsafe extern "C" fn() -> *const c_char> =
            library.get(b"bundle_manifest").map_err(|err| {
                Error::metadata(&bundle_name, format!("no bundle_manifest symbol: {}", err))
            })?;
        let raw = manifest();
        if raw.is_null() {
            return Err(Error::metadata(&bundle_name, "bundle_manifest returned null"));
        }
        CStr::from_ptr(raw).to_string_lossy().into_owned()
    };
    drop(library);
    Ok(text)
}

fn remove_file_logged(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to delete staged file {}: {}", path.display(), err);
        }
    }
}
