//! Atomic on-disk bundle upgrades: scan, classify, apply with backups,
//! rollback, and backup retention.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

use crate::loader::PluginLoader;
use crate::manifest::Version;

/// How a pending bundle relates to what is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// No bundle with this plugin name exists yet.
    Install,
    /// The pending bundle is newer than the installed one.
    Update,
    /// The pending bundle is not newer; applied only when version
    /// checking is disabled.
    Downgrade,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Downgrade => "downgrade",
        };
        write!(f, "{}", name)
    }
}

/// One applicable pending bundle.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    /// Plugin name from the pending bundle's metadata.
    pub name: String,
    /// Version currently installed, when readable.
    pub current_version: Option<String>,
    /// Version of the pending bundle.
    pub new_version: String,
    /// The pending bundle file in the update directory.
    pub file: PathBuf,
    /// Classification.
    pub kind: UpdateKind,
}

/// Result of scanning the update directory.
#[derive(Debug, Clone, Default)]
pub struct UpdateScan {
    /// Applicable candidates, in scan order.
    pub candidates: Vec<UpdateCandidate>,
    /// File names whose metadata could not be read.
    pub invalid_files: Vec<String>,
}

impl UpdateScan {
    /// An empty scan result.
    pub fn no_updates() -> Self {
        Self::default()
    }

    /// Whether any candidate was found.
    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }
}

/// Stage at which an update failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    /// Creating the pre-update backup.
    Backup,
    /// Copying the pending bundle over the target.
    Apply,
    /// Restoring the target from its backup after a failed copy.
    Restore,
}

impl std::fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Backup => "backup",
            Self::Apply => "apply",
            Self::Restore => "restore",
        };
        write!(f, "{}", name)
    }
}

/// A failed update, surfaced inside [`UpdateOutcome`] rather than thrown;
/// the batch continues past it.
#[derive(Debug, Clone)]
pub struct UpdateFailure {
    /// Plugin whose update failed.
    pub name: String,
    /// Stage that failed.
    pub stage: UpdateStage,
    /// What went wrong.
    pub reason: String,
}

/// Aggregate result of applying a batch of updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    /// Plugins updated successfully.
    pub updated: Vec<String>,
    /// Per-plugin failures.
    pub failed: Vec<UpdateFailure>,
}

impl UpdateOutcome {
    /// An outcome with nothing applied.
    pub fn no_updates() -> Self {
        Self::default()
    }

    /// Whether anything was applied.
    pub fn has_updates(&self) -> bool {
        !self.updated.is_empty()
    }

    /// Whether anything failed.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// A backup file on disk, recoverable by listing the backup directory.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    /// Plugin the backup belongs to.
    pub plugin: String,
    /// Timestamp component of the file name (`YYYYMMDD-HHMMSS`).
    pub timestamp: String,
    /// The backup file.
    pub file: PathBuf,
}

/// Update and backup directory statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateStats {
    /// Pending bundles in the update directory.
    pub pending_updates: usize,
    /// Backup files in the backup directory.
    pub backups: usize,
    /// Total bytes under the update directory.
    pub update_dir_bytes: u64,
    /// Total bytes under the backup directory.
    pub backup_dir_bytes: u64,
}

/// Behavior flags for [`UpdateManager`].
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// When set, pending bundles that are not strictly newer are skipped
    /// at scan time.
    pub check_version_constraints: bool,
    /// Copy the existing bundle aside before overwriting it.
    pub create_backups: bool,
    /// Delete the backups of successfully applied updates afterwards.
    pub auto_cleanup_backups: bool,
    /// Delete successfully applied update files afterwards.
    pub cleanup_update_files: bool,
    /// Backups older than this are eligible for the retention sweep;
    /// zero disables the sweep.
    pub max_backup_age: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_version_constraints: true,
            create_backups: true,
            auto_cleanup_backups: false,
            cleanup_update_files: true,
            max_backup_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl UpdateConfig {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// A configuration that applies bundles regardless of version.
    pub fn forced() -> Self {
        Self {
            check_version_constraints: false,
            ..Self::default()
        }
    }

    /// A configuration that never creates backups.
    pub fn no_backups() -> Self {
        Self {
            create_backups: false,
            max_backup_age: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Applies pending bundle upgrades from an update directory onto the
/// plugin directory, with timestamped backups alongside in
/// `plugin-backups/`.
pub struct UpdateManager {
    plugin_dir: PathBuf,
    update_dir: PathBuf,
    backup_dir: PathBuf,
    extensions: Vec<String>,
    loader: Arc<PluginLoader>,
    config: RwLock<UpdateConfig>,
}

impl UpdateManager {
    /// Create a manager over `plugin_dir` and `update_dir`.
    ///
    /// The backup directory is `plugin-backups`, a peer of the plugin
    /// directory. All three directories are created if absent.
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        update_dir: impl Into<PathBuf>,
        extensions: Vec<String>,
        loader: Arc<PluginLoader>,
        config: UpdateConfig,
    ) -> crate::error::Result<Self> {
        let plugin_dir = plugin_dir.into();
        let update_dir = update_dir.into();
        let backup_dir = plugin_dir
            .parent()
            .map(|parent| parent.join("plugin-backups"))
            .unwrap_or_else(|| PathBuf::from("plugin-backups"));

        fs::create_dir_all(&plugin_dir)?;
        fs::create_dir_all(&update_dir)?;
        fs::create_dir_all(&backup_dir)?;

        tracing::info!("update manager initialized, config: {:?}", config);
        Ok(Self {
            plugin_dir,
            update_dir,
            backup_dir,
            extensions,
            loader,
            config: RwLock::new(config),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> UpdateConfig {
        self.config.read().clone()
    }

    /// Replace the configuration.
    pub fn set_config(&self, config: UpdateConfig) {
        *self.config.write() = config;
    }

    /// The backup directory.
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Enumerate pending bundles and classify each against the installed
    /// set, without touching the filesystem.
    pub fn scan(&self) -> UpdateScan {
        tracing::info!("scanning for plugin updates");

        let files = self.bundle_files(&self.update_dir);
        if files.is_empty() {
            tracing::debug!("no update files found");
            return UpdateScan::no_updates();
        }

        let config = self.config();
        let mut scan = UpdateScan::default();

        for file in files {
            match self.classify(&file, &config) {
                Ok(Some(candidate)) => scan.candidates.push(candidate),
                Ok(None) => {}
                Err(reason) => {
                    tracing::warn!("invalid update file {}: {}", file.display(), reason);
                    scan.invalid_files
                        .push(file_name_string(&file));
                }
            }
        }

        tracing::info!(
            "scan completed: {} updates available, {} invalid files",
            scan.candidates.len(),
            scan.invalid_files.len()
        );
        scan
    }

    fn classify(
        &self,
        file: &Path,
        config: &UpdateConfig,
    ) -> std::result::Result<Option<UpdateCandidate>, String> {
        let metadata = self
            .loader
            .load_metadata(file)
            .map_err(|err| err.to_string())?;
        let name = metadata.name;
        let new_version = metadata.version;

        let Some(existing) = self.find_existing(&name) else {
            return Ok(Some(UpdateCandidate {
                name,
                current_version: None,
                new_version,
                file: file.to_path_buf(),
                kind: UpdateKind::Install,
            }));
        };

        let current_version = self
            .loader
            .load_metadata(&existing)
            .map(|meta| meta.version)
            .ok();

        let kind = match &current_version {
            None => UpdateKind::Update,
            Some(current) => match Version::compare(&new_version, current) {
                Some(std::cmp::Ordering::Greater) => UpdateKind::Update,
                Some(_) => {
                    if config.check_version_constraints {
                        tracing::info!(
                            "skipping {}: version {} is not newer than {}",
                            name,
                            new_version,
                            current
                        );
                        return Ok(None);
                    }
                    UpdateKind::Downgrade
                }
                // Non-numeric versions: fail open when checking is off,
                // skip when it is on.
                None => {
                    if config.check_version_constraints {
                        tracing::info!(
                            "skipping {}: cannot compare versions {} and {}",
                            name,
                            new_version,
                            current
                        );
                        return Ok(None);
                    }
                    UpdateKind::Update
                }
            },
        };

        Ok(Some(UpdateCandidate {
            name,
            current_version,
            new_version,
            file: file.to_path_buf(),
            kind,
        }))
    }

    /// Apply `candidates` in list order.
    ///
    /// Each failure is recorded and the batch continues. After the batch,
    /// successfully applied update files and (when configured) their
    /// backups are cleaned up.
    pub fn apply(&self, candidates: &[UpdateCandidate]) -> UpdateOutcome {
        if candidates.is_empty() {
            return UpdateOutcome::no_updates();
        }

        let config = self.config();
        tracing::info!("applying {} plugin updates", candidates.len());

        let mut outcome = UpdateOutcome::default();
        let mut backups: Vec<(String, PathBuf)> = Vec::new();

        for candidate in candidates {
            match self.apply_one(candidate, &config, &mut backups) {
                Ok(()) => {
                    tracing::info!(
                        "successfully updated {} to v{}",
                        candidate.name,
                        candidate.new_version
                    );
                    outcome.updated.push(candidate.name.clone());
                }
                Err(failure) => {
                    tracing::warn!(
                        "failed to update {} at {} stage: {}",
                        failure.name,
                        failure.stage,
                        failure.reason
                    );
                    outcome.failed.push(failure);
                }
            }
        }

        if config.cleanup_update_files {
            for candidate in candidates {
                if outcome.updated.contains(&candidate.name) {
                    if let Err(err) = fs::remove_file(&candidate.file) {
                        tracing::warn!(
                            "failed to clean up update file {}: {}",
                            candidate.file.display(),
                            err
                        );
                    }
                }
            }
        }

        if config.auto_cleanup_backups {
            for (name, backup) in &backups {
                if outcome.updated.contains(name) {
                    if let Err(err) = fs::remove_file(backup) {
                        tracing::warn!(
                            "failed to clean up backup {}: {}",
                            backup.display(),
                            err
                        );
                    }
                }
            }
        }

        tracing::info!(
            "update completed: {} successful, {} failed",
            outcome.updated.len(),
            outcome.failed.len()
        );
        outcome
    }

    fn apply_one(
        &self,
        candidate: &UpdateCandidate,
        config: &UpdateConfig,
        backups: &mut Vec<(String, PathBuf)>,
    ) -> std::result::Result<(), UpdateFailure> {
        let target = if candidate.kind == UpdateKind::Install {
            self.plugin_dir.join(
                candidate
                    .file
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_default(),
            )
        } else {
            self.find_existing(&candidate.name)
                .ok_or_else(|| UpdateFailure {
                    name: candidate.name.clone(),
                    stage: UpdateStage::Apply,
                    reason: "target bundle not found".to_string(),
                })?
        };

        let mut backup = None;
        if candidate.kind != UpdateKind::Install && config.create_backups {
            match self.create_backup(&target, &candidate.name) {
                Ok(path) => {
                    backups.push((candidate.name.clone(), path.clone()));
                    backup = Some(path);
                }
                Err(err) => {
                    tracing::warn!("failed to create backup for {}: {}", candidate.name, err);
                }
            }
        }

        if let Err(err) = copy_preserving(&candidate.file, &target) {
            if let Some(backup) = &backup {
                if let Err(restore_err) = copy_preserving(backup, &target) {
                    return Err(UpdateFailure {
                        name: candidate.name.clone(),
                        stage: UpdateStage::Restore,
                        reason: format!(
                            "copy failed ({}) and restore failed ({})",
                            err, restore_err
                        ),
                    });
                }
                tracing::info!("restored {} from backup after failed copy", candidate.name);
            }
            return Err(UpdateFailure {
                name: candidate.name.clone(),
                stage: UpdateStage::Apply,
                reason: err.to_string(),
            });
        }

        Ok(())
    }

    /// Scan and apply everything applicable in one step.
    pub fn check_and_apply(&self) -> UpdateOutcome {
        let scan = self.scan();
        self.apply(&scan.candidates)
    }

    /// Restore `plugin` from its most recent backup (by file modification
    /// time). Returns whether a restore happened.
    pub fn rollback(&self, plugin: &str) -> bool {
        let prefix = format!("{}-", plugin);
        let mut newest: Option<(SystemTime, PathBuf)> = None;

        for record in self.list_backups() {
            if !file_name_string(&record.file).starts_with(&prefix) || record.plugin != plugin {
                continue;
            }
            let mtime = fs::metadata(&record.file)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                newest = Some((mtime, record.file));
            }
        }

        let Some((_, backup)) = newest else {
            tracing::warn!("no backup found for plugin {}", plugin);
            return false;
        };
        let Some(target) = self.find_existing(plugin) else {
            tracing::warn!("no installed bundle found for plugin {}", plugin);
            return false;
        };

        match copy_preserving(&backup, &target) {
            Ok(()) => {
                tracing::info!("rolled back plugin {} from {}", plugin, backup.display());
                true
            }
            Err(err) => {
                tracing::warn!("failed to roll back plugin {}: {}", plugin, err);
                false
            }
        }
    }

    /// All backups on disk, most recent first.
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        let mut records: Vec<BackupRecord> = list_dir(&self.backup_dir)
            .into_iter()
            .filter_map(|file| parse_backup_name(&file))
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    /// Delete backups older than the configured retention age. Returns
    /// how many were deleted; zero when retention is disabled.
    pub fn cleanup_old_backups(&self) -> usize {
        let max_age = self.config().max_backup_age;
        if max_age.is_zero() {
            return 0;
        }
        let cutoff = SystemTime::now() - max_age;

        let mut cleaned = 0;
        for record in self.list_backups() {
            let mtime = fs::metadata(&record.file)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if mtime < cutoff && fs::remove_file(&record.file).is_ok() {
                tracing::info!("cleaned up old backup {}", record.file.display());
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Update and backup directory statistics.
    pub fn stats(&self) -> UpdateStats {
        UpdateStats {
            pending_updates: self.bundle_files(&self.update_dir).len(),
            backups: self.list_backups().len(),
            update_dir_bytes: dir_size(&self.update_dir),
            backup_dir_bytes: dir_size(&self.backup_dir),
        }
    }

    fn create_backup(&self, target: &Path, plugin: &str) -> std::io::Result<PathBuf> {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let extension = target
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("plugin");
        let backup = self
            .backup_dir
            .join(format!("{}-{}-backup.{}", plugin, timestamp, extension));
        copy_preserving(target, &backup)?;
        tracing::info!("created backup {}", backup.display());
        Ok(backup)
    }

    /// Find the installed bundle carrying `plugin`'s name, by reading
    /// metadata from each bundle in the plugin directory.
    fn find_existing(&self, plugin: &str) -> Option<PathBuf> {
        self.bundle_files(&self.plugin_dir).into_iter().find(|file| {
            self.loader
                .load_metadata(file)
                .map(|meta| meta.name == plugin)
                .unwrap_or(false)
        })
    }

    fn bundle_files(&self, dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = list_dir(dir)
            .into_iter()
            .filter(|file| {
                file.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| self.extensions.iter().any(|e| e == ext))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }
}

impl std::fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("plugin_dir", &self.plugin_dir)
            .field("update_dir", &self.update_dir)
            .field("backup_dir", &self.backup_dir)
            .finish()
    }
}

fn list_dir(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse `<name>-<YYYYMMDD-HHMMSS>-backup.<ext>`; the name itself may
/// contain dashes.
fn parse_backup_name(file: &Path) -> Option<BackupRecord> {
    let stem = file.file_stem()?.to_str()?;
    let without_suffix = stem.strip_suffix("-backup")?;
    // Timestamp is the last two dash-separated segments.
    let mut parts: Vec<&str> = without_suffix.rsplitn(3, '-').collect();
    if parts.len() < 3 {
        return None;
    }
    parts.reverse();
    let plugin = parts[0].to_string();
    let timestamp = format!("{}-{}", parts[1], parts[2]);
    Some(BackupRecord {
        plugin,
        timestamp,
        file: file.to_path_buf(),
    })
}

fn copy_preserving(from: &Path, to: &Path) -> std::io::Result<()> {
    // fs::copy replaces the destination and carries permissions over.
    fs::copy(from, to).map(|_| ())
}

fn dir_size(dir: &Path) -> u64 {
    list_dir(dir)
        .iter()
        .filter_map(|file| fs::metadata(file).ok())
        .map(|meta| meta.len())
        .sum()
}

fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{EntryTable, LoaderConfig};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(config: UpdateConfig) -> (TempDir, UpdateManager) {
        let root = TempDir::new().unwrap();
        let loader = Arc::new(
            PluginLoader::new(
                LoaderConfig::new().with_staging_dir(root.path().join("stage")),
                Arc::new(EntryTable::new()),
            )
            .unwrap(),
        );
        let manager = UpdateManager::new(
            root.path().join("plugins"),
            root.path().join("updates"),
            vec!["plugin".to_string()],
            loader,
            config,
        )
        .unwrap();
        (root, manager)
    }

    fn write_bundle(dir: &Path, file: &str, name: &str, version: &str) -> PathBuf {
        let path = dir.join(file);
        fs::write(
            &path,
            format!("name={}\nversion={}\nmain=test:{}\n", name, version, name),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_scan_empty_updates() {
        let (_root, manager) = setup(UpdateConfig::default());
        let scan = manager.scan();
        assert!(!scan.has_candidates());
        assert!(scan.invalid_files.is_empty());

        let outcome = manager.check_and_apply();
        assert!(!outcome.has_updates());
        assert!(!outcome.has_failures());
    }

    #[test]
    fn test_scan_classifies_install_and_update() {
        let (root, manager) = setup(UpdateConfig::default());
        write_bundle(&root.path().join("plugins"), "old.plugin", "alpha", "1.0.0");
        write_bundle(&root.path().join("updates"), "alpha.plugin", "alpha", "1.1.0");
        write_bundle(&root.path().join("updates"), "beta.plugin", "beta", "0.1.0");

        let scan = manager.scan();
        assert_eq!(scan.candidates.len(), 2);

        let alpha = scan.candidates.iter().find(|c| c.name == "alpha").unwrap();
        assert_eq!(alpha.kind, UpdateKind::Update);
        assert_eq!(alpha.current_version.as_deref(), Some("1.0.0"));

        let beta = scan.candidates.iter().find(|c| c.name == "beta").unwrap();
        assert_eq!(beta.kind, UpdateKind::Install);
        assert!(beta.current_version.is_none());
    }

    #[test]
    fn test_version_skip_with_check_enabled() {
        let (root, manager) = setup(UpdateConfig::default());
        write_bundle(&root.path().join("plugins"), "x.plugin", "x", "1.2.0");
        write_bundle(&root.path().join("updates"), "x-old.plugin", "x", "1.1.9");

        let scan = manager.scan();
        assert!(!scan.has_candidates());
        assert!(scan.invalid_files.is_empty());

        // Nothing applied, no backup created.
        let outcome = manager.apply(&scan.candidates);
        assert!(!outcome.has_updates());
        assert!(manager.list_backups().is_empty());
    }

    #[test]
    fn test_downgrade_with_check_disabled() {
        let (root, manager) = setup(UpdateConfig::forced());
        write_bundle(&root.path().join("plugins"), "x.plugin", "x", "1.2.0");
        write_bundle(&root.path().join("updates"), "x-old.plugin", "x", "1.1.9");

        let scan = manager.scan();
        assert_eq!(scan.candidates.len(), 1);
        assert_eq!(scan.candidates[0].kind, UpdateKind::Downgrade);

        let outcome = manager.apply(&scan.candidates);
        assert_eq!(outcome.updated, vec!["x"]);

        let meta = manager
            .loader
            .load_metadata(&root.path().join("plugins").join("x.plugin"))
            .unwrap();
        assert_eq!(meta.version, "1.1.9");
    }

    #[test]
    fn test_invalid_files_reported() {
        let (root, manager) = setup(UpdateConfig::default());
        fs::write(root.path().join("updates").join("junk.plugin"), "???").unwrap();

        let scan = manager.scan();
        assert!(!scan.has_candidates());
        assert_eq!(scan.invalid_files, vec!["junk.plugin"]);
    }

    #[test]
    fn test_apply_creates_backup_and_cleans_update_file() {
        let (root, manager) = setup(UpdateConfig::default());
        write_bundle(&root.path().join("plugins"), "x.plugin", "x", "1.0.0");
        let update = write_bundle(&root.path().join("updates"), "x.plugin", "x", "1.1.0");

        let outcome = manager.check_and_apply();
        assert_eq!(outcome.updated, vec!["x"]);
        assert!(!outcome.has_failures());

        // Backup exists with the expected naming convention.
        let backups = manager.list_backups();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].plugin, "x");
        assert!(file_name_string(&backups[0].file).ends_with("-backup.plugin"));

        // Update file consumed; target replaced.
        assert!(!update.exists());
        let meta = manager
            .loader
            .load_metadata(&root.path().join("plugins").join("x.plugin"))
            .unwrap();
        assert_eq!(meta.version, "1.1.0");
    }

    #[test]
    fn test_apply_failure_is_recorded_and_batch_continues() {
        let (root, manager) = setup(UpdateConfig::default());
        write_bundle(&root.path().join("plugins"), "x.plugin", "x", "1.0.0");
        write_bundle(&root.path().join("updates"), "x.plugin", "x", "1.1.0");
        write_bundle(&root.path().join("updates"), "y.plugin", "y", "1.0.0");

        let scan = manager.scan();
        // Remove x's target between scan and apply to simulate failure.
        fs::remove_file(root.path().join("plugins").join("x.plugin")).unwrap();

        let outcome = manager.apply(&scan.candidates);
        assert_eq!(outcome.updated, vec!["y"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].name, "x");
        assert_eq!(outcome.failed[0].stage, UpdateStage::Apply);
    }

    #[test]
    fn test_rollback_restores_most_recent_backup() {
        let (root, manager) = setup(UpdateConfig::default());
        let target = write_bundle(&root.path().join("plugins"), "x.plugin", "x", "1.0.0");
        let original = fs::read(&target).unwrap();

        write_bundle(&root.path().join("updates"), "x.plugin", "x", "1.1.0");
        manager.check_and_apply();
        assert_ne!(fs::read(&target).unwrap(), original);

        assert!(manager.rollback("x"));
        assert_eq!(fs::read(&target).unwrap(), original);

        assert!(!manager.rollback("ghost"));
    }

    #[test]
    fn test_backup_name_roundtrip_with_dashes() {
        let record =
            parse_backup_name(Path::new("my-cool-plugin-20260801-120000-backup.plugin")).unwrap();
        assert_eq!(record.plugin, "my-cool-plugin");
        assert_eq!(record.timestamp, "20260801-120000");

        assert!(parse_backup_name(Path::new("not-a-backup.plugin")).is_none());
    }

    #[test]
    fn test_cleanup_old_backups_disabled_when_zero() {
        let (root, manager) = setup(UpdateConfig::no_backups());
        let _ = root;
        assert_eq!(manager.cleanup_old_backups(), 0);
    }

    #[test]
    fn test_stats() {
        let (root, manager) = setup(UpdateConfig::default());
        write_bundle(&root.path().join("updates"), "a.plugin", "a", "1.0.0");

        let stats = manager.stats();
        assert_eq!(stats.pending_updates, 1);
        assert_eq!(stats.backups, 0);
        assert!(stats.update_dir_bytes > 0);
    }
}
