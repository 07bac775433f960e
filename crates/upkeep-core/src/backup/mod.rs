//! Point-in-time snapshots of the application and its datastore.
//!
//! Each backup is one directory under the backup dir, named by its id:
//!
//! ```text
//! backup-20260301-101500-042/
//!   files.tar.gz        app tree minus caches, build output, VCS metadata
//!   database.sqlite     raw copy (online backup API)
//!   database.sql        logical export
//!   restore-plan.json   typed restore procedure
//!   restore.sh          the same procedure for operators
//!   manifest.json       metadata + per-file sha256 + integrity digest
//! ```
//!
//! Backups are assembled in a `.staging-<id>` sibling and renamed into place,
//! so a listed backup is always complete.

pub mod archive;
pub mod datastore;
pub mod restore;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::error::{Result, UpkeepError};
use crate::maintenance::MaintenanceController;
use crate::paths;
use crate::prereq::SystemSnapshot;
use crate::service::ServiceController;

use archive::Exclusions;
pub use restore::{RestoreContext, RestorePlan, RestoreReport};

pub const MANIFEST_VERSION: u32 = 1;
const STAGING_PREFIX: &str = ".staging-";

/// Manifest of one backup. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub version: u32,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_revision: Option<String>,
    /// Directory holding the artifacts; recomputed on load.
    #[serde(default)]
    pub location: PathBuf,
    pub size_bytes: u64,
    pub includes_database: bool,
    pub includes_logs: bool,
    #[serde(default)]
    pub system: SystemSnapshot,
    /// Artifact file name to hex sha256.
    pub files: BTreeMap<String, String>,
    pub integrity_digest: String,
    #[serde(default)]
    pub restore_procedure_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub include_database: bool,
    /// Overrides `backup.include_logs` when set.
    pub include_logs: Option<bool>,
    pub source_revision: Option<String>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            include_database: true,
            include_logs: None,
            source_revision: None,
        }
    }
}

pub struct BackupManager {
    root: PathBuf,
    app_dir: PathBuf,
    dir: PathBuf,
    config: Config,
}

impl BackupManager {
    pub fn new(root: &Path, config: &Config) -> Self {
        Self {
            root: root.to_path_buf(),
            app_dir: config.app_dir(root),
            dir: config.backup_dir(root),
            config: config.clone(),
        }
    }

    fn exclusions(&self, include_logs: bool) -> Exclusions {
        let mut ex = Exclusions::default();
        ex.names.extend(self.config.backup.exclude.iter().cloned());
        ex.names.insert(".git".to_string());

        let mut anchored = vec![paths::upkeep_dir(&self.root), self.dir.clone()];
        if !include_logs {
            anchored.push(paths::resolve(&self.app_dir, &self.config.backup.logs_dir));
        }
        if let Some(db) = self.config.datastore_path(&self.root) {
            for suffix in ["", "-wal", "-shm", "-journal"] {
                let mut p = db.as_os_str().to_owned();
                p.push(suffix);
                anchored.push(PathBuf::from(p));
            }
        }
        for path in anchored {
            if let Ok(rel) = path.strip_prefix(&self.app_dir) {
                ex.paths.insert(rel.to_path_buf());
            }
        }
        ex
    }

    fn location(&self, id: &str) -> Result<PathBuf> {
        paths::validate_backup_id(id)?;
        Ok(self.dir.join(id))
    }

    fn next_id(&self) -> String {
        loop {
            let id = Utc::now().format("backup-%Y%m%d-%H%M%S-%3f").to_string();
            let staging = self.dir.join(format!("{STAGING_PREFIX}{id}"));
            if !self.dir.join(&id).exists() && !staging.exists() {
                return id;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Snapshot the app tree and datastore, then prune to the retention limit.
    pub fn create(
        &self,
        options: &BackupOptions,
        service: &dyn ServiceController,
    ) -> Result<Backup> {
        crate::io::ensure_dir(&self.dir)?;
        let id = self.next_id();
        let staging = self.dir.join(format!("{STAGING_PREFIX}{id}"));
        fs::create_dir_all(&staging)?;

        let built = self.assemble(&id, &staging, options, service);
        let backup = match built {
            Ok(b) => b,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };

        fs::rename(&staging, &backup.location)?;
        tracing::info!(
            id = %backup.id,
            size_bytes = backup.size_bytes,
            database = backup.includes_database,
            "backup created"
        );

        let pruned = self.prune(self.config.backup.retention)?;
        if !pruned.is_empty() {
            tracing::info!(count = pruned.len(), "pruned old backups");
        }
        Ok(backup)
    }

    fn assemble(
        &self,
        id: &str,
        staging: &Path,
        options: &BackupOptions,
        service: &dyn ServiceController,
    ) -> Result<Backup> {
        let include_logs = options
            .include_logs
            .unwrap_or(self.config.backup.include_logs);
        let exclusions = self.exclusions(include_logs);

        let files = archive::create(&self.app_dir, &staging.join(paths::ARCHIVE_FILE), &exclusions)?;
        tracing::debug!(files, "archived app tree");

        let mut database = None;
        if options.include_database {
            match self.config.datastore_path(&self.root) {
                Some(db) if db.exists() => {
                    datastore::snapshot(&db, &staging.join(paths::RAW_DB_FILE))?;
                    datastore::export(&db, &staging.join(paths::EXPORT_DB_FILE))?;
                    database = Some(restore::DatabasePlan {
                        target: db,
                        raw: paths::RAW_DB_FILE.to_string(),
                        export: paths::EXPORT_DB_FILE.to_string(),
                    });
                }
                Some(db) => {
                    tracing::warn!(path = %db.display(), "datastore not found, backing up files only")
                }
                None => {}
            }
        }

        let plan = RestorePlan {
            version: restore::PLAN_VERSION,
            backup_id: id.to_string(),
            app_dir: self.app_dir.clone(),
            source_revision: options.source_revision.clone(),
            archive: paths::ARCHIVE_FILE.to_string(),
            exclusions,
            database,
            dependency_commands: self
                .config
                .layers
                .iter()
                .flat_map(|l| l.commands())
                .collect(),
        };
        crate::io::write_json(&staging.join(paths::RESTORE_PLAN_FILE), &plan)?;
        let script_path = staging.join(paths::RESTORE_SCRIPT_FILE);
        crate::io::atomic_write(&script_path, plan.render_script(service).as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
        }

        let mut digests = BTreeMap::new();
        let mut size_bytes = 0;
        for name in [
            paths::ARCHIVE_FILE,
            paths::RAW_DB_FILE,
            paths::EXPORT_DB_FILE,
            paths::RESTORE_PLAN_FILE,
            paths::RESTORE_SCRIPT_FILE,
        ] {
            let path = staging.join(name);
            if path.exists() {
                size_bytes += fs::metadata(&path)?.len();
                digests.insert(name.to_string(), sha256_file(&path)?);
            }
        }

        let backup = Backup {
            version: MANIFEST_VERSION,
            id: id.to_string(),
            created_at: Utc::now(),
            host: hostname(),
            source_revision: options.source_revision.clone(),
            location: self.dir.join(id),
            size_bytes,
            includes_database: plan.database.is_some(),
            includes_logs: include_logs,
            system: SystemSnapshot::capture(&self.app_dir),
            integrity_digest: integrity_digest(&digests),
            files: digests,
            restore_procedure_path: self.dir.join(id).join(paths::RESTORE_SCRIPT_FILE),
        };
        crate::io::write_json(&staging.join(paths::MANIFEST_FILE), &backup)?;
        Ok(backup)
    }

    /// All complete backups, newest first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<Backup>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if paths::validate_backup_id(&name).is_err() || !entry.path().is_dir() {
                continue;
            }
            match self.load(&name, &entry.path()) {
                Ok(b) => backups.push(b),
                Err(e) => tracing::warn!(id = %name, error = %e, "skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
        Ok(backups)
    }

    fn load(&self, id: &str, location: &Path) -> Result<Backup> {
        let mut backup: Backup = crate::io::read_json(&location.join(paths::MANIFEST_FILE))?
            .ok_or_else(|| UpkeepError::BackupNotFound(id.to_string()))?;
        backup.location = location.to_path_buf();
        backup.restore_procedure_path = location.join(paths::RESTORE_SCRIPT_FILE);
        Ok(backup)
    }

    pub fn get(&self, id: &str) -> Result<Backup> {
        let location = self.location(id)?;
        if !location.is_dir() {
            return Err(UpkeepError::BackupNotFound(id.to_string()));
        }
        self.load(id, &location)
    }

    /// Recompute every artifact digest and the integrity digest.
    pub fn verify(&self, id: &str) -> Result<Backup> {
        let backup = self.get(id)?;
        let corrupt = |reason: String| UpkeepError::BackupCorrupt {
            id: id.to_string(),
            reason,
        };

        for required in [paths::ARCHIVE_FILE, paths::RESTORE_PLAN_FILE] {
            if !backup.files.contains_key(required) {
                return Err(corrupt(format!("manifest lists no {required}")));
            }
        }
        for (name, expected) in &backup.files {
            let path = backup.location.join(name);
            if !path.exists() {
                return Err(corrupt(format!("{name} is missing")));
            }
            if &sha256_file(&path)? != expected {
                return Err(corrupt(format!("{name} digest mismatch")));
            }
        }
        if integrity_digest(&backup.files) != backup.integrity_digest {
            return Err(corrupt("integrity digest mismatch".to_string()));
        }
        Ok(backup)
    }

    /// Newest backup that passes [`verify`](Self::verify).
    pub fn latest_verified(&self) -> Result<Option<Backup>> {
        for backup in self.list()? {
            match self.verify(&backup.id) {
                Ok(b) => return Ok(Some(b)),
                Err(e) => tracing::warn!(id = %backup.id, error = %e, "backup failed verification"),
            }
        }
        Ok(None)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let location = self.location(id)?;
        if !location.is_dir() {
            return Err(UpkeepError::BackupNotFound(id.to_string()));
        }
        fs::remove_dir_all(&location)?;
        tracing::info!(id, "backup deleted");
        Ok(())
    }

    /// Delete the oldest backups beyond `retention`. Returns the deleted ids.
    pub fn prune(&self, retention: usize) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for backup in self.list()?.into_iter().skip(retention.max(1)) {
            fs::remove_dir_all(&backup.location)?;
            deleted.push(backup.id);
        }
        Ok(deleted)
    }

    /// Remove staging dirs left by an interrupted [`create`](Self::create).
    pub fn discard_partial(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Verify backup `id` and run its restore plan. With `maintenance` set,
    /// maintenance mode is enabled for the duration and stays enabled if the
    /// restore fails.
    pub fn restore(
        &self,
        id: &str,
        ctx: &RestoreContext<'_>,
        maintenance: bool,
    ) -> Result<RestoreReport> {
        let backup = self.verify(id)?;
        let plan: RestorePlan =
            crate::io::read_json(&backup.location.join(paths::RESTORE_PLAN_FILE))?.ok_or_else(
                || UpkeepError::BackupCorrupt {
                    id: id.to_string(),
                    reason: "restore plan missing".to_string(),
                },
            )?;
        if !backup.restore_procedure_path.exists() {
            return Err(UpkeepError::BackupCorrupt {
                id: id.to_string(),
                reason: "restore script missing".to_string(),
            });
        }

        let controller = MaintenanceController::new(&self.root);
        if maintenance {
            controller.enable(
                &format!("Restoring {id}"),
                self.config.maintenance.estimated_duration_secs,
            )?;
        }
        let report = plan.execute(&backup.location, ctx)?;
        if maintenance {
            controller.disable()?;
        }
        tracing::info!(id, "restore complete");
        Ok(report)
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 over the sorted `name:sha256` lines.
pub fn integrity_digest(files: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, digest) in files {
        hasher.update(format!("{name}:{digest}\n").as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceBackend;
    use crate::process::{CommandRunner, CommandSpec};
    use crate::service::{self, ServiceController};
    use rusqlite::Connection;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        config: Config,
        service: Box<dyn ServiceController>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path();
            fs::write(root.join("app.py"), "v1").unwrap();
            fs::create_dir_all(root.join("templates")).unwrap();
            fs::write(root.join("templates/index.html"), "<p>v1</p>").unwrap();
            fs::create_dir_all(root.join("node_modules/lib")).unwrap();
            fs::write(root.join("node_modules/lib/index.js"), "dep").unwrap();
            fs::create_dir_all(root.join("data")).unwrap();
            let conn = Connection::open(root.join("data/links.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE links (code TEXT PRIMARY KEY, target TEXT);
                 INSERT INTO links VALUES ('abc', 'https://example.com');",
            )
            .unwrap();

            let mut config = Config::default();
            config.datastore = Some(PathBuf::from("data/links.db"));
            config.backup.retention = 2;
            config.service = ServiceBackend::Process {
                command: CommandSpec::new("sleep", ["30"]),
                pid_file: PathBuf::from(".upkeep/service.pid"),
                log_file: None,
            };
            let service = service::controller(
                &config.service,
                CommandRunner::new(root, root),
                root,
            );
            Self {
                dir,
                config,
                service,
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn manager(&self) -> BackupManager {
            BackupManager::new(self.root(), &self.config)
        }
    }

    #[test]
    fn create_writes_all_artifacts() {
        let fx = Fixture::new();
        let backup = fx
            .manager()
            .create(&BackupOptions::default(), fx.service.as_ref())
            .unwrap();

        assert!(paths::validate_backup_id(&backup.id).is_ok());
        assert!(backup.includes_database);
        for name in [
            paths::ARCHIVE_FILE,
            paths::RAW_DB_FILE,
            paths::EXPORT_DB_FILE,
            paths::MANIFEST_FILE,
            paths::RESTORE_PLAN_FILE,
            paths::RESTORE_SCRIPT_FILE,
        ] {
            assert!(backup.location.join(name).exists(), "{name} missing");
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&backup.restore_procedure_path)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        fx.manager().verify(&backup.id).unwrap();
    }

    #[test]
    fn retention_keeps_newest() {
        let fx = Fixture::new();
        let mgr = fx.manager();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                mgr.create(&BackupOptions::default(), fx.service.as_ref())
                    .unwrap()
                    .id,
            );
        }
        let listed: Vec<String> = mgr.list().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(listed, vec![ids[2].clone(), ids[1].clone()]);
    }

    #[test]
    fn tampering_fails_verification() {
        let fx = Fixture::new();
        let mgr = fx.manager();
        let backup = mgr
            .create(&BackupOptions::default(), fx.service.as_ref())
            .unwrap();
        fs::write(backup.location.join(paths::ARCHIVE_FILE), b"garbage").unwrap();
        assert!(matches!(
            mgr.verify(&backup.id),
            Err(UpkeepError::BackupCorrupt { .. })
        ));
        assert!(mgr.latest_verified().unwrap().is_none());
    }

    #[test]
    fn ids_are_validated_before_filesystem_access() {
        let fx = Fixture::new();
        let mgr = fx.manager();
        assert!(matches!(
            mgr.delete("../../etc"),
            Err(UpkeepError::InvalidBackupId(_))
        ));
        assert!(matches!(
            mgr.get("backup-20200101-000000-000"),
            Err(UpkeepError::BackupNotFound(_))
        ));
    }

    #[test]
    fn restore_converges_diverged_tree_and_datastore() {
        let fx = Fixture::new();
        let root = fx.root();
        let mgr = fx.manager();
        let backup = mgr
            .create(&BackupOptions::default(), fx.service.as_ref())
            .unwrap();

        fs::write(root.join("app.py"), "v2").unwrap();
        fs::write(root.join("added.py"), "v2").unwrap();
        fs::remove_file(root.join("templates/index.html")).unwrap();
        Connection::open(root.join("data/links.db"))
            .unwrap()
            .execute("DELETE FROM links", [])
            .unwrap();

        let runner = CommandRunner::new(root, root);
        let ctx = RestoreContext {
            service: fx.service.as_ref(),
            repo: None,
            runner: &runner,
            grace: std::time::Duration::from_secs(1),
            restart: false,
        };
        let report = mgr.restore(&backup.id, &ctx, true).unwrap();
        assert_eq!(report.datastore, Some(datastore::RestoreMethod::RawCopy));

        assert_eq!(fs::read_to_string(root.join("app.py")).unwrap(), "v1");
        assert!(!root.join("added.py").exists());
        assert!(root.join("templates/index.html").exists());
        assert!(root.join("node_modules/lib/index.js").exists());
        let count: i64 = Connection::open(root.join("data/links.db"))
            .unwrap()
            .query_row("SELECT count(*) FROM links", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        // The backup used survives its own restore.
        assert!(mgr.get(&backup.id).is_ok());
        assert!(!MaintenanceController::new(root).is_enabled());
    }
}
