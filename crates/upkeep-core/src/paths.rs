use crate::error::{Result, UpkeepError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const UPKEEP_DIR: &str = ".upkeep";
pub const BACKUPS_DIR: &str = ".upkeep/backups";

pub const CONFIG_FILE: &str = ".upkeep/config.yaml";
pub const LOCK_FILE: &str = ".upkeep/update.lock";
pub const LOCK_GUARD_FILE: &str = ".upkeep/update.lock.guard";
pub const PROGRESS_FILE: &str = ".upkeep/progress.json";
pub const LAST_FAILURE_FILE: &str = ".upkeep/last-failure.json";
pub const MAINTENANCE_FILE: &str = ".upkeep/maintenance.json";
pub const CANCEL_FILE: &str = ".upkeep/cancel.request";
pub const CHILD_PID_FILE: &str = ".upkeep/child.pid";
pub const LOG_FILE: &str = ".upkeep/update.log";

// Files inside a single backup directory.
pub const ARCHIVE_FILE: &str = "files.tar.gz";
pub const RAW_DB_FILE: &str = "database.sqlite";
pub const EXPORT_DB_FILE: &str = "database.sql";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const RESTORE_PLAN_FILE: &str = "restore-plan.json";
pub const RESTORE_SCRIPT_FILE: &str = "restore.sh";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn upkeep_dir(root: &Path) -> PathBuf {
    root.join(UPKEEP_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn lock_guard_path(root: &Path) -> PathBuf {
    root.join(LOCK_GUARD_FILE)
}

pub fn progress_path(root: &Path) -> PathBuf {
    root.join(PROGRESS_FILE)
}

pub fn last_failure_path(root: &Path) -> PathBuf {
    root.join(LAST_FAILURE_FILE)
}

pub fn maintenance_path(root: &Path) -> PathBuf {
    root.join(MAINTENANCE_FILE)
}

pub fn cancel_path(root: &Path) -> PathBuf {
    root.join(CANCEL_FILE)
}

pub fn child_pid_path(root: &Path) -> PathBuf {
    root.join(CHILD_PID_FILE)
}

pub fn log_path(root: &Path) -> PathBuf {
    root.join(LOG_FILE)
}

/// Resolve a configured path: absolute paths are kept, relative ones hang off `root`.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

// ---------------------------------------------------------------------------
// Backup id validation
// ---------------------------------------------------------------------------

static BACKUP_ID_RE: OnceLock<Regex> = OnceLock::new();

fn backup_id_re() -> &'static Regex {
    BACKUP_ID_RE.get_or_init(|| Regex::new(r"^backup-\d{8}-\d{6}-\d{3}$").unwrap())
}

pub fn validate_backup_id(id: &str) -> Result<()> {
    if !backup_id_re().is_match(id) {
        return Err(UpkeepError::InvalidBackupId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
