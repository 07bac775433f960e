//! Recovery from sessions that died without finalizing.

use std::path::Path;

use serde::Serialize;

use crate::error::{Result, UpkeepError};
use crate::lock::LockManager;
use crate::maintenance::MaintenanceController;
use crate::orchestrator::{self, Environment, Recovery};
use crate::progress::{Outcome, ProgressReporter};
use crate::{io, paths};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub lock_reclaimed: bool,
    pub maintenance_cleared: bool,
    /// An unfinished progress record was finalized as failed.
    pub session_closed: bool,
    pub recovery: Recovery,
    pub transient_removed: usize,
    pub partial_backups_removed: usize,
    pub pruned: Vec<String>,
}

/// Refuses to run while a live session holds the lock, and holds the lock
/// itself while it works.
pub fn cleanup(env: &Environment) -> Result<CleanupReport> {
    let lock = LockManager::new(&env.root);
    let lock_reclaimed = match lock.status()? {
        Some(status) if status.alive => {
            return Err(UpkeepError::ConcurrencyConflict {
                pid: status.record.owner_pid,
            });
        }
        Some(_) => true,
        None => false,
    };

    lock.acquire()?;
    let result = sweep(env, lock_reclaimed);
    if let Err(e) = lock.release() {
        tracing::error!(error = %e, "failed to release update lock");
    }
    result
}

fn sweep(env: &Environment, lock_reclaimed: bool) -> Result<CleanupReport> {
    let root = env.root.as_path();
    let maintenance = MaintenanceController::new(root);
    let was_enabled = maintenance.is_enabled();

    let step = ProgressReporter::read(root)?
        .map(|s| s.current_step)
        .unwrap_or_default();
    let cause = UpkeepError::OperationFailure {
        step,
        message: "session ended without finalizing".into(),
    };
    let recovery = orchestrator::recover_abandoned(env, Outcome::Failed, &cause)?;
    if recovery == Recovery::NoSession && !last_session_unrecoverable(root)? {
        maintenance.disable()?;
    }

    let mut report = CleanupReport {
        lock_reclaimed,
        maintenance_cleared: was_enabled && !maintenance.is_enabled(),
        session_closed: recovery != Recovery::NoSession,
        recovery,
        transient_removed: 0,
        partial_backups_removed: 0,
        pruned: Vec::new(),
    };

    for path in [paths::cancel_path(root), paths::child_pid_path(root)] {
        if io::remove_if_exists(&path)? {
            report.transient_removed += 1;
        }
    }

    let backups = env.backups();
    report.partial_backups_removed = backups.discard_partial()?;
    report.pruned = backups.prune(env.config.backup.retention)?;

    tracing::info!(
        lock = report.lock_reclaimed,
        maintenance = report.maintenance_cleared,
        recovery = ?report.recovery,
        pruned = report.pruned.len(),
        "cleanup complete"
    );
    Ok(report)
}

/// The flag of a session that could not be rolled back stays for the operator.
fn last_session_unrecoverable(root: &Path) -> Result<bool> {
    Ok(ProgressReporter::read(root)?
        .is_some_and(|s| s.outcome == Outcome::FailedUnrecoverable))
}
