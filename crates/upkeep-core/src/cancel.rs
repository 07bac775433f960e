//! Operator cancellation of an update session.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use crate::error::{Result, UpkeepError};
use crate::lock::LockManager;
use crate::maintenance::MaintenanceController;
use crate::orchestrator::{self, Environment, Recovery};
use crate::process::{self, Termination};
use crate::progress::Outcome;
use crate::{io, paths};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The live session was asked to stop; `child` is the subprocess signalled, if any.
    Signalled { owner: u32, child: Option<u32> },
    /// The owner was already dead; its session was closed on its behalf.
    Reclaimed { owner: u32, recovery: Recovery },
    NoSession,
}

/// Cancel the running session.
///
/// A live owner gets the `cancel.request` marker and its running child is
/// signalled; the owner does its own rollback. A dead owner's session is
/// finished here: past the mutation boundary that means restoring the newest
/// verified backup, and a failed restore surfaces as `RollbackFailure` with
/// maintenance mode left on.
pub fn request_cancel(env: &Environment) -> Result<CancelOutcome> {
    let root = env.root.as_path();
    let lock = LockManager::new(root);
    let Some(status) = lock.status()? else {
        return Ok(CancelOutcome::NoSession);
    };
    let owner = status.record.owner_pid;

    if status.alive {
        io::write_json(
            &paths::cancel_path(root),
            &serde_json::json!({
                "version": 1,
                "requestedAt": Utc::now(),
                "requestedBy": std::process::id(),
            }),
        )?;
        let child = read_child_pid(root).filter(|pid| process::pid_alive(*pid));
        if let Some(pid) = child {
            process::signal_pid(pid, Termination::Graceful)?;
        }
        tracing::info!(owner, child, "cancellation requested");
        return Ok(CancelOutcome::Signalled { owner, child });
    }

    // Nobody will observe the marker; take the lock and finish the session.
    lock.acquire()?;
    let recovered = orchestrator::recover_abandoned(env, Outcome::Cancelled, &UpkeepError::Cancelled);
    let recovery = match recovered {
        Ok(Recovery::NoSession) => {
            MaintenanceController::new(root).disable()?;
            Recovery::NoSession
        }
        Ok(recovery) => recovery,
        Err(e) => {
            discard_transient(root);
            lock.release()?;
            return Err(e);
        }
    };
    discard_transient(root);
    lock.release()?;
    tracing::info!(owner, ?recovery, "reclaimed session of dead owner");
    Ok(CancelOutcome::Reclaimed { owner, recovery })
}

fn discard_transient(root: &Path) {
    for path in [paths::cancel_path(root), paths::child_pid_path(root)] {
        if let Err(e) = io::remove_if_exists(&path) {
            tracing::warn!(error = %e, path = %path.display(), "could not remove");
        }
    }
}

fn read_child_pid(root: &Path) -> Option<u32> {
    std::fs::read_to_string(paths::child_pid_path(root))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
