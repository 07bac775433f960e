//! Emergency rollback, shared by a failing session and by whoever closes a
//! session whose owner died.

use serde::Serialize;

use super::{Environment, Step};
use crate::error::{Result, UpkeepError};
use crate::health::{self, CheckParams};
use crate::maintenance::MaintenanceController;
use crate::progress::{Outcome, ProgressReporter, RollbackStatus};

/// How an abandoned session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recovery {
    /// No unfinished progress record.
    NoSession,
    /// Died before the mutation boundary; there was nothing to undo.
    Closed,
    /// The newest verified backup was restored and passed the health check.
    RolledBack,
}

/// Restore the newest verified backup and verify the service. Records the
/// attempt on the progress record.
pub(crate) fn emergency_rollback(
    env: &Environment,
    progress: &mut ProgressReporter,
    restart: bool,
) -> Result<()> {
    let span = tracing::warn_span!("rollback");
    let _guard = span.enter();
    progress.record_rollback(RollbackStatus::InProgress)?;
    progress.note("EmergencyRollback")?;

    let result = restore_latest(env, progress, restart);
    let status = if result.is_ok() {
        RollbackStatus::Succeeded
    } else {
        RollbackStatus::Failed
    };
    if let Err(e) = progress.record_rollback(status) {
        tracing::warn!(error = %e, "could not record rollback status");
    }
    result
}

fn restore_latest(env: &Environment, progress: &mut ProgressReporter, restart: bool) -> Result<()> {
    let backups = env.backups();
    let backup = backups.latest_verified()?.ok_or_else(|| {
        UpkeepError::RollbackFailure("no verified backup available".into())
    })?;
    tracing::warn!(backup = %backup.id, "restoring backup");
    backups.restore(&backup.id, &env.restore_context(restart), false)?;

    progress.note("RollbackHealthCheck")?;
    let cfg = &env.config.health;
    let report = health::check(env.probe.as_ref(), &cfg.endpoint, &CheckParams::post_update(cfg));
    if !report.passed {
        return Err(UpkeepError::RollbackFailure(format!(
            "restored service failed health check: {}",
            report.last_error().unwrap_or("unhealthy")
        )));
    }
    tracing::info!(backup = %backup.id, "rollback succeeded");
    Ok(())
}

/// Close the progress record of a session whose owner died.
///
/// A session that got past [`Step::MUTATION_BOUNDARY`] is rolled back first,
/// with the same restart policy the session ran under. When no rollback is
/// possible, or one was already attempted, the record ends
/// `failed_unrecoverable`, maintenance mode stays on and `RollbackFailure`
/// is returned. Otherwise maintenance is disabled and the record ends with
/// `outcome`.
///
/// The caller must already hold, or have reclaimed, the update lock.
pub fn recover_abandoned(
    env: &Environment,
    outcome: Outcome,
    cause: &UpkeepError,
) -> Result<Recovery> {
    let maintenance = MaintenanceController::new(&env.root);
    let open = ProgressReporter::resume(&env.root)?.filter(|p| !p.session().is_terminal());
    let Some(mut progress) = open else {
        return Ok(Recovery::NoSession);
    };

    let session = progress.session().clone();
    if session.step < Step::MUTATION_BOUNDARY.index() {
        maintenance.disable()?;
        progress.finalize(outcome, Some(cause))?;
        tracing::info!(step = %session.current_step, "closed abandoned session");
        return Ok(Recovery::Closed);
    }

    let span = tracing::warn_span!("recover", session = %session.id, step = session.step);
    let _guard = span.enter();
    let rolled_back = match session.rollback {
        Some(RollbackStatus::Succeeded) => Ok(()),
        Some(_) => Err(UpkeepError::RollbackFailure(
            "rollback already attempted by the previous owner".into(),
        )),
        None => {
            let restart = !session
                .skipped_steps
                .iter()
                .any(|s| s == Step::StopServices.name());
            emergency_rollback(env, &mut progress, restart)
        }
    };

    match rolled_back {
        Ok(()) => {
            maintenance.disable()?;
            progress.finalize(outcome, Some(cause))?;
            Ok(Recovery::RolledBack)
        }
        Err(e) => {
            let reason = match e {
                UpkeepError::RollbackFailure(reason) => reason,
                other => other.to_string(),
            };
            let fatal = UpkeepError::RollbackFailure(format!("{reason} (after: {cause})"));
            tracing::error!(error = %fatal, "abandoned session left in maintenance mode");
            progress.finalize(Outcome::FailedUnrecoverable, Some(&fatal))?;
            Err(fatal)
        }
    }
}
