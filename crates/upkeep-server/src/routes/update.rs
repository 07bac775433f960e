use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use upkeep_core::cancel::{self, CancelOutcome};
use upkeep_core::config::Config;
use upkeep_core::orchestrator::Environment;
use upkeep_core::progress::{ProgressReporter, UpdateSession};
use upkeep_core::UpkeepError;

use crate::error::AppError;
use crate::launch;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StartUpdateBody {
    pub force: bool,
    pub skip_backup: bool,
    pub no_restart: bool,
    pub update_system: bool,
    pub branch: Option<String>,
}

impl StartUpdateBody {
    /// CLI arguments for the detached run.
    fn args(&self) -> Result<Vec<String>, UpkeepError> {
        let mut args = Vec::new();
        for (set, flag) in [
            (self.force, "--force"),
            (self.skip_backup, "--skip-backup"),
            (self.no_restart, "--no-restart"),
            (self.update_system, "--update-system"),
        ] {
            if set {
                args.push(flag.to_string());
            }
        }
        if let Some(branch) = &self.branch {
            validate_branch(branch)?;
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        Ok(args)
    }
}

fn validate_branch(branch: &str) -> Result<(), UpkeepError> {
    let ok = !branch.is_empty()
        && !branch.starts_with('-')
        && !branch.contains("..")
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if ok {
        Ok(())
    } else {
        Err(UpkeepError::ValidationFailure(format!(
            "invalid branch name '{branch}'"
        )))
    }
}

/// GET /api/update/status: the current or last progress record.
pub async fn get_status(State(app): State<AppState>) -> Result<Json<UpdateSession>, AppError> {
    let root = app.root.clone();
    let session = tokio::task::spawn_blocking(move || ProgressReporter::read(&root))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(session.unwrap_or_else(UpdateSession::idle)))
}

/// POST /api/update: launch a detached update session. Returns once the
/// process is started; progress is observed through status and events.
pub async fn start_update(
    State(app): State<AppState>,
    Json(body): Json<StartUpdateBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let args = body.args()?;
    let root = app.root.clone();
    tokio::task::spawn_blocking(move || super::ensure_idle(&root))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    let pid = launch::spawn_detached(&app.launcher, &app.root, &args)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "started": true, "pid": pid })),
    ))
}

/// POST /api/update/cancel: signals a live session, or finishes (and if
/// needed rolls back) the session of a dead one.
pub async fn cancel_update(State(app): State<AppState>) -> Result<Json<CancelOutcome>, AppError> {
    let root = app.root.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let config = Config::load(&root)?;
        cancel::request_cancel(&Environment::new(&root, config))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_flags_become_cli_args() {
        let body = StartUpdateBody {
            force: true,
            no_restart: true,
            branch: Some("release/2.1".into()),
            ..StartUpdateBody::default()
        };
        assert_eq!(
            body.args().unwrap(),
            ["--force", "--no-restart", "--branch", "release/2.1"]
        );
    }

    #[test]
    fn option_like_branches_are_rejected() {
        for bad in ["", "--upload-pack=x", "a..b", "main;rm"] {
            assert!(validate_branch(bad).is_err(), "{bad}");
        }
        validate_branch("main").unwrap();
    }
}
