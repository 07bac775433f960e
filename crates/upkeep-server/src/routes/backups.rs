use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use upkeep_core::backup::{Backup, BackupManager};
use upkeep_core::config::Config;
use upkeep_core::paths;

use crate::error::AppError;
use crate::launch;
use crate::state::AppState;

fn join_error(e: tokio::task::JoinError) -> AppError {
    AppError(anyhow::anyhow!("task join error: {e}"))
}

/// GET /api/backups: newest first.
pub async fn list_backups(State(app): State<AppState>) -> Result<Json<Vec<Backup>>, AppError> {
    let root = app.root.clone();
    let backups = tokio::task::spawn_blocking(move || {
        let config = Config::load(&root)?;
        BackupManager::new(&root, &config).list()
    })
    .await
    .map_err(join_error)??;
    Ok(Json(backups))
}

/// POST /api/backups: detached `--backup-only`.
pub async fn create_backup(
    State(app): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let root = app.root.clone();
    tokio::task::spawn_blocking(move || super::ensure_idle(&root))
        .await
        .map_err(join_error)??;

    let pid = launch::spawn_detached(&app.launcher, &app.root, &["--backup-only".to_string()])?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "started": true, "pid": pid })),
    ))
}

/// POST /api/backups/{id}/restore: detached `--restore <id>` once the id is
/// known to name an existing backup.
pub async fn restore_backup(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let root = app.root.clone();
    let checked = id.clone();
    tokio::task::spawn_blocking(move || {
        paths::validate_backup_id(&checked)?;
        let config = Config::load(&root)?;
        BackupManager::new(&root, &config).get(&checked)?;
        super::ensure_idle(&root)
    })
    .await
    .map_err(join_error)??;

    let pid = launch::spawn_detached(
        &app.launcher,
        &app.root,
        &["--restore".to_string(), id.clone()],
    )?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "started": true, "pid": pid, "backupId": id })),
    ))
}

/// DELETE /api/backups/{id}: refused while a session runs, since it may be
/// the rollback target.
pub async fn delete_backup(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let root = app.root.clone();
    let deleted = id.clone();
    tokio::task::spawn_blocking(move || {
        paths::validate_backup_id(&deleted)?;
        super::ensure_idle(&root)?;
        let config = Config::load(&root)?;
        BackupManager::new(&root, &config).delete(&deleted)
    })
    .await
    .map_err(join_error)??;
    Ok(Json(serde_json::json!({ "deleted": id })))
}
