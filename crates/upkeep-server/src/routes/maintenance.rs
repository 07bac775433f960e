use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use upkeep_core::config::Config;
use upkeep_core::maintenance::MaintenanceController;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMaintenanceBody {
    pub enabled: bool,
    #[serde(default)]
    pub reason: Option<String>,
    /// Seconds; defaults to `maintenance.estimated_duration_secs`.
    #[serde(default)]
    pub estimated_duration: Option<u64>,
}

fn off() -> serde_json::Value {
    serde_json::json!({ "enabled": false })
}

/// GET /api/maintenance
pub async fn get_maintenance(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let root = app.root.clone();
    let flag = tokio::task::spawn_blocking(move || MaintenanceController::new(&root).status())
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    let value = match flag {
        Some(flag) => serde_json::to_value(flag)?,
        None => off(),
    };
    Ok(Json(value))
}

/// POST /api/maintenance: refused while an update session owns the flag.
pub async fn set_maintenance(
    State(app): State<AppState>,
    Json(body): Json<SetMaintenanceBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let root = app.root.clone();
    let value = tokio::task::spawn_blocking(move || -> upkeep_core::Result<serde_json::Value> {
        super::ensure_idle(&root)?;
        let controller = MaintenanceController::new(&root);
        if !body.enabled {
            controller.disable()?;
            return Ok(off());
        }
        let duration = match body.estimated_duration {
            Some(secs) => secs,
            None => Config::load(&root)?.maintenance.estimated_duration_secs,
        };
        let reason = body.reason.as_deref().unwrap_or("Scheduled maintenance");
        let flag = controller.enable(reason, duration)?;
        Ok(serde_json::to_value(flag)?)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(value))
}
