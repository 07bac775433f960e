//! Request gate for the managed service while maintenance mode is on.
//!
//! Mount on the service's router with
//! `axum::middleware::from_fn_with_state(GateState::new(root, cfg), maintenance_gate)`.

use std::path::PathBuf;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use upkeep_core::config::MaintenanceConfig;
use upkeep_core::maintenance::{GateDecision, MaintenanceFlag};
use upkeep_core::paths;

#[derive(Clone)]
pub struct GateState {
    flag_path: PathBuf,
    config: MaintenanceConfig,
}

impl GateState {
    pub fn new(root: PathBuf, config: MaintenanceConfig) -> Self {
        Self {
            flag_path: paths::maintenance_path(&root),
            config,
        }
    }
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|a| a.contains("text/html"))
}

/// The flag is re-read per request so toggles take effect without a restart.
/// A missing or unreadable flag lets the request through.
pub async fn maintenance_gate(State(gate): State<GateState>, req: Request, next: Next) -> Response {
    let flag = match tokio::fs::read(&gate.flag_path).await {
        Ok(data) => serde_json::from_slice::<MaintenanceFlag>(&data).ok(),
        Err(_) => None,
    };
    let Some(flag) = flag else {
        return next.run(req).await;
    };

    let decision = flag.gate(&gate.config, req.uri().path(), accepts_html(req.headers()));
    let now = Utc::now();
    let retry_after = [(header::RETRY_AFTER, flag.retry_after(now).to_string())];
    match decision {
        GateDecision::Allow => next.run(req).await,
        GateDecision::ApiUnavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            retry_after,
            Json(flag.unavailable_body(now)),
        )
            .into_response(),
        GateDecision::HoldingPage => (
            StatusCode::SERVICE_UNAVAILABLE,
            retry_after,
            Html(flag.holding_page()),
        )
            .into_response(),
    }
}
