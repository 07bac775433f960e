use axum::http::StatusCode;
use http_body_util::BodyExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tower::ServiceExt;
use upkeep_core::backup::{BackupManager, BackupOptions};
use upkeep_core::config::Config;
use upkeep_core::lock::LockManager;
use upkeep_core::maintenance::MaintenanceController;
use upkeep_core::process::CommandRunner;
use upkeep_server::state::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A launcher that records its arguments instead of running anything.
fn fake_launcher(dir: &TempDir) -> PathBuf {
    let script = dir.path().join("fake-upkeep.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\necho \"$*\" >> \"$(dirname \"$0\")/launched.txt\"\n",
    )
    .unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn app(dir: &TempDir) -> axum::Router {
    let state = AppState::new(dir.path().to_path_buf(), fake_launcher(dir));
    upkeep_server::build_router(state)
}

async fn wait_for_launch(dir: &Path) -> String {
    let path = dir.join("launched.txt");
    for _ in 0..50 {
        if let Ok(s) = std::fs::read_to_string(&path) {
            if !s.is_empty() {
                return s;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("launcher never ran");
}

fn make_backup(dir: &TempDir) -> String {
    std::fs::write(dir.path().join("app.py"), "print('v1')\n").unwrap();
    let config = Config::default();
    let runner = CommandRunner::new(dir.path(), dir.path());
    let service = upkeep_core::service::controller(&config.service, runner, dir.path());
    BackupManager::new(dir.path(), &config)
        .create(&BackupOptions::default(), service.as_ref())
        .unwrap()
        .id
}

async fn send(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = axum::http::Request::builder().method(method).uri(uri);
    let req = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(axum::body::Body::from(serde_json::to_vec(&b).unwrap()))
            .unwrap(),
        None => builder.body(axum::body::Body::empty()).unwrap(),
    };
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send(app, "GET", uri, None).await
}

async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    send(app, "POST", uri, Some(body)).await
}

// ---------------------------------------------------------------------------
// Update sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_is_idle_without_a_session() {
    let dir = TempDir::new().unwrap();
    let (status, json) = get(app(&dir), "/api/update/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["isUpdating"], false);
    assert_eq!(json["currentStep"], "Idle");
}

#[tokio::test]
async fn status_reflects_progress_record() {
    let dir = TempDir::new().unwrap();
    let mut progress = upkeep_core::progress::ProgressReporter::begin(dir.path(), 16).unwrap();
    progress.advance("AcquireLock").unwrap();
    progress.advance("CheckPrerequisites").unwrap();

    let (_, json) = get(app(&dir), "/api/update/status").await;
    assert_eq!(json["isUpdating"], true);
    assert_eq!(json["step"], 2);
    assert_eq!(json["totalSteps"], 16);
    assert_eq!(json["currentStep"], "CheckPrerequisites");
}

#[tokio::test]
async fn start_update_launches_detached_session() {
    let dir = TempDir::new().unwrap();
    let (status, json) = post_json(
        app(&dir),
        "/api/update",
        serde_json::json!({ "force": true, "branch": "main" }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["started"], true);
    assert!(json["pid"].as_u64().unwrap() > 0);

    let launched = wait_for_launch(dir.path()).await;
    assert!(launched.contains("--force"));
    assert!(launched.contains("--branch main"));
}

#[tokio::test]
async fn start_update_conflicts_with_live_session() {
    let dir = TempDir::new().unwrap();
    LockManager::new(dir.path()).acquire().unwrap();
    let (status, json) = post_json(app(&dir), "/api/update", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("another update session"));
    assert!(!dir.path().join("launched.txt").exists());
}

#[tokio::test]
async fn start_update_rejects_bad_branch() {
    let dir = TempDir::new().unwrap();
    let (status, _) = post_json(
        app(&dir),
        "/api/update",
        serde_json::json!({ "branch": "--upload-pack=evil" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_without_session() {
    let dir = TempDir::new().unwrap();
    let (status, json) = post_json(app(&dir), "/api/update/cancel", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["result"], "no_session");
}

#[tokio::test]
async fn cancel_finishes_dead_session() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".upkeep")).unwrap();
    std::fs::write(
        dir.path().join(".upkeep/update.lock"),
        r#"{"version":1,"ownerPid":99999999,"acquiredAt":"2026-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    let (status, json) = post_json(app(&dir), "/api/update/cancel", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["result"], "reclaimed");
    assert_eq!(json["recovery"], "no_session");
    assert!(!dir.path().join(".upkeep/update.lock").exists());
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_backups_empty_then_populated() {
    let dir = TempDir::new().unwrap();
    let (status, json) = get(app(&dir), "/api/backups").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!([]));

    let id = make_backup(&dir);
    let (_, json) = get(app(&dir), "/api/backups").await;
    assert_eq!(json[0]["id"], id.as_str());
    assert!(json[0]["integrityDigest"].is_string());
}

#[tokio::test]
async fn create_backup_is_detached() {
    let dir = TempDir::new().unwrap();
    let (status, _) = post_json(app(&dir), "/api/backups", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(wait_for_launch(dir.path()).await.contains("--backup-only"));
}

#[tokio::test]
async fn restore_validates_id_and_existence() {
    let dir = TempDir::new().unwrap();
    let (status, _) = post_json(app(&dir), "/api/backups/not-an-id/restore", serde_json::json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        app(&dir),
        "/api/backups/backup-20200101-000000-000/restore",
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let id = make_backup(&dir);
    let (status, json) = post_json(
        app(&dir),
        &format!("/api/backups/{id}/restore"),
        serde_json::json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["backupId"], id.as_str());
    assert!(wait_for_launch(dir.path()).await.contains(&format!("--restore {id}")));
}

#[tokio::test]
async fn delete_backup() {
    let dir = TempDir::new().unwrap();
    let id = make_backup(&dir);

    let (status, _) = send(app(&dir), "DELETE", &format!("/api/backups/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = get(app(&dir), "/api/backups").await;
    assert_eq!(json, serde_json::json!([]));

    let (status, _) = send(app(&dir), "DELETE", &format!("/api/backups/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_backup_refused_during_session() {
    let dir = TempDir::new().unwrap();
    let id = make_backup(&dir);
    LockManager::new(dir.path()).acquire().unwrap();

    let (status, _) = send(app(&dir), "DELETE", &format!("/api/backups/{id}"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(dir.path().join(".upkeep/backups").join(&id).is_dir());
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn maintenance_toggle_round_trip() {
    let dir = TempDir::new().unwrap();
    let (_, json) = get(app(&dir), "/api/maintenance").await;
    assert_eq!(json["enabled"], false);

    let (status, json) = post_json(
        app(&dir),
        "/api/maintenance",
        serde_json::json!({ "enabled": true, "reason": "Migrating", "estimatedDuration": 120 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enabled"], true);
    assert_eq!(json["estimatedDuration"], 120);
    assert!(MaintenanceController::new(dir.path()).is_enabled());

    let (_, json) = get(app(&dir), "/api/maintenance").await;
    assert_eq!(json["reason"], "Migrating");

    let (_, json) = post_json(
        app(&dir),
        "/api/maintenance",
        serde_json::json!({ "enabled": false }),
    )
    .await;
    assert_eq!(json["enabled"], false);
    assert!(!MaintenanceController::new(dir.path()).is_enabled());
}

#[tokio::test]
async fn maintenance_is_single_writer_during_session() {
    let dir = TempDir::new().unwrap();
    LockManager::new(dir.path()).acquire().unwrap();
    let (status, _) = post_json(
        app(&dir),
        "/api/maintenance",
        serde_json::json!({ "enabled": false }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// ---------------------------------------------------------------------------
// Maintenance gate
// ---------------------------------------------------------------------------

fn gated_service(dir: &TempDir) -> axum::Router {
    use axum::routing::get;
    use upkeep_server::gate::{maintenance_gate, GateState};

    let gate = GateState::new(dir.path().to_path_buf(), Config::default().maintenance);
    axum::Router::new()
        .route("/", get(|| async { "home" }))
        .route("/api/links", get(|| async { "[]" }))
        .route("/admin/dashboard", get(|| async { "admin" }))
        .route("/static/site.css", get(|| async { "body{}" }))
        .layer(axum::middleware::from_fn_with_state(gate, maintenance_gate))
}

async fn gated(
    dir: &TempDir,
    uri: &str,
    accept: &str,
) -> (StatusCode, Option<String>, String) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .header("accept", accept)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = gated_service(dir).oneshot(req).await.unwrap();
    let status = response.status();
    let retry = response
        .headers()
        .get("retry-after")
        .map(|v| v.to_str().unwrap().to_string());
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, retry, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn gate_passes_everything_when_off() {
    let dir = TempDir::new().unwrap();
    let (status, _, body) = gated(&dir, "/api/links", "application/json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "[]");
}

#[tokio::test]
async fn gate_blocks_public_traffic_when_on() {
    let dir = TempDir::new().unwrap();
    MaintenanceController::new(dir.path())
        .enable("Updating to abc123", 300)
        .unwrap();

    let (status, retry, body) = gated(&dir, "/api/links", "application/json").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(retry.unwrap().parse::<u64>().unwrap() >= 30);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["maintenance"], true);
    assert_eq!(json["reason"], "Updating to abc123");

    let (status, _, body) = gated(&dir, "/", "text/html,application/xhtml+xml").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("<html"));

    let (status, _, body) = gated(&dir, "/admin/dashboard", "text/html").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "admin");

    let (status, _, _) = gated(&dir, "/static/site.css", "text/css").await;
    assert_eq!(status, StatusCode::OK);
}
