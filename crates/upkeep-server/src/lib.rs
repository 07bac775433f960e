pub mod error;
pub mod gate;
pub mod launch;
pub mod routes;
pub mod state;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the admin API router. Used by `serve_on()` and by integration tests.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Update sessions
        .route("/api/update", post(routes::update::start_update))
        .route("/api/update/status", get(routes::update::get_status))
        .route("/api/update/events", get(routes::events::sse_progress))
        .route("/api/update/cancel", post(routes::update::cancel_update))
        // Backups
        .route(
            "/api/backups",
            get(routes::backups::list_backups).post(routes::backups::create_backup),
        )
        .route("/api/backups/{id}", delete(routes::backups::delete_backup))
        .route(
            "/api/backups/{id}/restore",
            post(routes::backups::restore_backup),
        )
        // Maintenance mode
        .route(
            "/api/maintenance",
            get(routes::maintenance::get_maintenance).post(routes::maintenance::set_maintenance),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Serve the admin API on a pre-bound listener.
pub async fn serve_on(app_state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = build_router(app_state);

    tracing::info!("upkeep admin API listening on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
