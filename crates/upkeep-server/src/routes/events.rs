use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use upkeep_core::progress::{ProgressReporter, UpdateSession};

use crate::state::AppState;

fn progress_event(session: &UpdateSession) -> Option<Event> {
    Event::default().event("progress").json_data(session).ok()
}

/// GET /api/update/events: SSE stream of `progress` events, starting with the
/// current record and then one per change of `progress.json`.
pub async fn sse_progress(State(app): State<AppState>) -> impl axum::response::IntoResponse {
    let rx = app.event_tx.subscribe();
    let root = app.root.clone();
    let current = tokio::task::spawn_blocking(move || ProgressReporter::read(&root))
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten()
        .unwrap_or_else(UpdateSession::idle);

    let initial = tokio_stream::iter(progress_event(&current).map(Ok::<Event, Infallible>));
    let updates = BroadcastStream::new(rx)
        .filter_map(|msg| msg.ok().and_then(|s| progress_event(&s)).map(Ok::<Event, Infallible>));
    Sse::new(initial.chain(updates)).keep_alive(KeepAlive::default())
}
