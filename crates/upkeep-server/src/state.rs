use std::path::PathBuf;
use tokio::sync::broadcast;
use upkeep_core::paths;
use upkeep_core::progress::UpdateSession;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    /// The `upkeep` binary; updates, backups and restores run as detached
    /// invocations of it so they outlive any single request.
    pub launcher: PathBuf,
    pub event_tx: broadcast::Sender<UpdateSession>,
}

impl AppState {
    pub fn new(root: PathBuf, launcher: PathBuf) -> Self {
        let (tx, _) = broadcast::channel(64);
        let state = Self {
            root,
            launcher,
            event_tx: tx.clone(),
        };

        // Watch progress.json mtime and broadcast the record when it changes.
        // Only spawned inside a Tokio runtime (skipped in sync unit tests).
        if tokio::runtime::Handle::try_current().is_ok() {
            let progress_file = paths::progress_path(&state.root);
            tokio::spawn(async move {
                let mut last_mtime = None::<std::time::SystemTime>;
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(800)).await;
                    let Ok(mtime) = tokio::fs::metadata(&progress_file)
                        .await
                        .and_then(|m| m.modified())
                    else {
                        continue;
                    };
                    if last_mtime == Some(mtime) {
                        continue;
                    }
                    // Unparseable means mid-replace; retry on the next tick.
                    let Ok(data) = tokio::fs::read(&progress_file).await else {
                        continue;
                    };
                    let Ok(session) = serde_json::from_slice::<UpdateSession>(&data) else {
                        continue;
                    };
                    last_mtime = Some(mtime);
                    let _ = tx.send(session);
                }
            });
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_stores_root_and_launcher() {
        let state = AppState::new(PathBuf::from("/tmp/test"), PathBuf::from("/usr/bin/upkeep"));
        assert_eq!(state.root, PathBuf::from("/tmp/test"));
        assert_eq!(state.launcher, PathBuf::from("/usr/bin/upkeep"));
    }

    #[tokio::test]
    async fn watcher_broadcasts_progress_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = AppState::new(dir.path().to_path_buf(), PathBuf::from("upkeep"));
        let mut rx = state.event_tx.subscribe();

        let mut progress =
            upkeep_core::progress::ProgressReporter::begin(dir.path(), 16).unwrap();
        progress.advance("AcquireLock").unwrap();

        let session = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_updating);
        assert_eq!(session.total_steps, 16);
    }
}
