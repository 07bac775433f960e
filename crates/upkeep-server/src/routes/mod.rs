pub mod backups;
pub mod events;
pub mod maintenance;
pub mod update;

use std::path::Path;
use upkeep_core::lock::LockManager;
use upkeep_core::UpkeepError;

/// Fails with `ConcurrencyConflict` while a live session holds the update lock.
pub(crate) fn ensure_idle(root: &Path) -> Result<(), UpkeepError> {
    match LockManager::new(root).status()? {
        Some(status) if status.alive => Err(UpkeepError::ConcurrencyConflict {
            pid: status.record.owner_pid,
        }),
        _ => Ok(()),
    }
}
