pub mod backup;
pub mod cancel;
pub mod cleanup;
pub mod health;
pub mod maintenance;
pub mod restore;
pub mod serve;
pub mod status;
pub mod update;

use anyhow::Context;
use std::path::Path;
use upkeep_core::config::{Config, WarnLevel};
use upkeep_core::lock::LockManager;

/// Load `.upkeep/config.yaml` and surface its warnings through the log.
pub(crate) fn load_config(root: &Path) -> anyhow::Result<Config> {
    let config = Config::load(root).context("failed to load .upkeep/config.yaml")?;
    for warning in config.validate() {
        match warning.level {
            WarnLevel::Error => tracing::error!("config: {}", warning.message),
            WarnLevel::Warning => tracing::warn!("config: {}", warning.message),
        }
    }
    Ok(config)
}

/// Run `f` while holding the update lock, so a backup or restore never
/// overlaps an update session.
pub(crate) fn exclusive<T>(
    root: &Path,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let lock = LockManager::new(root);
    lock.acquire()?;
    let result = f();
    if let Err(e) = lock.release() {
        tracing::error!(error = %e, "failed to release update lock");
    }
    result
}
