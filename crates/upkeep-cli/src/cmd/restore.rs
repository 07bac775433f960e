use std::path::Path;

use serde::Serialize;
use upkeep_core::backup::restore::RestoreReport;
use upkeep_core::health::{self, CheckParams, HealthReport};
use upkeep_core::orchestrator::Environment;
use upkeep_core::UpkeepError;

use crate::output::{print_json, short_rev};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RestoreOutput {
    #[serde(flatten)]
    report: RestoreReport,
    health: HealthReport,
}

/// `--restore [ID]`: restore a backup under the update lock, with maintenance
/// mode on for the duration, then verify health.
pub fn run(root: &Path, id: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let env = Environment::new(root, config);

    let report = super::exclusive(root, || {
        let backups = env.backups();
        let id = match id {
            Some(id) => id.to_string(),
            None => backups
                .latest_verified()?
                .ok_or_else(|| UpkeepError::BackupNotFound("no verified backup".to_string()))?
                .id,
        };
        tracing::info!(id = %id, "restoring backup");
        Ok(backups.restore(&id, &env.restore_context(true), true)?)
    })?;

    let cfg = &env.config.health;
    let health = health::check(
        env.probe.as_ref(),
        &cfg.endpoint,
        &CheckParams::post_update(cfg),
    );
    let passed = health.passed;
    let failure = UpkeepError::HealthCheckFailure {
        attempts: health.attempts,
        message: health.last_error().unwrap_or("unhealthy").to_string(),
    };

    if json {
        print_json(&RestoreOutput { report, health })?;
    } else {
        println!("Restored {}", report.backup_id);
        println!("  revision   {}", short_rev(report.revision.as_deref()));
        if let Some(method) = report.datastore {
            println!("  datastore  {method:?}");
        }
        println!("  commands   {}", report.commands_run);
        println!(
            "  health     {}",
            if passed { "passing" } else { "failing" }
        );
    }

    if passed {
        Ok(())
    } else {
        Err(failure.into())
    }
}
