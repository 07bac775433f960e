use std::path::Path;

use upkeep_core::lock::LockManager;
use upkeep_core::maintenance::MaintenanceController;
use upkeep_core::UpkeepError;

use crate::output::print_json;

/// `--maintenance on|off`. An update session owns the flag while it holds the lock.
pub fn run(root: &Path, enable: bool, reason: &str, json: bool) -> anyhow::Result<()> {
    if let Some(status) = LockManager::new(root).status()? {
        if status.alive {
            return Err(UpkeepError::ConcurrencyConflict {
                pid: status.record.owner_pid,
            }
            .into());
        }
    }

    let controller = MaintenanceController::new(root);
    if enable {
        let config = super::load_config(root)?;
        let flag = controller.enable(reason, config.maintenance.estimated_duration_secs)?;
        if json {
            return print_json(&flag);
        }
        println!("Maintenance mode on: {}", flag.reason);
    } else {
        let was_on = controller.disable()?;
        if json {
            return print_json(&serde_json::json!({ "enabled": false, "changed": was_on }));
        }
        if was_on {
            println!("Maintenance mode off.");
        } else {
            println!("Maintenance mode was already off.");
        }
    }
    Ok(())
}
