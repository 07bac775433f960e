use std::path::Path;

use serde::Serialize;
use upkeep_core::lock::{LockManager, LockStatus};
use upkeep_core::maintenance::{MaintenanceController, MaintenanceFlag};
use upkeep_core::progress::{ProgressReporter, UpdateSession};

use crate::output::print_json;

#[derive(Serialize)]
struct StatusOutput {
    session: UpdateSession,
    lock: Option<LockStatus>,
    maintenance: Option<MaintenanceFlag>,
}

/// `--status`: the current or last session, plus lock and maintenance state.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let out = StatusOutput {
        session: ProgressReporter::read(root)?.unwrap_or_else(UpdateSession::idle),
        lock: LockManager::new(root).status()?,
        maintenance: MaintenanceController::new(root).status()?,
    };

    if json {
        return print_json(&out);
    }

    let s = &out.session;
    if s.is_updating {
        println!(
            "updating: step {}/{} {} ({}%), ~{}s remaining",
            s.step, s.total_steps, s.current_step, s.percentage, s.estimated_time_remaining
        );
    } else if s.owner_pid == 0 {
        println!("idle: no update has run");
    } else {
        println!(
            "last session: {:?} at {}",
            s.outcome,
            s.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(err) = &s.error {
            println!("  error: {err}");
        }
        if let Some(rollback) = s.rollback {
            println!("  rollback: {rollback:?}");
        }
    }

    match &out.lock {
        Some(l) if l.alive => println!("lock: held by pid {}", l.record.owner_pid),
        Some(l) => println!(
            "lock: stale (pid {} is gone; run --cleanup)",
            l.record.owner_pid
        ),
        None => println!("lock: free"),
    }
    match &out.maintenance {
        Some(m) if m.enabled => println!(
            "maintenance: on since {} ({})",
            m.start_time.format("%Y-%m-%d %H:%M:%S"),
            m.reason
        ),
        _ => println!("maintenance: off"),
    }
    Ok(())
}
