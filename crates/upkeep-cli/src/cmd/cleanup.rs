use std::path::Path;

use upkeep_core::cleanup;
use upkeep_core::orchestrator::{Environment, Recovery};

use crate::output::print_json;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let env = Environment::new(root, super::load_config(root)?);
    let report = cleanup::cleanup(&env)?;

    if json {
        return print_json(&report);
    }
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    println!("stale lock reclaimed      {}", yes_no(report.lock_reclaimed));
    println!("maintenance flag cleared  {}", yes_no(report.maintenance_cleared));
    println!("unfinished session closed {}", yes_no(report.session_closed));
    println!(
        "rolled back to backup     {}",
        yes_no(report.recovery == Recovery::RolledBack)
    );
    println!("transient files removed   {}", report.transient_removed);
    println!("partial backups removed   {}", report.partial_backups_removed);
    println!("backups pruned            {}", report.pruned.len());
    Ok(())
}
