use std::path::Path;

use upkeep_core::cancel::{request_cancel, CancelOutcome};
use upkeep_core::orchestrator::{Environment, Recovery};

use crate::output::print_json;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let env = Environment::new(root, super::load_config(root)?);
    let outcome = request_cancel(&env)?;
    if json {
        return print_json(&outcome);
    }
    match outcome {
        CancelOutcome::Signalled { owner, child } => {
            println!("Cancellation requested for session pid {owner}.");
            if let Some(pid) = child {
                println!("Sent SIGTERM to running command pid {pid}.");
            }
            println!("The session rolls back if it already changed anything.");
        }
        CancelOutcome::Reclaimed { owner, recovery } => {
            println!("Session pid {owner} was already gone; lock and maintenance mode cleared.");
            if recovery == Recovery::RolledBack {
                println!("It had changed the installation; the latest verified backup was restored.");
            }
        }
        CancelOutcome::NoSession => println!("No update session is running."),
    }
    Ok(())
}
