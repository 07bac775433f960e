use std::path::Path;

use upkeep_core::orchestrator::{Environment, Orchestrator, UpdateOptions, UpdatePlan};

use crate::output::{print_json, print_table, short_rev};

pub struct UpdateArgs {
    pub skip_backup: bool,
    pub force: bool,
    pub no_restart: bool,
    pub update_system: bool,
    pub branch: Option<String>,
    pub dry_run: bool,
}

/// `upkeep` with no mode flag: run one update session, or plan it under `--dry-run`.
pub fn run(root: &Path, args: UpdateArgs, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let options = UpdateOptions {
        skip_backup: args.skip_backup,
        force: args.force,
        no_restart: args.no_restart,
        update_system: args.update_system,
        branch: args.branch,
    };
    let orchestrator = Orchestrator::new(Environment::new(root, config), options);

    if args.dry_run {
        let plan = orchestrator.plan()?;
        return if json {
            print_json(&plan)
        } else {
            print_plan(&plan);
            Ok(())
        };
    }

    let summary = orchestrator.run()?;
    if json {
        return print_json(&summary);
    }
    if summary.up_to_date {
        println!(
            "Already up to date at {}.",
            short_rev(summary.revision.as_deref())
        );
        return Ok(());
    }
    println!(
        "Updated {} -> {}.",
        short_rev(summary.previous_revision.as_deref()),
        short_rev(summary.revision.as_deref())
    );
    match &summary.backup_id {
        Some(id) => println!("Backup: {id}"),
        None => println!("Backup: skipped"),
    }
    if !summary.session.skipped_steps.is_empty() {
        println!("Skipped: {}", summary.session.skipped_steps.join(", "));
    }
    Ok(())
}

fn print_plan(plan: &UpdatePlan) {
    println!(
        "current {}  target {}{}",
        short_rev(Some(&plan.current_revision)),
        short_rev(Some(&plan.target_revision)),
        if plan.up_to_date { "  (up to date)" } else { "" }
    );
    if plan.local_changes {
        println!("warning: working tree has local changes (update needs --force)");
    }
    if let Some(pid) = plan.lock_holder {
        println!("warning: session pid {pid} holds the update lock");
    }
    for failure in &plan.prerequisite_failures {
        println!("prerequisite {}: {}", failure.check, failure.message);
    }
    println!();

    let rows = plan
        .steps
        .iter()
        .map(|s| {
            vec![
                s.index.to_string(),
                s.name.to_string(),
                s.skip_reason
                    .as_deref()
                    .map(|r| format!("skip ({r})"))
                    .unwrap_or_else(|| "run".to_string()),
            ]
        })
        .collect();
    print_table(&["#", "STEP", "ACTION"], rows);
}
