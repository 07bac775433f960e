use std::path::Path;

use upkeep_core::backup::{BackupManager, BackupOptions};
use upkeep_core::orchestrator::Environment;

use crate::output::{format_size, print_json, print_table, short_rev};

/// `--backup-only`: take one backup under the update lock and exit.
pub fn create(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let env = Environment::new(root, config);

    let backup = super::exclusive(root, || {
        let options = BackupOptions {
            source_revision: env.repo.head().ok(),
            ..BackupOptions::default()
        };
        Ok(env.backups().create(&options, env.service.as_ref())?)
    })?;

    if json {
        return print_json(&backup);
    }
    println!("Created {}", backup.id);
    println!("  location  {}", backup.location.display());
    println!("  size      {}", format_size(backup.size_bytes));
    println!("  revision  {}", short_rev(backup.source_revision.as_deref()));
    println!(
        "  database  {}",
        if backup.includes_database { "yes" } else { "no" }
    );
    Ok(())
}

/// `--list-backups`
pub fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root)?;
    let backups = BackupManager::new(root, &config).list()?;

    if json {
        return print_json(&backups);
    }
    if backups.is_empty() {
        println!("No backups.");
        return Ok(());
    }
    let rows = backups
        .iter()
        .map(|b| {
            vec![
                b.id.clone(),
                b.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                format_size(b.size_bytes),
                short_rev(b.source_revision.as_deref()),
                if b.includes_database { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "CREATED", "SIZE", "REVISION", "DB"], rows);
    Ok(())
}
