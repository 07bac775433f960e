mod cmd;
mod output;
mod root;

use clap::{ArgGroup, Parser, ValueEnum};
use std::path::PathBuf;
use upkeep_core::UpkeepError;

#[derive(Parser)]
#[command(
    name = "upkeep",
    about = "Update, back up and roll back a managed service",
    version,
    group(ArgGroup::new("mode").multiple(false))
)]
struct Cli {
    /// Project root (default: auto-detect from .upkeep/ or .git/)
    #[arg(long, global = true, env = "UPKEEP_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Debug-level logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    // -- update modifiers (only without a mode) ------------------------------
    /// Update without taking a fresh backup (rollback uses the latest verified one)
    #[arg(long, conflicts_with = "mode")]
    skip_backup: bool,

    /// Override prerequisite failures, local changes and "already up to date"
    #[arg(long, conflicts_with = "mode")]
    force: bool,

    /// Leave the service running while files change
    #[arg(long, conflicts_with = "mode")]
    no_restart: bool,

    /// Run the configured system package update during dependency install
    #[arg(long, conflicts_with = "mode")]
    update_system: bool,

    /// Branch to update to (default: repository.branch)
    #[arg(long, conflicts_with = "mode")]
    branch: Option<String>,

    /// Show what an update would do without changing anything
    #[arg(long, conflicts_with = "mode")]
    dry_run: bool,

    // -- modes --------------------------------------------------------------
    /// Create a backup and exit
    #[arg(long, group = "mode")]
    backup_only: bool,

    /// Restore a backup (latest verified when ID is omitted)
    #[arg(long, group = "mode", value_name = "ID", num_args = 0..=1)]
    restore: Option<Option<String>>,

    /// Probe the health endpoint and exit
    #[arg(long, group = "mode")]
    health_check: bool,

    /// Clear leftovers of a crashed session
    #[arg(long, group = "mode")]
    cleanup: bool,

    /// Show the current or last session
    #[arg(long, group = "mode")]
    status: bool,

    /// Cancel the running session
    #[arg(long, group = "mode")]
    cancel: bool,

    /// List backups, newest first
    #[arg(long, group = "mode")]
    list_backups: bool,

    /// Turn maintenance mode on or off
    #[arg(long, group = "mode", value_name = "STATE")]
    maintenance: Option<Toggle>,

    /// Reason shown while maintenance mode is on
    #[arg(long, requires = "maintenance", default_value = "Scheduled maintenance")]
    reason: String,

    /// Serve the admin HTTP API
    #[arg(long, group = "mode")]
    serve: bool,

    /// Port for --serve
    #[arg(long, requires = "serve", default_value = "8787")]
    port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Cli {
    /// Modes that do real work log at info; read-only queries stay quiet.
    fn default_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.status || self.list_backups || self.cancel || self.maintenance.is_some() {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        }
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.default_level().into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let json = cli.json;

    let result = if cli.backup_only {
        cmd::backup::create(&root, json)
    } else if let Some(id) = cli.restore {
        cmd::restore::run(&root, id.as_deref(), json)
    } else if cli.health_check {
        cmd::health::run(&root, json)
    } else if cli.cleanup {
        cmd::cleanup::run(&root, json)
    } else if cli.status {
        cmd::status::run(&root, json)
    } else if cli.cancel {
        cmd::cancel::run(&root, json)
    } else if cli.list_backups {
        cmd::backup::list(&root, json)
    } else if let Some(toggle) = cli.maintenance {
        cmd::maintenance::run(&root, toggle == Toggle::On, &cli.reason, json)
    } else if cli.serve {
        cmd::serve::run(&root, cli.port)
    } else {
        let args = cmd::update::UpdateArgs {
            skip_backup: cli.skip_backup,
            force: cli.force,
            no_restart: cli.no_restart,
            update_system: cli.update_system,
            branch: cli.branch,
            dry_run: cli.dry_run,
        };
        cmd::update::run(&root, args, json)
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        let code = e
            .downcast_ref::<UpkeepError>()
            .map_or(1, UpkeepError::exit_code);
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_id_is_optional() {
        let cli = Cli::try_parse_from(["upkeep", "--restore"]).unwrap();
        assert_eq!(cli.restore, Some(None));
        let cli = Cli::try_parse_from(["upkeep", "--restore", "backup-20260101-000000-000"]).unwrap();
        assert_eq!(
            cli.restore,
            Some(Some("backup-20260101-000000-000".to_string()))
        );
    }

    #[test]
    fn modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["upkeep", "--status", "--cleanup"]).is_err());
        assert!(Cli::try_parse_from(["upkeep", "--backup-only", "--serve"]).is_err());
    }

    #[test]
    fn update_modifiers_parse_without_a_mode() {
        let cli =
            Cli::try_parse_from(["upkeep", "--force", "--skip-backup", "--branch", "release"])
                .unwrap();
        assert!(cli.force && cli.skip_backup);
        assert_eq!(cli.branch.as_deref(), Some("release"));
        assert_eq!(cli.default_level(), tracing::Level::INFO);
    }

    #[test]
    fn update_modifiers_are_rejected_with_a_mode() {
        for args in [
            ["upkeep", "--status", "--dry-run"],
            ["upkeep", "--cancel", "--force"],
            ["upkeep", "--list-backups", "--skip-backup"],
            ["upkeep", "--cleanup", "--no-restart"],
            ["upkeep", "--backup-only", "--update-system"],
        ] {
            assert!(Cli::try_parse_from(args).is_err(), "{args:?}");
        }
        assert!(Cli::try_parse_from(["upkeep", "--serve", "--branch", "main"]).is_err());
        assert!(Cli::try_parse_from(["upkeep", "--dry-run", "--force"]).is_ok());
    }

    #[test]
    fn reason_requires_maintenance() {
        assert!(Cli::try_parse_from(["upkeep", "--reason", "x"]).is_err());
        let cli = Cli::try_parse_from(["upkeep", "--maintenance", "on", "--reason", "db"]).unwrap();
        assert_eq!(cli.maintenance, Some(Toggle::On));
        assert_eq!(cli.reason, "db");
    }
}
