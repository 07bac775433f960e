//! The restore procedure written alongside every backup.
//!
//! `restore-plan.json` is the authoritative, typed form and is what
//! [`RestorePlan::execute`] runs. `restore.sh` is rendered from the same plan
//! so an operator can recover by hand when this binary is unavailable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::archive::{self, Exclusions};
use super::datastore::{self, RestoreMethod};
use crate::error::Result;
use crate::process::{shell_quote, CommandRunner, CommandSpec};
use crate::repo::Repository;
use crate::service::{ServiceAction, ServiceController};

pub const PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePlan {
    pub version: u32,
    pub backup_id: String,
    pub app_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_revision: Option<String>,
    /// File name of the archive inside the backup dir.
    pub archive: String,
    /// Entries the archive omits; kept in place on restore.
    pub exclusions: Exclusions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabasePlan>,
    #[serde(default)]
    pub dependency_commands: Vec<CommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabasePlan {
    /// Absolute path of the live datastore file.
    pub target: PathBuf,
    pub raw: String,
    pub export: String,
}

/// Collaborators a restore drives.
pub struct RestoreContext<'a> {
    pub service: &'a dyn ServiceController,
    /// `None` when the app dir is not under version control.
    pub repo: Option<&'a dyn Repository>,
    /// Base dir must be the app dir.
    pub runner: &'a CommandRunner,
    pub grace: Duration,
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub backup_id: String,
    pub revision: Option<String>,
    pub datastore: Option<RestoreMethod>,
    pub commands_run: usize,
}

impl RestorePlan {
    pub fn execute(&self, backup_dir: &Path, ctx: &RestoreContext<'_>) -> Result<RestoreReport> {
        if ctx.restart {
            tracing::info!(backup = %self.backup_id, "restore: stopping service");
            ctx.service
                .stop(ctx.grace)
                .map_err(|e| e.in_step("RestoreStopService"))?;
        }

        let mut revision = None;
        if let (Some(rev), Some(repo)) = (&self.source_revision, ctx.repo) {
            tracing::info!(revision = %rev, "restore: resetting working tree");
            repo.checkout(rev)
                .map_err(|e| e.in_step("RestoreRevision"))?;
            revision = Some(rev.clone());
        }

        tracing::info!("restore: extracting files");
        archive::clear(&self.app_dir, &self.exclusions)
            .and_then(|_| archive::extract(&backup_dir.join(&self.archive), &self.app_dir))
            .map_err(|e| e.in_step("RestoreFiles"))?;

        let mut method = None;
        if let Some(db) = &self.database {
            let m = datastore::restore(
                &db.target,
                &backup_dir.join(&db.raw),
                &backup_dir.join(&db.export),
            )
            .map_err(|e| e.in_step("RestoreDatastore"))?;
            tracing::info!(method = ?m, "restore: datastore restored");
            method = Some(m);
        }

        for cmd in &self.dependency_commands {
            tracing::info!(command = %cmd.display(), "restore: reinstalling dependencies");
            ctx.runner
                .run(cmd)
                .map_err(|e| e.in_step("RestoreDependencies"))?;
        }

        if ctx.restart {
            tracing::info!("restore: starting service");
            ctx.service
                .start()
                .map_err(|e| e.in_step("RestoreStartService"))?;
        }

        Ok(RestoreReport {
            backup_id: self.backup_id.clone(),
            revision,
            datastore: method,
            commands_run: self.dependency_commands.len(),
        })
    }

    /// POSIX sh rendering of the plan. Run from anywhere; paths resolve
    /// against the script's own directory.
    pub fn render_script(&self, service: &dyn ServiceController) -> String {
        let app_dir = shell_quote(&self.app_dir.display().to_string());
        let mut s = String::new();
        s.push_str("#!/bin/sh\n");
        s.push_str(&format!("# Restore procedure for {}.\n", self.backup_id));
        s.push_str("set -eu\n\n");
        s.push_str("BACKUP_DIR=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\n");
        s.push_str(&format!("APP_DIR={app_dir}\n\n"));

        s.push_str("echo '==> stopping service'\n");
        s.push_str(&service.script(ServiceAction::Stop));
        s.push_str("\n\n");

        if let Some(rev) = &self.source_revision {
            s.push_str("if [ -d \"$APP_DIR/.git\" ]; then\n");
            s.push_str("  echo '==> resetting working tree'\n");
            s.push_str(&format!(
                "  git -C \"$APP_DIR\" reset --hard {}\n",
                shell_quote(rev)
            ));
            s.push_str("fi\n\n");
        }

        s.push_str("echo '==> extracting files'\n");
        s.push_str(&format!(
            "tar -xzf \"$BACKUP_DIR\"/{} -C \"$APP_DIR\"\n\n",
            shell_quote(&self.archive)
        ));

        if let Some(db) = &self.database {
            let target = shell_quote(&db.target.display().to_string());
            s.push_str("echo '==> restoring datastore'\n");
            s.push_str(&format!(
                "rm -f {target}-wal {target}-shm {target}-journal\n"
            ));
            s.push_str(&format!(
                "if [ -f \"$BACKUP_DIR\"/{raw} ]; then\n  cp \"$BACKUP_DIR\"/{raw} {target}\n\
                 else\n  rm -f {target}\n  sqlite3 {target} < \"$BACKUP_DIR\"/{export}\nfi\n\n",
                raw = shell_quote(&db.raw),
                export = shell_quote(&db.export),
            ));
        }

        if !self.dependency_commands.is_empty() {
            s.push_str("echo '==> reinstalling dependencies'\n");
            for cmd in &self.dependency_commands {
                s.push_str(&format!("({} && {})\n", cd_line(cmd), command_line(cmd)));
            }
            s.push('\n');
        }

        s.push_str("echo '==> starting service'\n");
        s.push_str(&service.script(ServiceAction::Start));
        s.push_str("\necho '==> restore complete'\n");
        s
    }
}

fn cd_line(cmd: &CommandSpec) -> String {
    match &cmd.cwd {
        Some(dir) if dir.is_absolute() => format!("cd {}", shell_quote(&dir.display().to_string())),
        Some(dir) => format!("cd \"$APP_DIR\"/{}", shell_quote(&dir.display().to_string())),
        None => "cd \"$APP_DIR\"".to_string(),
    }
}

fn command_line(cmd: &CommandSpec) -> String {
    if cmd.env.is_empty() {
        return cmd.display();
    }
    let vars: Vec<String> = cmd
        .env
        .iter()
        .map(|(k, v)| shell_quote(&format!("{k}={v}")))
        .collect();
    format!("env {} {}", vars.join(" "), cmd.display())
}
