//! The update state machine.
//!
//! [`Orchestrator::run`] drives one update session through the sixteen
//! [`Step`]s in order. Failures before [`Step::MUTATION_BOUNDARY`] abort
//! cleanly; failures at or after it restore the newest verified backup
//! exactly once before the session is finalized.
//!
//! Cancellation is cooperative: an operator writes `cancel.request` (and
//! signals the running child, see [`crate::cancel`]); the marker is checked
//! before every step and turns a killed subprocess into [`UpkeepError::Cancelled`].

mod recover;
mod step;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::backup::{BackupManager, BackupOptions, RestoreContext};
use crate::config::Config;
use crate::error::{Result, UpkeepError};
use crate::health::{self, CheckParams, HealthProbe, HttpProbe};
use crate::lock::LockManager;
use crate::maintenance::MaintenanceController;
use crate::prereq::{self, PrereqFailure};
use crate::process::CommandRunner;
use crate::progress::{Outcome, ProgressReporter, UpdateSession};
use crate::repo::{GitRepository, Repository};
use crate::service::{self, ServiceController};
use crate::{io, paths};

pub use recover::{recover_abandoned, Recovery};
pub use step::Step;

/// Collaborators the orchestrator drives. Tests substitute fakes.
pub struct Environment {
    pub root: PathBuf,
    pub config: Config,
    pub service: Box<dyn ServiceController>,
    pub repo: Box<dyn Repository>,
    pub probe: Box<dyn HealthProbe>,
    /// Base dir is the app dir.
    pub runner: CommandRunner,
}

impl Environment {
    /// Production adapters for the configured backends.
    pub fn new(root: &Path, config: Config) -> Self {
        let app_dir = config.app_dir(root);
        let runner = CommandRunner::new(root, &app_dir);
        Self {
            root: root.to_path_buf(),
            service: service::controller(&config.service, runner.clone(), &app_dir),
            repo: Box::new(GitRepository::new(
                config.repository.remote.clone(),
                runner.clone(),
            )),
            probe: Box::new(HttpProbe),
            runner,
            config,
        }
    }

    pub fn app_dir(&self) -> PathBuf {
        self.config.app_dir(&self.root)
    }

    pub fn backups(&self) -> BackupManager {
        BackupManager::new(&self.root, &self.config)
    }

    pub fn restore_context(&self, restart: bool) -> RestoreContext<'_> {
        RestoreContext {
            service: self.service.as_ref(),
            repo: Some(self.repo.as_ref()),
            runner: &self.runner,
            grace: self.grace(),
            restart,
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.config.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub skip_backup: bool,
    /// Override prerequisite failures, local changes and "already up to date".
    pub force: bool,
    pub no_restart: bool,
    pub update_system: bool,
    /// Defaults to `repository.branch`.
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSummary {
    pub up_to_date: bool,
    pub previous_revision: Option<String>,
    pub revision: Option<String>,
    pub backup_id: Option<String>,
    pub session: UpdateSession,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub index: u32,
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// What a run would do, computed without taking the lock or writing state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlan {
    pub current_revision: String,
    pub target_revision: String,
    pub up_to_date: bool,
    pub local_changes: bool,
    pub prerequisite_failures: Vec<PrereqFailure>,
    /// Pid of a live session that would make the run fail.
    pub lock_holder: Option<u32>,
    pub steps: Vec<PlannedStep>,
}

enum Flow {
    Completed,
    UpToDate,
}

/// Mutable state of one run.
struct Run {
    progress: ProgressReporter,
    mutated: bool,
    maintenance_on: bool,
    previous: Option<String>,
    target: Option<String>,
    backup_id: Option<String>,
}

pub struct Orchestrator {
    env: Environment,
    options: UpdateOptions,
    lock: LockManager,
    maintenance: MaintenanceController,
}

impl Orchestrator {
    pub fn new(env: Environment, options: UpdateOptions) -> Self {
        Self {
            lock: LockManager::new(&env.root),
            maintenance: MaintenanceController::new(&env.root),
            env,
            options,
        }
    }

    fn branch(&self) -> &str {
        self.options
            .branch
            .as_deref()
            .unwrap_or(&self.env.config.repository.branch)
    }

    /// Run one update session. Returns `Ok` on success or when already up to
    /// date; every other outcome is an error whose kind selects the exit code.
    pub fn run(&self) -> Result<UpdateSummary> {
        let span = tracing::info_span!("update", pid = std::process::id());
        let _guard = span.enter();

        // A conflict surfaces here with no side effects on the live session.
        self.lock.acquire()?;
        if let Err(e) = io::remove_if_exists(&paths::cancel_path(&self.env.root)) {
            tracing::warn!(error = %e, "could not clear stale cancel request");
        }

        let progress = match ProgressReporter::begin(&self.env.root, Step::TOTAL) {
            Ok(p) => p,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };
        let mut run = Run {
            progress,
            mutated: false,
            maintenance_on: false,
            previous: None,
            target: None,
            backup_id: None,
        };

        let result = run
            .progress
            .advance(Step::AcquireLock.name())
            .and_then(|_| self.execute(&mut run));
        let result = match result {
            Ok(flow) => self.complete(&mut run, flow),
            Err(e) => Err(self.fail(&mut run, e)),
        };

        for path in [
            paths::cancel_path(&self.env.root),
            paths::child_pid_path(&self.env.root),
        ] {
            let _ = io::remove_if_exists(&path);
        }
        self.release();
        result
    }

    fn release(&self) {
        if let Err(e) = self.lock.release() {
            tracing::error!(error = %e, "failed to release update lock");
        }
    }

    fn execute(&self, run: &mut Run) -> Result<Flow> {
        let cfg = &self.env.config;
        let app_dir = self.env.app_dir();

        self.step(run, Step::CheckPrerequisites, |_| {
            self.check_prerequisites(&app_dir)
        })?;

        let up_to_date = self.step(run, Step::CheckRepositoryState, |run| {
            self.check_repository(run)
        })?;
        if up_to_date {
            return Ok(Flow::UpToDate);
        }

        self.step(run, Step::BaselineHealthCheck, |_| {
            let report = health::check(
                self.env.probe.as_ref(),
                &cfg.health.endpoint,
                &CheckParams::baseline(&cfg.health),
            );
            if !report.passed {
                tracing::warn!(
                    attempts = report.attempts,
                    error = report.last_error().unwrap_or(""),
                    "baseline health check failed; continuing"
                );
            }
            Ok(())
        })?;

        self.step(run, Step::EnableMaintenanceMode, |run| {
            let target = run.target.as_deref().unwrap_or("latest");
            self.maintenance.enable(
                &format!("Updating to {}", short(target)),
                cfg.maintenance.estimated_duration_secs,
            )?;
            run.maintenance_on = true;
            Ok(())
        })?;

        if self.options.skip_backup {
            self.skip(run, Step::CreateBackup)?;
        } else {
            self.step(run, Step::CreateBackup, |run| {
                let options = BackupOptions {
                    source_revision: run.previous.clone(),
                    ..BackupOptions::default()
                };
                let backup = self
                    .env
                    .backups()
                    .create(&options, self.env.service.as_ref())?;
                run.progress.set_backup(&backup.id)?;
                run.backup_id = Some(backup.id);
                Ok(())
            })?;
        }

        if self.options.no_restart {
            self.skip(run, Step::StopServices)?;
        } else {
            self.step(run, Step::StopServices, |_| {
                self.env.service.stop(self.env.grace())
            })?;
        }

        self.step(run, Step::FetchAndApplyChanges, |run| {
            let target = run.target.as_deref().ok_or_else(|| {
                UpkeepError::ValidationFailure("no target revision resolved".into())
            })?;
            self.env.repo.checkout(target)
        })?;

        self.step(run, Step::InstallDependencies, |_| self.install_dependencies())?;

        match cfg
            .migrations
            .as_ref()
            .filter(|m| paths::resolve(&app_dir, &m.script).exists())
        {
            Some(migration) => self.step(run, Step::ApplyDataMigrations, |_| {
                self.env.runner.run(&migration.command).map(|_| ())
            })?,
            None => self.skip(run, Step::ApplyDataMigrations)?,
        }

        self.step(run, Step::ValidateInstallation, |_| {
            self.validate_installation(&app_dir)
        })?;

        if self.options.no_restart {
            self.skip(run, Step::StartServices)?;
        } else {
            self.step(run, Step::StartServices, |_| self.env.service.start())?;
        }

        self.step(run, Step::PostUpdateHealthCheck, |_| self.post_update_health())?;

        self.step(run, Step::DisableMaintenanceMode, |run| {
            self.maintenance.disable()?;
            run.maintenance_on = false;
            Ok(())
        })?;

        self.step(run, Step::PruneOldBackups, |_| {
            // Never fails the session.
            match self.env.backups().prune(cfg.backup.retention) {
                Ok(pruned) if !pruned.is_empty() => {
                    tracing::info!(count = pruned.len(), "pruned old backups")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "backup pruning failed"),
            }
            Ok(())
        })?;

        self.step(run, Step::Finalize, |_| Ok(()))?;
        Ok(Flow::Completed)
    }

    fn cancel_requested(&self) -> bool {
        paths::cancel_path(&self.env.root).exists()
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel_requested() {
            tracing::warn!("cancellation requested");
            return Err(UpkeepError::Cancelled);
        }
        Ok(())
    }

    fn step<T>(
        &self,
        run: &mut Run,
        step: Step,
        f: impl FnOnce(&mut Run) -> Result<T>,
    ) -> Result<T> {
        self.checkpoint()?;
        if step.is_mutating() {
            run.mutated = true;
        }
        run.progress.advance(step.name())?;
        let span = tracing::info_span!("step", name = step.name(), index = step.index());
        let _guard = span.enter();
        f(run).map_err(|e| {
            if self.cancel_requested() {
                UpkeepError::Cancelled
            } else {
                e.in_step(step.name())
            }
        })
    }

    fn skip(&self, run: &mut Run, step: Step) -> Result<()> {
        self.checkpoint()?;
        if step.is_mutating() {
            run.mutated = true;
        }
        tracing::info!(step = step.name(), "skipped");
        run.progress.skip(step.name())
    }

    fn check_prerequisites(&self, app_dir: &Path) -> Result<()> {
        let mut problems: Vec<String> = prereq::check(&self.env.config.prerequisites, app_dir)
            .into_iter()
            .map(|f| format!("{}: {}", f.check, f.message))
            .collect();
        problems.extend(
            self.env
                .config
                .validate()
                .into_iter()
                .filter(|w| w.level == crate::config::WarnLevel::Error)
                .map(|w| format!("config: {}", w.message)),
        );
        if problems.is_empty() {
            return Ok(());
        }
        if self.options.force {
            for p in &problems {
                tracing::warn!(problem = %p, "prerequisite failed; overridden by --force");
            }
            return Ok(());
        }
        Err(UpkeepError::ValidationFailure(problems.join("; ")))
    }

    /// Returns true when there is nothing to do.
    fn check_repository(&self, run: &mut Run) -> Result<bool> {
        let repo = self.env.repo.as_ref();
        let invalid = |e: UpkeepError| UpkeepError::ValidationFailure(e.to_string());

        if repo.has_local_changes().map_err(invalid)? {
            if !self.options.force {
                return Err(UpkeepError::ValidationFailure(
                    "working tree has uncommitted changes (use --force to override)".into(),
                ));
            }
            tracing::warn!("discarding uncommitted changes (--force)");
        }

        let branch = self.branch();
        repo.fetch(branch).map_err(invalid)?;
        let current = repo.head().map_err(invalid)?;
        let target = repo.remote_head(branch).map_err(invalid)?;
        tracing::info!(current = %short(&current), target = %short(&target), branch, "revisions");
        run.previous = Some(current.clone());
        run.target = Some(target.clone());

        if current == target {
            if !self.options.force {
                tracing::info!("already up to date");
                return Ok(true);
            }
            tracing::info!("no new revision; continuing (--force)");
        }
        Ok(false)
    }

    fn install_dependencies(&self) -> Result<()> {
        let cfg = &self.env.config;
        if self.options.update_system {
            match &cfg.system_update {
                Some(cmd) => {
                    tracing::info!(command = %cmd.display(), "updating system packages");
                    self.env.runner.run(cmd)?;
                }
                None => tracing::warn!("--update-system given but system_update is not configured"),
            }
        }
        for layer in &cfg.layers {
            let span = tracing::info_span!("layer", name = %layer.name);
            let _guard = span.enter();
            for cmd in layer.commands() {
                tracing::info!(command = %cmd.display(), "running");
                self.env.runner.run(&cmd)?;
            }
        }
        Ok(())
    }

    fn validate_installation(&self, app_dir: &Path) -> Result<()> {
        let missing: Vec<String> = self
            .env
            .config
            .layers
            .iter()
            .flat_map(|l| &l.artifacts)
            .filter(|a| !paths::resolve(app_dir, a).exists())
            .map(|a| a.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(UpkeepError::OperationFailure {
                step: Step::ValidateInstallation.name().into(),
                message: format!("missing artifacts: {}", missing.join(", ")),
            });
        }
        if let Some(cmd) = &self.env.config.entry_check {
            self.env.runner.run(cmd)?;
        }
        Ok(())
    }

    fn post_update_health(&self) -> Result<()> {
        let cfg = &self.env.config.health;
        let report = health::check(
            self.env.probe.as_ref(),
            &cfg.endpoint,
            &CheckParams::post_update(cfg),
        );
        if report.passed {
            tracing::info!(attempts = report.attempts, latency_ms = report.latency_ms, "service healthy");
            return Ok(());
        }
        Err(UpkeepError::HealthCheckFailure {
            attempts: report.attempts,
            message: report.last_error().unwrap_or("unhealthy").to_string(),
        })
    }

    fn complete(&self, run: &mut Run, flow: Flow) -> Result<UpdateSummary> {
        let up_to_date = matches!(flow, Flow::UpToDate);
        if up_to_date {
            run.progress.note("Already up to date")?;
        }
        run.progress.finalize(Outcome::Success, None)?;
        tracing::info!(up_to_date, "update session finished");
        Ok(UpdateSummary {
            up_to_date,
            previous_revision: run.previous.clone(),
            revision: run.target.clone(),
            backup_id: run.backup_id.clone(),
            session: run.progress.session().clone(),
        })
    }

    /// Resolve a failed run and return the error to surface.
    fn fail(&self, run: &mut Run, err: UpkeepError) -> UpkeepError {
        let outcome = if matches!(err, UpkeepError::Cancelled) {
            Outcome::Cancelled
        } else {
            Outcome::Failed
        };
        tracing::error!(
            error = %err,
            step = %run.progress.session().current_step,
            "update failed"
        );

        if !run.mutated {
            if run.maintenance_on {
                self.disable_maintenance();
            }
            self.finalize(run, outcome, &err);
            return err;
        }

        let restart = !self.options.no_restart;
        match recover::emergency_rollback(&self.env, &mut run.progress, restart) {
            Ok(()) => {
                self.disable_maintenance();
                self.finalize(run, outcome, &err);
                err
            }
            Err(rollback_err) => {
                let reason = match rollback_err {
                    UpkeepError::RollbackFailure(reason) => reason,
                    other => other.to_string(),
                };
                let fatal = UpkeepError::RollbackFailure(format!("{reason} (after: {err})"));
                tracing::error!(error = %fatal, "rollback failed; maintenance mode left enabled");
                self.finalize(run, Outcome::FailedUnrecoverable, &fatal);
                fatal
            }
        }
    }

    fn disable_maintenance(&self) {
        if let Err(e) = self.maintenance.disable() {
            tracing::error!(error = %e, "failed to disable maintenance mode");
        }
    }

    fn finalize(&self, run: &mut Run, outcome: Outcome, err: &UpkeepError) {
        if let Err(e) = run.progress.finalize(outcome, Some(err)) {
            tracing::error!(error = %e, "failed to write final progress record");
        }
    }

    /// Dry run: steps 1 to 3 evaluated read-only, then the step list annotated
    /// with what would be skipped.
    pub fn plan(&self) -> Result<UpdatePlan> {
        let cfg = &self.env.config;
        let app_dir = self.env.app_dir();
        let lock_holder = self
            .lock
            .status()?
            .filter(|s| s.alive)
            .map(|s| s.record.owner_pid);
        let prerequisite_failures = prereq::check(&cfg.prerequisites, &app_dir);

        let repo = self.env.repo.as_ref();
        let local_changes = repo.has_local_changes()?;
        let branch = self.branch();
        repo.fetch(branch)?;
        let current_revision = repo.head()?;
        let target_revision = repo.remote_head(branch)?;
        let up_to_date = current_revision == target_revision && !self.options.force;

        let has_migration = cfg
            .migrations
            .as_ref()
            .is_some_and(|m| paths::resolve(&app_dir, &m.script).exists());

        let steps = Step::ALL
            .iter()
            .map(|&step| {
                let skip_reason = match step {
                    s if up_to_date && s > Step::CheckRepositoryState && s != Step::Finalize => {
                        Some("already up to date")
                    }
                    Step::CreateBackup if self.options.skip_backup => Some("--skip-backup"),
                    Step::StopServices | Step::StartServices if self.options.no_restart => {
                        Some("--no-restart")
                    }
                    Step::ApplyDataMigrations if !has_migration => Some("no migration present"),
                    _ => None,
                };
                PlannedStep {
                    index: step.index(),
                    name: step.name(),
                    skip_reason: skip_reason.map(str::to_string),
                }
            })
            .collect();

        Ok(UpdatePlan {
            current_revision,
            target_revision,
            up_to_date,
            local_changes,
            prerequisite_failures,
            lock_holder,
            steps,
        })
    }
}

fn short(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}
