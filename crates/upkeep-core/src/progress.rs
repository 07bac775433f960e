//! Durable, pollable record of an update session.
//!
//! The record is rewritten atomically after every step, so any number of
//! status pollers can read `.upkeep/progress.json` while the single
//! orchestrator writes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Result, UpkeepError};
use crate::{io, paths};

/// Fixed per-step duration used for the remaining-time estimate.
pub const STEP_ESTIMATE_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Failed,
    /// Failed and the automatic rollback also failed.
    FailedUnrecoverable,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSession {
    #[serde(default = "default_version")]
    pub version: u32,
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub owner_pid: u32,
    pub is_updating: bool,
    pub step: u32,
    pub total_steps: u32,
    pub percentage: u32,
    pub current_step: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds.
    pub estimated_time_remaining: u64,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackStatus>,
    #[serde(default)]
    pub rollback_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl UpdateSession {
    fn new(total_steps: u32) -> Self {
        let now = Utc::now();
        Self {
            version: 1,
            id: Uuid::new_v4(),
            started_at: now,
            owner_pid: std::process::id(),
            is_updating: true,
            step: 0,
            total_steps,
            percentage: 0,
            current_step: "Starting".to_string(),
            timestamp: now,
            estimated_time_remaining: u64::from(total_steps) * STEP_ESTIMATE_SECS,
            outcome: Outcome::Pending,
            success: None,
            error: None,
            skipped_steps: Vec::new(),
            rollback: None,
            rollback_attempts: 0,
            backup_id: None,
        }
    }

    /// The record reported when no session has ever run.
    pub fn idle() -> Self {
        let mut session = Self::new(0);
        session.id = Uuid::nil();
        session.owner_pid = 0;
        session.is_updating = false;
        session.current_step = "Idle".to_string();
        session.estimated_time_remaining = 0;
        session
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != Outcome::Pending
    }
}

/// Single writer of the progress record.
#[derive(Debug)]
pub struct ProgressReporter {
    root: PathBuf,
    session: UpdateSession,
}

impl ProgressReporter {
    /// Start a fresh session and persist its initial record.
    pub fn begin(root: &Path, total_steps: u32) -> Result<Self> {
        let reporter = Self {
            root: root.to_path_buf(),
            session: UpdateSession::new(total_steps),
        };
        reporter.persist()?;
        Ok(reporter)
    }

    /// Take over the record of an existing session (cancel of a dead owner).
    pub fn resume(root: &Path) -> Result<Option<Self>> {
        Ok(Self::read(root)?.map(|session| Self {
            root: root.to_path_buf(),
            session,
        }))
    }

    pub fn read(root: &Path) -> Result<Option<UpdateSession>> {
        io::read_json(&paths::progress_path(root))
    }

    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    pub fn advance(&mut self, step_name: &str) -> Result<()> {
        let s = &mut self.session;
        s.step = (s.step + 1).min(s.total_steps);
        let pct = if s.total_steps == 0 {
            100
        } else {
            s.step * 100 / s.total_steps
        };
        s.percentage = s.percentage.max(pct);
        s.current_step = step_name.to_string();
        s.estimated_time_remaining =
            u64::from(s.total_steps - s.step) * STEP_ESTIMATE_SECS;
        s.timestamp = Utc::now();
        tracing::info!(
            step = s.step,
            total = s.total_steps,
            percentage = s.percentage,
            "{step_name}"
        );
        self.persist()
    }

    /// Advance past a step that was not executed.
    pub fn skip(&mut self, step_name: &str) -> Result<()> {
        self.session.skipped_steps.push(step_name.to_string());
        self.advance(step_name)
    }

    /// Change the displayed label without moving the percentage.
    pub fn note(&mut self, label: &str) -> Result<()> {
        self.session.current_step = label.to_string();
        self.session.timestamp = Utc::now();
        self.persist()
    }

    pub fn set_backup(&mut self, id: &str) -> Result<()> {
        self.session.backup_id = Some(id.to_string());
        self.persist()
    }

    pub fn record_rollback(&mut self, status: RollbackStatus) -> Result<()> {
        if status == RollbackStatus::InProgress {
            self.session.rollback_attempts += 1;
        }
        self.session.rollback = Some(status);
        self.session.timestamp = Utc::now();
        self.persist()
    }

    /// Write the terminal record. Success clears transient artifacts; failure
    /// keeps a postmortem copy in `last-failure.json`.
    pub fn finalize(&mut self, outcome: Outcome, error: Option<&UpkeepError>) -> Result<()> {
        let s = &mut self.session;
        s.is_updating = false;
        s.outcome = outcome;
        s.success = Some(outcome == Outcome::Success);
        s.error = error.map(|e| e.to_string());
        s.timestamp = Utc::now();
        if outcome == Outcome::Success {
            s.percentage = 100;
            s.estimated_time_remaining = 0;
        }
        self.persist()?;

        if outcome == Outcome::Success {
            io::remove_if_exists(&paths::cancel_path(&self.root))?;
            io::remove_if_exists(&paths::child_pid_path(&self.root))?;
        } else {
            io::write_json(&paths::last_failure_path(&self.root), &self.session)?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        io::write_json(&paths::progress_path(&self.root), &self.session)
    }
}
