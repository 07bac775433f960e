use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpkeepError {
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("{step} failed: {message}")]
    OperationFailure { step: String, message: String },

    #[error("health check failed after {attempts} attempt(s): {message}")]
    HealthCheckFailure { attempts: u32, message: String },

    #[error("rollback failed, manual intervention required: {0}")]
    RollbackFailure(String),

    #[error("another update session is active (pid {pid})")]
    ConcurrencyConflict { pid: u32 },

    #[error("cancelled by operator")]
    Cancelled,

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("invalid backup id '{0}'")]
    InvalidBackupId(String),

    #[error("backup {id} failed integrity verification: {reason}")]
    BackupCorrupt { id: String, reason: String },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("'{program}' exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Failure taxonomy every error collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Operation,
    HealthCheck,
    Rollback,
    Concurrency,
    Cancelled,
}

impl UpkeepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpkeepError::ValidationFailure(_)
            | UpkeepError::InvalidBackupId(_)
            | UpkeepError::Config(_) => ErrorKind::Validation,
            UpkeepError::HealthCheckFailure { .. } => ErrorKind::HealthCheck,
            UpkeepError::RollbackFailure(_) => ErrorKind::Rollback,
            UpkeepError::ConcurrencyConflict { .. } => ErrorKind::Concurrency,
            UpkeepError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Operation,
        }
    }

    /// Re-tag a plumbing error as an `OperationFailure` of `step`.
    /// Errors that already belong to the taxonomy pass through untouched.
    pub fn in_step(self, step: &str) -> Self {
        match self {
            UpkeepError::ValidationFailure(_)
            | UpkeepError::OperationFailure { .. }
            | UpkeepError::HealthCheckFailure { .. }
            | UpkeepError::RollbackFailure(_)
            | UpkeepError::ConcurrencyConflict { .. }
            | UpkeepError::Cancelled => self,
            other => UpkeepError::OperationFailure {
                step: step.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Operation | ErrorKind::HealthCheck => 1,
            ErrorKind::Validation => 2,
            ErrorKind::Concurrency => 3,
            ErrorKind::Rollback => 4,
            ErrorKind::Cancelled => 5,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpkeepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_step_wraps_plumbing_errors() {
        let err = UpkeepError::Io(std::io::Error::other("disk gone")).in_step("StopServices");
        match err {
            UpkeepError::OperationFailure { step, message } => {
                assert_eq!(step, "StopServices");
                assert!(message.contains("disk gone"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn in_step_keeps_taxonomy_errors() {
        let err = UpkeepError::Cancelled.in_step("FetchAndApplyChanges");
        assert!(matches!(err, UpkeepError::Cancelled));
        let err = UpkeepError::HealthCheckFailure {
            attempts: 3,
            message: "503".into(),
        }
        .in_step("PostUpdateHealthCheck");
        assert_eq!(err.kind(), ErrorKind::HealthCheck);
    }

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        assert_eq!(UpkeepError::ConcurrencyConflict { pid: 1 }.exit_code(), 3);
        assert_eq!(UpkeepError::RollbackFailure("x".into()).exit_code(), 4);
        assert_eq!(UpkeepError::ValidationFailure("x".into()).exit_code(), 2);
        assert_eq!(UpkeepError::Cancelled.exit_code(), 5);
    }
}
