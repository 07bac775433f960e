use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use upkeep_core::error::{ErrorKind, UpkeepError};

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

fn status_for(err: &UpkeepError) -> StatusCode {
    match err {
        UpkeepError::BackupNotFound(_) => StatusCode::NOT_FOUND,
        UpkeepError::BackupCorrupt { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        other => match other.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Concurrency => StatusCode::CONFLICT,
            ErrorKind::Operation
            | ErrorKind::HealthCheck
            | ErrorKind::Rollback
            | ErrorKind::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<UpkeepError>()
            .map_or(StatusCode::INTERNAL_SERVER_ERROR, status_for);
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", self.0), "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_not_found_maps_to_404() {
        let err = AppError(UpkeepError::BackupNotFound("backup-20260101-000000-000".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_backup_id_maps_to_400() {
        let err = AppError(UpkeepError::InvalidBackupId("../etc".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn validation_failure_maps_to_400() {
        let err = AppError(UpkeepError::ValidationFailure("dirty tree".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn concurrency_conflict_maps_to_409() {
        let err = AppError(UpkeepError::ConcurrencyConflict { pid: 42 }.into());
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn corrupt_backup_maps_to_422() {
        let err = AppError(
            UpkeepError::BackupCorrupt {
                id: "backup-20260101-000000-000".into(),
                reason: "digest mismatch".into(),
            }
            .into(),
        );
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn io_error_maps_to_500() {
        let err = AppError(UpkeepError::Io(std::io::Error::other("disk")).into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn failed_rollback_maps_to_500() {
        let err = AppError(UpkeepError::RollbackFailure("no verified backup available".into()).into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn plain_anyhow_maps_to_500() {
        let err = AppError(anyhow::anyhow!("boom"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
