use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::repository::RepoError;

#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "authentication required".to_owned()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m),
            AppError::Internal(e) => {
                let detail = format!("{e:#}");
                error!(error = %detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<RepoError> for AppError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::DeviceNotFound(_) => Self::NotFound(e.to_string()),
            RepoError::InvalidThresholds(_) | RepoError::EmptyName | RepoError::InvalidTimer(_) => {
                Self::BadRequest(e.to_string())
            }
            RepoError::GateInAutoMode => Self::Conflict(e.to_string()),
            RepoError::Backend(inner) => Self::Internal(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn status(e: impl Into<AppError>) -> StatusCode {
        e.into().into_response().status()
    }

    #[test]
    fn repository_errors_map_to_statuses() {
        assert_eq!(status(RepoError::DeviceNotFound(Uuid::nil())), StatusCode::NOT_FOUND);
        assert_eq!(status(RepoError::EmptyName), StatusCode::BAD_REQUEST);
        assert_eq!(status(RepoError::GateInAutoMode), StatusCode::CONFLICT);
        assert_eq!(
            status(RepoError::Backend(anyhow::anyhow!("db down"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(AppError::Unauthorized), StatusCode::UNAUTHORIZED);
    }
}
