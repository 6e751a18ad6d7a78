use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use simplebank_core::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Storage(err) => match err {
                StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
                StorageError::Validation(_) => StatusCode::BAD_REQUEST,
                StorageError::UniqueViolation(_) | StorageError::ForeignKeyViolation(_) => StatusCode::FORBIDDEN,
                StorageError::Cancelled | StorageError::DeadlineExceeded | StorageError::LockTimeout => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                success: false,
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_statuses() {
        let status = |e: StorageError| ApiError::from(e).status();
        assert_eq!(status(StorageError::not_found("account", 1)), StatusCode::NOT_FOUND);
        assert_eq!(status(StorageError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(StorageError::UniqueViolation("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(StorageError::ForeignKeyViolation("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status(StorageError::LockTimeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status(StorageError::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status(StorageError::Connection("down".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
