use crate::services::{
    batch_engine::SyncError, media_library::LibraryError, object_store::StoreError,
    offloader::OffloadError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 412 when the store credentials are incomplete
    pub fn not_configured(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::PRECONDITION_FAILED, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotConfigured => StatusCode::PRECONDITION_FAILED,
            StoreError::FileNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::FileEmpty(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::FileRead { .. } | StoreError::Request(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Network(_) => StatusCode::GATEWAY_TIMEOUT,
            StoreError::Auth { .. } | StoreError::NotFound { .. } | StoreError::Server { .. } => {
                StatusCode::BAD_GATEWAY
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<LibraryError> for AppError {
    fn from(err: LibraryError) -> Self {
        match err {
            LibraryError::NotFound(_) => AppError::not_found(err.to_string()),
            LibraryError::Invalid(_) => AppError::new(StatusCode::BAD_REQUEST, err.to_string()),
            LibraryError::Sqlx(_) | LibraryError::Io(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<OffloadError> for AppError {
    fn from(err: OffloadError) -> Self {
        match err {
            OffloadError::Store(err) => err.into(),
            OffloadError::Library(err) => err.into(),
            OffloadError::UnknownVariant { .. } => AppError::not_found(err.to_string()),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotConfigured => AppError::not_configured(err.to_string()),
            SyncError::Library(err) => err.into(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn store_errors_map_to_gateway_statuses() {
        let auth: AppError = StoreError::Auth {
            code: "AccessDenied".into(),
            message: "denied".into(),
        }
        .into();
        assert_eq!(auth.status, StatusCode::BAD_GATEWAY);

        let empty: AppError = OffloadError::Store(StoreError::FileEmpty(PathBuf::from("/a"))).into();
        assert_eq!(empty.status, StatusCode::UNPROCESSABLE_ENTITY);

        let unconfigured: AppError = SyncError::NotConfigured.into();
        assert_eq!(unconfigured.status, StatusCode::PRECONDITION_FAILED);
    }

    #[test]
    fn missing_record_is_404() {
        let err: AppError = OffloadError::Library(LibraryError::NotFound(3)).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "media record 3 not found");
    }
}
