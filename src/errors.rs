use crate::{models::api::ApiEnvelope, services::upload_service::UploadError};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

/// An HTTP error carrying the status and the message shown to the caller.
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

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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
        (self.status, Json(ApiEnvelope::failure(self.message))).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Config(config) => {
                tracing::error!("storage configuration error: {}", config);
                AppError::internal(config.hint())
            }
            UploadError::BadRequest(msg) => AppError::bad_request(msg),
            UploadError::NotFound(msg) => AppError::not_found(msg),
            UploadError::Conflict(msg) => AppError::new(StatusCode::CONFLICT, msg),
            UploadError::Sqlx(err) => {
                tracing::error!("database error: {}", err);
                AppError::internal("database operation failed")
            }
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), format!("malformed multipart body: {}", err.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ConfigError;

    #[test]
    fn config_errors_map_to_500_with_setup_hint() {
        let err: AppError = UploadError::Config(ConfigError::MissingBucket).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("MEDIA_GCS_BUCKET"));
    }

    #[test]
    fn request_errors_keep_their_message() {
        let err: AppError = UploadError::BadRequest("chunk payload is empty".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "chunk payload is empty");

        let err: AppError = UploadError::Conflict("busy".into()).into();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn variant_failures_list_every_size() {
        let err: AppError = UploadError::AllVariantsFailed(vec![
            "small: boom".into(),
            "large: boom".into(),
        ])
        .into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "all image variants failed: small: boom; large: boom");
    }
}
