//! Route table of the upload service.
//!
//! - `POST /api/v1/upload-image`: whole-file or (`?chunked=1`) chunk upload
//! - `GET  /api/v1/upload-image/sessions/{id}`: chunked session status
//! - `GET  /api/v1/images/{id}`: stored image and its variants
//! - `GET  /media/{*key}`: stored object bytes
//! - `GET  /healthz`, `GET /readyz`: health checks

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        media_handlers::get_media,
        upload_handlers::{get_image, get_session, upload_image},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. The carried state (`UploadService`) is shared by all
/// handlers; request bodies are capped at `max_request_bytes`.
pub fn routes(max_request_bytes: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/api/v1/upload-image",
            post(upload_image).layer(DefaultBodyLimit::max(max_request_bytes)),
        )
        .route("/api/v1/upload-image/sessions/{id}", get(get_session))
        .route("/api/v1/images/{id}", get(get_image))
        .route("/media/{*key}", get(get_media))
}
