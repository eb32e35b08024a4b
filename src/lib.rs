//! Chunked image upload service.
//!
//! Accepts whole-file or chunked image uploads, assembles chunks through the
//! object store's compose primitive, and stores small/medium/large/original
//! JPEG renditions. Also ships the matching upload client.

use axum::Router;

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod storage;

use services::upload_service::UploadService;

/// Router with all endpoints and the shared service state attached.
pub fn app(service: UploadService, max_request_bytes: usize) -> Router {
    routes::routes::routes(max_request_bytes).with_state(service)
}
