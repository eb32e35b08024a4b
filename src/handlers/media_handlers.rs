//! Serves stored objects for backends without their own public host.

use crate::{
    errors::AppError,
    services::upload_service::UploadService,
    storage::{StoreError, content_type_for_key},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};

/// `GET /media/{*key}`
pub async fn get_media(
    State(service): State<UploadService>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let data = service.store().download(&key).await.map_err(|err| match err {
        StoreError::NotFound(_) | StoreError::InvalidKey(_) => {
            AppError::not_found(format!("media `{}` not found", key))
        }
        other => AppError::from(crate::services::upload_service::UploadError::from(other)),
    })?;

    let length = data.len();
    let mut response = Response::new(Body::from(data));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_key(&key)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    Ok(response)
}
