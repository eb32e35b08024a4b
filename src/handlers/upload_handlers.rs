//! HTTP handlers for image uploads.
//!
//! `POST /api/v1/upload-image` takes a multipart body. Without the `chunked`
//! flag it expects a single `file` field; with `?chunked=1` it expects the
//! text fields `name`, `size`, `index`, `total` (and optionally `type`)
//! plus the binary `chunk` field.

use crate::{
    errors::AppError,
    models::{
        api::{ApiEnvelope, ImagePayload, SessionView, UploadOutcome},
        image::UploadedImage,
    },
    services::upload_service::{ChunkOutcome, ChunkUpload, FileUpload, UploadService},
};
use axum::{
    Json,
    extract::{Multipart, Path, Query, State},
};
use bytes::Bytes;
use serde::Deserialize;
use std::{collections::HashMap, str::FromStr};
use uuid::Uuid;

/// Query params accepted by the upload endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub chunked: Option<String>,
}

impl UploadQuery {
    fn is_chunked(&self) -> bool {
        matches!(
            self.chunked.as_deref().map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("1") | Some("true") | Some("yes")
        )
    }
}

/// A binary multipart field.
#[derive(Debug)]
struct FormFile {
    file_name: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// All fields of an upload form, read up front.
#[derive(Debug, Default)]
struct UploadForm {
    text: HashMap<String, String>,
    file: Option<FormFile>,
    chunk: Option<FormFile>,
}

impl UploadForm {
    async fn read(multipart: &mut Multipart) -> Result<Self, AppError> {
        let mut form = UploadForm::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" | "chunk" => {
                    let file = FormFile {
                        file_name: field.file_name().map(str::to_string),
                        content_type: field.content_type().map(str::to_string),
                        data: field.bytes().await?,
                    };
                    if name == "file" {
                        form.file = Some(file);
                    } else {
                        form.chunk = Some(file);
                    }
                }
                "" => {}
                _ => {
                    let value = field.text().await?;
                    form.text.insert(name, value);
                }
            }
        }
        Ok(form)
    }

    fn required(&self, field: &str) -> Result<&str, AppError> {
        self.text
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::bad_request(format!("missing chunk field `{}`", field)))
    }

    fn number<T: FromStr>(&self, field: &str) -> Result<T, AppError> {
        let raw = self.required(field)?;
        raw.parse::<T>().map_err(|_| {
            AppError::bad_request(format!(
                "chunk field `{}` must be a non-negative integer, got `{}`",
                field, raw
            ))
        })
    }

    fn into_chunk(mut self) -> Result<ChunkUpload, AppError> {
        let name = self.required("name")?.to_string();
        let size = self.number::<u64>("size")?;
        let index = self.number::<u32>("index")?;
        let total = self.number::<u32>("total")?;
        let content_type = self
            .text
            .remove("type")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let chunk = self
            .chunk
            .ok_or_else(|| AppError::bad_request("missing chunk field `chunk`"))?;

        Ok(ChunkUpload {
            name,
            size,
            index,
            total,
            content_type,
            data: chunk.data,
        })
    }

    fn into_file(self) -> Result<FileUpload, AppError> {
        let file = self
            .file
            .ok_or_else(|| AppError::bad_request("missing file field `file`"))?;
        Ok(FileUpload {
            name: file
                .file_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "upload".to_string()),
            content_type: file.content_type,
            data: file.data,
        })
    }
}

fn image_outcome(image: UploadedImage) -> Json<ApiEnvelope<UploadOutcome>> {
    Json(ApiEnvelope::ok(UploadOutcome::Image(ImagePayload::from(image))))
}

/// `POST /api/v1/upload-image[?chunked=1]`
pub async fn upload_image(
    State(service): State<UploadService>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<ApiEnvelope<UploadOutcome>>, AppError> {
    let form = UploadForm::read(&mut multipart).await?;

    if !query.is_chunked() {
        let image = service.upload_file(form.into_file()?).await?;
        return Ok(image_outcome(image));
    }

    match service.accept_chunk(form.into_chunk()?).await? {
        ChunkOutcome::Pending(ack) => Ok(Json(ApiEnvelope::ok(UploadOutcome::Chunk(ack)))),
        ChunkOutcome::Completed(image) => Ok(image_outcome(image)),
    }
}

/// `GET /api/v1/upload-image/sessions/{id}`
pub async fn get_session(
    State(service): State<UploadService>,
    Path(id): Path<String>,
) -> Result<Json<ApiEnvelope<SessionView>>, AppError> {
    let view = service.session_view(&id).await?;
    Ok(Json(ApiEnvelope::ok(view)))
}

/// `GET /api/v1/images/{id}`
pub async fn get_image(
    State(service): State<UploadService>,
    Path(id): Path<String>,
) -> Result<Json<ApiEnvelope<ImagePayload>>, AppError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::bad_request(format!("`{}` is not a valid image id", id)))?;
    let image = service.image(id).await?;
    Ok(Json(ApiEnvelope::ok(ImagePayload::from(image))))
}
