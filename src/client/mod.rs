//! Client for the upload endpoint.
//!
//! Each file is sent either in one request or, at or above the chunk
//! threshold, as a sequence of byte-range chunks. Progress is reported as
//! the request bodies stream out, and the server's variant list is folded
//! into one `ImageRecord` per file.

mod chunking;

pub use chunking::{
    ChunkSpan, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_THRESHOLD, UploadMode, choose_mode, plan_chunks,
};

use crate::{
    models::{
        api::{ApiEnvelope, ImagePayload, UploadOutcome},
        image::{ImageVariant, VariantSize},
    },
    storage::content_type_for_key,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{
    Url,
    multipart::{Form, Part},
};
use serde::Serialize;
use std::{io, path::Path, sync::Arc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Granularity of progress reports within one request body.
const PROGRESS_SLICE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("server responded {status}: {message}")]
    Status { status: u16, message: String },
    #[error("server rejected the upload: {0}")]
    Rejected(String),
    #[error("upload finished with chunks missing on the server: {missing:?}")]
    Incomplete { missing: Vec<u32> },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// A file held in memory, ready to send.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk; the content type follows the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let content_type = content_type_for_key(&name);
        Ok(Self::new(name, content_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Progress of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    pub file_index: usize,
    pub file_name: String,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub percent: f64,
}

pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// URL and dimensions of one rendition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariantLink {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl From<&ImageVariant> for VariantLink {
    fn from(variant: &ImageVariant) -> Self {
        Self {
            url: variant.url.clone(),
            width: variant.width,
            height: variant.height,
        }
    }
}

/// Normalized result of one uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub image_id: Uuid,
    pub original_name: String,
    pub small: Option<VariantLink>,
    pub medium: Option<VariantLink>,
    pub large: Option<VariantLink>,
    pub original: Option<VariantLink>,
}

impl From<ImagePayload> for ImageRecord {
    fn from(payload: ImagePayload) -> Self {
        let link = |size: VariantSize| {
            payload
                .variants
                .iter()
                .find(|v| v.size == size)
                .map(VariantLink::from)
        };
        Self {
            image_id: payload.image_id,
            small: link(VariantSize::Small),
            medium: link(VariantSize::Medium),
            large: link(VariantSize::Large),
            original: link(VariantSize::Original),
            original_name: payload.original_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadClientConfig {
    /// Full URL of the upload endpoint.
    pub endpoint: String,
    pub chunk_threshold: u64,
    pub chunk_size: u64,
}

impl UploadClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    endpoint: Url,
    chunk_threshold: u64,
    chunk_size: u64,
}

impl UploadClient {
    pub fn new(config: UploadClientConfig) -> Result<Self, ClientError> {
        if config.chunk_size == 0 {
            return Err(ClientError::InvalidConfig("chunk size must be positive".into()));
        }
        let endpoint = Url::parse(&config.endpoint).map_err(|err| {
            ClientError::InvalidConfig(format!("endpoint `{}`: {}", config.endpoint, err))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            chunk_threshold: config.chunk_threshold,
            chunk_size: config.chunk_size,
        })
    }

    /// Upload files one after another.
    ///
    /// A failing file yields an `Err` entry at its position; the remaining
    /// files are still attempted.
    pub async fn upload_files(
        &self,
        files: &[UploadFile],
        on_progress: ProgressFn,
    ) -> Vec<Result<ImageRecord, ClientError>> {
        let mut results = Vec::with_capacity(files.len());
        for (file_index, file) in files.iter().enumerate() {
            results.push(self.upload_file(file_index, file, on_progress.clone()).await);
        }
        results
    }

    /// Read and upload files from disk; unreadable files become `Err` entries.
    pub async fn upload_paths<P: AsRef<Path>>(
        &self,
        paths: &[P],
        on_progress: ProgressFn,
    ) -> Vec<Result<ImageRecord, ClientError>> {
        let mut results = Vec::with_capacity(paths.len());
        for (file_index, path) in paths.iter().enumerate() {
            let result = match UploadFile::from_path(path).await {
                Ok(file) => self.upload_file(file_index, &file, on_progress.clone()).await,
                Err(err) => Err(err),
            };
            results.push(result);
        }
        results
    }

    pub async fn upload_file(
        &self,
        file_index: usize,
        file: &UploadFile,
        on_progress: ProgressFn,
    ) -> Result<ImageRecord, ClientError> {
        match choose_mode(file.size(), self.chunk_threshold) {
            UploadMode::Direct => self.upload_direct(file_index, file, on_progress).await,
            UploadMode::Chunked => self.upload_chunked(file_index, file, on_progress).await,
        }
    }

    async fn upload_direct(
        &self,
        file_index: usize,
        file: &UploadFile,
        on_progress: ProgressFn,
    ) -> Result<ImageRecord, ClientError> {
        let total = file.size();
        let body = reqwest::Body::wrap_stream(progress_stream(
            file.data.clone(),
            0,
            total,
            file_index,
            file.name.clone(),
            on_progress,
        ));
        let part = Part::stream_with_length(body, total)
            .file_name(file.name.clone())
            .mime_str(&file.content_type)?;
        let form = Form::new().part("file", part);

        debug!("uploading {} in one request ({} bytes)", file.name, total);
        match self.send(form, false).await? {
            UploadOutcome::Image(payload) => Ok(payload.into()),
            UploadOutcome::Chunk(ack) => Err(ClientError::UnexpectedResponse(format!(
                "direct upload answered with a chunk acknowledgement for session {}",
                ack.session_id
            ))),
        }
    }

    async fn upload_chunked(
        &self,
        file_index: usize,
        file: &UploadFile,
        on_progress: ProgressFn,
    ) -> Result<ImageRecord, ClientError> {
        let total_bytes = file.size();
        let spans = plan_chunks(total_bytes, self.chunk_size);
        debug!(
            "uploading {} in {} chunks ({} bytes)",
            file.name,
            spans.len(),
            total_bytes
        );

        for span in &spans {
            let data = file.data.slice(span.range());
            let body = reqwest::Body::wrap_stream(progress_stream(
                data,
                span.offset,
                total_bytes,
                file_index,
                file.name.clone(),
                on_progress.clone(),
            ));
            let part = Part::stream_with_length(body, span.len)
                .file_name(file.name.clone())
                .mime_str("application/octet-stream")?;
            let form = Form::new()
                .text("name", file.name.clone())
                .text("size", total_bytes.to_string())
                .text("index", span.index.to_string())
                .text("total", span.total.to_string())
                .text("type", file.content_type.clone())
                .part("chunk", part);

            let outcome = self.send(form, true).await?;
            match (outcome, span.is_last()) {
                (UploadOutcome::Image(payload), _) => return Ok(payload.into()),
                (UploadOutcome::Chunk(ack), true) => {
                    return Err(ClientError::Incomplete {
                        missing: ack.missing,
                    });
                }
                (UploadOutcome::Chunk(ack), false) => {
                    debug!(
                        "chunk {}/{} of {} acknowledged ({} received)",
                        span.index + 1,
                        span.total,
                        file.name,
                        ack.received
                    );
                }
            }
        }

        Err(ClientError::UnexpectedResponse(format!(
            "no chunks were sent for {}",
            file.name
        )))
    }

    async fn send(&self, form: Form, chunked: bool) -> Result<UploadOutcome, ClientError> {
        let mut request = self.http.post(self.endpoint.clone()).multipart(form);
        if chunked {
            request = request.query(&[("chunked", "1")]);
        }
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        let envelope = serde_json::from_slice::<ApiEnvelope<UploadOutcome>>(&body);

        if !status.is_success() {
            let message = envelope
                .ok()
                .and_then(|e| e.error)
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope = envelope.map_err(|err| ClientError::UnexpectedResponse(err.to_string()))?;
        if !envelope.success {
            return Err(ClientError::Rejected(
                envelope.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| ClientError::UnexpectedResponse("response carried no data".into()))
    }
}

fn percent(sent: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (sent as f64 / total as f64) * 100.0
    }
}

/// Slice `data` and report progress as each slice is handed to the body.
///
/// `base` is the number of file bytes sent by earlier requests, so a chunk
/// reports within its share of the whole file.
fn progress_stream(
    data: Bytes,
    base: u64,
    total: u64,
    file_index: usize,
    file_name: String,
    on_progress: ProgressFn,
) -> impl Stream<Item = io::Result<Bytes>> + Send + Sync + 'static {
    let slices: Vec<Bytes> = (0..data.len())
        .step_by(PROGRESS_SLICE)
        .map(|start| data.slice(start..(start + PROGRESS_SLICE).min(data.len())))
        .collect();
    let mut sent = base;
    futures::stream::iter(slices).map(move |slice| {
        sent += slice.len() as u64;
        on_progress(UploadProgress {
            file_index,
            file_name: file_name.clone(),
            bytes_sent: sent,
            total_bytes: total,
            percent: percent(sent, total),
        });
        Ok(slice)
    })
}
