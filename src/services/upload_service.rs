//! UploadService: the image upload pipeline.
//!
//! Whole files go straight to variant generation. Chunked uploads are
//! tracked as sessions: each chunk is stored under `chunks/{session}/{index}`
//! and its receipt recorded; once receipts cover every index the chunks are
//! composed into one object, downloaded, and run through the same variant
//! generation. Temporary objects are deleted afterwards on a best-effort
//! basis.

use crate::{
    models::{
        api::{ChunkAck, SessionView},
        image::{ImageVariant, UploadedImage, VariantSize},
        session::{ChunkReceipt, SessionState, UploadSession, chunk_key, composed_key, session_id},
    },
    services::{
        session_store::{NewSession, SessionStore},
        variants::{self, OUTPUT_CONTENT_TYPE, OUTPUT_EXTENSION},
    },
    storage::{ConfigError, ObjectStore, StoreError},
};
use bytes::Bytes;
use chrono::Utc;
use image::DynamicImage;
use sqlx::SqlitePool;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHUNK_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("image processing failed: {0}")]
    Processing(String),
    #[error("all image variants failed: {}", .0.join("; "))]
    AllVariantsFailed(Vec<String>),
    #[error("storage operation failed: {0}")]
    Storage(StoreError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl From<StoreError> for UploadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Config(config) => UploadError::Config(config),
            other => UploadError::Storage(other),
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// A whole-file upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// One byte range of a chunked upload, with the metadata sent alongside it.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub name: String,
    pub size: u64,
    pub index: u32,
    pub total: u32,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl ChunkUpload {
    fn validate(&self) -> UploadResult<()> {
        if self.name.trim().is_empty() {
            return Err(UploadError::BadRequest("chunk field `name` is empty".into()));
        }
        if self.size == 0 {
            return Err(UploadError::BadRequest("chunk field `size` must be positive".into()));
        }
        if self.size > i64::MAX as u64 {
            return Err(UploadError::BadRequest(format!(
                "chunk field `size` is too large: {}",
                self.size
            )));
        }
        if self.total == 0 {
            return Err(UploadError::BadRequest("chunk field `total` must be positive".into()));
        }
        if self.index >= self.total {
            return Err(UploadError::BadRequest(format!(
                "chunk index {} is out of range for {} chunks",
                self.index, self.total
            )));
        }
        if self.data.is_empty() {
            return Err(UploadError::BadRequest("chunk payload is empty".into()));
        }
        if self.data.len() as u64 > self.size {
            return Err(UploadError::BadRequest(format!(
                "chunk of {} bytes exceeds the declared file size {}",
                self.data.len(),
                self.size
            )));
        }
        if let Some(ct) = self.content_type.as_deref() {
            if !ct.starts_with("image/") {
                return Err(UploadError::BadRequest(format!(
                    "unsupported file type `{}`; only image/* uploads are accepted",
                    ct
                )));
            }
        }
        Ok(())
    }
}

/// What a chunk request produced.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// The session still waits for chunks, or another request is assembling it.
    Pending(ChunkAck),
    /// This chunk completed the session.
    Completed(UploadedImage),
}

#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite pool holding sessions and image records.
    pub db: Arc<SqlitePool>,
    store: Arc<dyn ObjectStore>,
    sessions: SessionStore,
    /// Age after which an untouched session counts as abandoned.
    session_ttl: Duration,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            sessions: SessionStore::new(db.clone()),
            db,
            store,
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    /// Set the abandonment age. Zero never treats a composing session as
    /// abandoned.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Generate and store all variants of a whole-file upload.
    pub async fn upload_file(&self, file: FileUpload) -> UploadResult<UploadedImage> {
        match file.content_type.as_deref() {
            Some(ct) if ct.starts_with("image/") => {}
            Some(ct) => {
                return Err(UploadError::BadRequest(format!(
                    "unsupported file type `{}`; only image/* uploads are accepted",
                    ct
                )));
            }
            None => {
                return Err(UploadError::BadRequest(
                    "file type is missing; only image/* uploads are accepted".into(),
                ));
            }
        }
        if file.data.is_empty() {
            return Err(UploadError::BadRequest("uploaded file is empty".into()));
        }

        debug!("processing {} ({} bytes)", file.name, file.data.len());
        self.process_image(file.data, &file.name).await
    }

    /// Store one chunk and, when it completes the session, assemble the file.
    pub async fn accept_chunk(&self, chunk: ChunkUpload) -> UploadResult<ChunkOutcome> {
        chunk.validate()?;
        let sid = session_id(chunk.size, &chunk.name);
        let session = self.open_session(&sid, &chunk).await?;

        let key = chunk_key(&sid, chunk.index);
        let size_bytes = chunk.data.len() as i64;
        let stored = self.store.save(&key, chunk.data, CHUNK_CONTENT_TYPE).await?;
        let recorded = self
            .sessions
            .record_chunk(&ChunkReceipt {
                session_id: sid.clone(),
                chunk_index: chunk.index,
                size_bytes,
                storage_key: key.clone(),
                etag: stored.etag,
                received_at: Utc::now(),
            })
            .await?;
        if !recorded {
            return Err(self.reject_late_chunk(&sid, &key).await);
        }
        debug!(
            "stored chunk {}/{} of session {} ({} bytes)",
            chunk.index + 1,
            chunk.total,
            sid,
            size_bytes
        );

        let receipts = self.sessions.chunks(&sid).await?;
        let missing = missing_indices(&receipts, session.total_chunks);
        let ack = ChunkAck {
            session_id: sid.clone(),
            index: chunk.index,
            received: receipts.len() as u32,
            total: session.total_chunks,
            complete: false,
            missing,
        };
        if !ack.missing.is_empty() {
            return Ok(ChunkOutcome::Pending(ack));
        }

        if !self
            .sessions
            .transition(&sid, SessionState::Receiving, SessionState::Composing)
            .await?
        {
            debug!("session {} is already being assembled", sid);
            return Ok(ChunkOutcome::Pending(ack));
        }

        // Assembly runs detached so a dropped request cannot leave the
        // session stuck in `composing`.
        let service = self.clone();
        tokio::spawn(async move { service.finish_session(session, receipts).await })
            .await
            .map_err(|err| UploadError::Processing(format!("assembly task failed: {}", err)))?
    }

    /// Assemble a session whose chunks are all in and record the outcome.
    async fn finish_session(
        &self,
        session: UploadSession,
        receipts: Vec<ChunkReceipt>,
    ) -> UploadResult<ChunkOutcome> {
        let sid = session.id.clone();
        match self.assemble(&session, &receipts).await {
            Ok(image) => {
                self.sessions.mark_completed(&sid, image.id).await?;
                info!(
                    "upload session {} completed as image {} ({} variants)",
                    sid,
                    image.id,
                    image.variants.len()
                );
                Ok(ChunkOutcome::Completed(image))
            }
            Err(err) => {
                warn!("upload session {} failed: {}", sid, err);
                self.sessions.mark_failed(&sid, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    /// Current state of a chunked upload.
    pub async fn session_view(&self, id: &str) -> UploadResult<SessionView> {
        let session = self
            .sessions
            .get(id)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("upload session `{}` not found", id)))?;
        let received = self
            .sessions
            .chunks(id)
            .await?
            .into_iter()
            .map(|receipt| receipt.chunk_index)
            .collect();
        Ok(SessionView::new(session, received))
    }

    pub async fn image(&self, id: Uuid) -> UploadResult<UploadedImage> {
        self.sessions
            .get_image(id)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("image `{}` not found", id)))
    }

    /// Remove sessions untouched for `ttl` and their chunk objects.
    ///
    /// This covers abandoned uploads, composition that never finished, and
    /// finished sessions past their retention. Returns how many were removed.
    pub async fn sweep_stale_sessions(&self, ttl: Duration) -> UploadResult<usize> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| UploadError::BadRequest(format!("invalid session ttl: {}", err)))?;
        let stale = self.sessions.stale(Utc::now() - ttl).await?;

        for session in &stale {
            let keys: Vec<String> = self
                .sessions
                .chunks(&session.id)
                .await?
                .into_iter()
                .map(|receipt| receipt.storage_key)
                .collect();
            self.cleanup(&keys, &composed_key(&session.id)).await;
            self.sessions.remove(&session.id).await?;
            debug!(
                "swept {} upload session {} ({} chunks)",
                session.state.as_str(),
                session.id,
                keys.len()
            );
        }
        Ok(stale.len())
    }

    /// Find or (re)start the session a chunk belongs to.
    async fn open_session(&self, sid: &str, chunk: &ChunkUpload) -> UploadResult<UploadSession> {
        let new = NewSession {
            id: sid,
            file_name: &chunk.name,
            declared_size: chunk.size as i64,
            total_chunks: chunk.total,
            content_type: chunk.content_type.as_deref(),
        };

        let Some(existing) = self.sessions.get(sid).await? else {
            return Ok(self.sessions.start(new).await?);
        };

        let abandoned = self.is_abandoned(&existing);
        match existing.state {
            SessionState::Receiving if existing.total_chunks == chunk.total => Ok(existing),
            SessionState::Composing if chunk.index != 0 || !abandoned => {
                Err(UploadError::Conflict(format!(
                    "upload session `{}` is being assembled",
                    sid
                )))
            }
            _ if chunk.index == 0 => {
                info!(
                    "restarting upload session {} ({} -> {} chunks)",
                    sid, existing.total_chunks, chunk.total
                );
                let stale_keys: Vec<String> = self
                    .sessions
                    .chunks(sid)
                    .await?
                    .into_iter()
                    .map(|receipt| receipt.storage_key)
                    .collect();
                self.cleanup(&stale_keys, &composed_key(sid)).await;
                Ok(self.sessions.start(new).await?)
            }
            SessionState::Receiving => Err(UploadError::BadRequest(format!(
                "chunk declares {} chunks but upload session `{}` expects {}",
                chunk.total, sid, existing.total_chunks
            ))),
            state => Err(UploadError::Conflict(format!(
                "upload session `{}` is already {}; resend from chunk 0 to start over",
                sid,
                state.as_str()
            ))),
        }
    }

    /// Compose the received chunks, generate variants, and clean up.
    async fn assemble(
        &self,
        session: &UploadSession,
        receipts: &[ChunkReceipt],
    ) -> UploadResult<UploadedImage> {
        let sources: Vec<String> = receipts.iter().map(|r| r.storage_key.clone()).collect();
        let composed = composed_key(&session.id);

        let received: i64 = receipts.iter().map(|r| r.size_bytes).sum();
        let outcome = if received != session.declared_size {
            Err(UploadError::BadRequest(format!(
                "received {} bytes across {} chunks but {} were declared",
                received,
                receipts.len(),
                session.declared_size
            )))
        } else {
            self.compose_and_process(session, &sources, &composed).await
        };

        self.cleanup(&sources, &composed).await;
        if let Err(err) = self.sessions.clear_chunks(&session.id).await {
            warn!("failed to clear chunk receipts of {}: {}", session.id, err);
        }
        outcome
    }

    async fn compose_and_process(
        &self,
        session: &UploadSession,
        sources: &[String],
        composed: &str,
    ) -> UploadResult<UploadedImage> {
        let content_type = session.content_type.as_deref().unwrap_or(CHUNK_CONTENT_TYPE);
        let object = self.store.compose(sources, composed, content_type).await?;
        debug!(
            "composed {} chunks of session {} into {} ({} bytes)",
            sources.len(),
            session.id,
            object.key,
            object.size_bytes
        );
        let data = self.store.download(composed).await?;
        self.process_image(data, &session.file_name).await
    }

    /// Decode once, then render and upload every variant in order.
    ///
    /// Variant failures are collected; the call fails only when none
    /// succeeded, or immediately on a configuration error.
    async fn process_image(&self, data: Bytes, original_name: &str) -> UploadResult<UploadedImage> {
        let source = tokio::task::spawn_blocking(move || variants::decode(&data))
            .await
            .map_err(|err| UploadError::Processing(format!("decode task failed: {}", err)))?
            .map_err(|err| UploadError::AllVariantsFailed(vec![format!("{:#}", err)]))?;
        let source = Arc::new(source);

        let image_id = Uuid::new_v4();
        let mut uploaded = Vec::with_capacity(VariantSize::ALL.len());
        let mut failures = Vec::new();

        for size in VariantSize::ALL {
            match self.upload_variant(image_id, &source, size).await {
                Ok(variant) => uploaded.push(variant),
                Err(UploadError::Config(err)) => return Err(UploadError::Config(err)),
                Err(err) => {
                    warn!("{} variant of {} failed: {}", size, original_name, err);
                    failures.push(format!("{}: {}", size, err));
                }
            }
        }

        if uploaded.is_empty() {
            return Err(UploadError::AllVariantsFailed(failures));
        }

        let image = UploadedImage {
            id: image_id,
            original_name: original_name.to_string(),
            variants: uploaded,
            created_at: Utc::now(),
        };
        self.sessions.save_image(&image).await?;
        Ok(image)
    }

    async fn upload_variant(
        &self,
        image_id: Uuid,
        source: &Arc<DynamicImage>,
        size: VariantSize,
    ) -> UploadResult<ImageVariant> {
        let source = source.clone();
        let encoded = tokio::task::spawn_blocking(move || variants::render(&source, size))
            .await
            .map_err(|err| UploadError::Processing(format!("render task failed: {}", err)))?
            .map_err(|err| UploadError::Processing(format!("{:#}", err)))?;

        let key = format!("images/{}/{}.{}", image_id, size, OUTPUT_EXTENSION);
        self.store
            .save(&key, Bytes::from(encoded.bytes), OUTPUT_CONTENT_TYPE)
            .await?;
        debug!("uploaded {} ({}x{})", key, encoded.width, encoded.height);

        Ok(ImageVariant {
            size,
            url: self.store.public_url(&key),
            width: encoded.width,
            height: encoded.height,
            storage_key: key,
        })
    }

    /// Whether a session has gone untouched for longer than the TTL.
    fn is_abandoned(&self, session: &UploadSession) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(self.session_ttl) else {
            return false;
        };
        ttl > chrono::Duration::zero() && Utc::now() - session.updated_at > ttl
    }

    /// A chunk was stored after its session left `receiving`/`composing`.
    ///
    /// The object is dropped unless the session is composing again, in which
    /// case the key may be one of its sources.
    async fn reject_late_chunk(&self, sid: &str, key: &str) -> UploadError {
        let state = match self.sessions.get(sid).await {
            Ok(Some(session)) => Some(session.state),
            Ok(None) => None,
            Err(err) => return err.into(),
        };
        if state != Some(SessionState::Composing) {
            if let Err(err) = self.store.delete(key).await {
                warn!("failed to delete late chunk {}: {}", key, err);
            }
        }
        let state = state.map(|s| s.as_str()).unwrap_or("gone");
        UploadError::Conflict(format!(
            "upload session `{}` is already {}; resend from chunk 0 to start over",
            sid, state
        ))
    }

    /// Delete temporary objects, logging and swallowing failures.
    async fn cleanup(&self, chunk_keys: &[String], composed: &str) {
        for key in chunk_keys.iter().map(String::as_str).chain([composed]) {
            match self.store.delete(key).await {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => debug!("temporary object {} already gone", key),
                Err(err) => warn!("failed to delete temporary object {}: {}", key, err),
            }
        }
    }
}

/// Indices in `0..total` without a receipt.
fn missing_indices(receipts: &[ChunkReceipt], total: u32) -> Vec<u32> {
    let received: BTreeSet<u32> = receipts.iter().map(|r| r.chunk_index).collect();
    (0..total).filter(|index| !received.contains(index)).collect()
}
