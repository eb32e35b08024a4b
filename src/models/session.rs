//! Chunked upload sessions and the per-chunk receipts recorded for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of a chunked upload.
///
/// `Receiving` accepts chunks. Once every index in `0..total` has a receipt,
/// exactly one request moves the session to `Composing` and runs assembly and
/// variant generation; it ends in `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionState {
    Receiving,
    Composing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Receiving => "receiving",
            SessionState::Composing => "composing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }
}

/// A chunked upload session, keyed by the hash of declared size and file name.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Hex md5 of `"{size}:{name}"`.
    pub id: String,

    /// File name as declared by the client.
    pub file_name: String,

    /// Total file size as declared by the client.
    pub declared_size: i64,

    /// Number of chunks the client announced.
    pub total_chunks: u32,

    /// Optional MIME type the client sent alongside the chunks.
    pub content_type: Option<String>,

    pub state: SessionState,

    /// Set once the session completed and variants were stored.
    pub image_id: Option<Uuid>,

    /// Failure reason when `state` is `Failed`.
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Record of one chunk persisted to temporary storage.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ChunkReceipt {
    pub session_id: String,
    pub chunk_index: u32,
    pub size_bytes: i64,

    /// Temporary object key, `chunks/{session_id}/{chunk_index}`.
    pub storage_key: String,

    pub etag: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Derive the session id for a declared file size and name.
pub fn session_id(declared_size: u64, file_name: &str) -> String {
    format!("{:x}", md5::compute(format!("{}:{}", declared_size, file_name)))
}

/// Temporary storage key for a chunk.
pub fn chunk_key(session_id: &str, index: u32) -> String {
    format!("chunks/{}/{}", session_id, index)
}

/// Temporary storage key for the composed object of a session.
pub fn composed_key(session_id: &str) -> String {
    format!("chunks/{}/composed", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_stable_and_depends_on_size_and_name() {
        let a = session_id(1024, "pool.jpg");
        assert_eq!(a, session_id(1024, "pool.jpg"));
        assert_eq!(a.len(), 32);
        assert_ne!(a, session_id(1025, "pool.jpg"));
        assert_ne!(a, session_id(1024, "lobby.jpg"));
    }

    #[test]
    fn chunk_keys_are_namespaced_by_session() {
        assert_eq!(chunk_key("abc", 3), "chunks/abc/3");
        assert_eq!(composed_key("abc"), "chunks/abc/composed");
    }
}
