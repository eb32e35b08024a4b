//! JSON envelopes returned by the upload API.
//!
//! Every response is `{success, data}` or `{success: false, error}`.

use crate::models::{
    image::{ImageVariant, UploadedImage},
    session::{SessionState, UploadSession},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiEnvelope<()> {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a finished upload: the stored variants of one image.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub image_id: Uuid,
    pub original_name: String,
    pub variants: Vec<ImageVariant>,
}

impl From<UploadedImage> for ImagePayload {
    fn from(image: UploadedImage) -> Self {
        Self {
            image_id: image.id,
            original_name: image.original_name,
            variants: image.variants,
        }
    }
}

/// Acknowledgement of a chunk that did not complete its session.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub session_id: String,
    pub index: u32,
    pub received: u32,
    pub total: u32,
    pub complete: bool,
    pub missing: Vec<u32>,
}

/// Body of a successful `POST /api/v1/upload-image`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum UploadOutcome {
    Image(ImagePayload),
    Chunk(ChunkAck),
}

/// Body of `GET /api/v1/upload-image/sessions/{id}`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub file_name: String,
    pub declared_size: i64,
    pub total: u32,
    pub state: SessionState,
    pub received: Vec<u32>,
    pub image_id: Option<Uuid>,
    pub error: Option<String>,
}

impl SessionView {
    pub fn new(session: UploadSession, received: Vec<u32>) -> Self {
        Self {
            session_id: session.id,
            file_name: session.file_name,
            declared_size: session.declared_size,
            total: session.total_chunks,
            state: session.state,
            received,
            image_id: session.image_id,
            error: session.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_envelope_parses_without_data() {
        let body = r#"{"success":false,"error":"unsupported file type"}"#;
        let envelope: ApiEnvelope<UploadOutcome> = serde_json::from_str(body).unwrap();
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.error.as_deref(), Some("unsupported file type"));
    }

    #[test]
    fn chunk_ack_envelope_parses_as_chunk_outcome() {
        let body = r#"{"success":true,"data":{"sessionId":"abc","index":1,"received":2,
            "total":3,"complete":false,"missing":[2]}}"#;
        let envelope: ApiEnvelope<UploadOutcome> = serde_json::from_str(body).unwrap();
        match envelope.data {
            Some(UploadOutcome::Chunk(ack)) => assert_eq!(ack.missing, vec![2]),
            other => panic!("expected a chunk ack, got {:?}", other),
        }
    }
}
