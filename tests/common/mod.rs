#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use resort_media::{
    app, db,
    services::upload_service::UploadService,
    storage::{MemoryObjectStore, ObjectStore, StoreError, StoreResult, StoredObject},
};
use serde_json::Value;
use std::sync::{Arc, Mutex};

pub const PUBLIC_BASE: &str = "http://media.test";
const BOUNDARY: &str = "resort-media-test-boundary";

/// Memory store that records calls and can be told to fail some of them.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryObjectStore,
    /// Saves whose key contains any of these fragments fail.
    pub fail_saves_containing: Vec<String>,
    pub fail_deletes: bool,
    saves: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryObjectStore::new(PUBLIC_BASE),
            ..Default::default()
        }
    }

    pub fn failing_saves(fragments: &[&str]) -> Self {
        Self {
            fail_saves_containing: fragments.iter().map(|f| f.to_string()).collect(),
            ..Self::new()
        }
    }

    pub fn failing_deletes() -> Self {
        Self {
            fail_deletes: true,
            ..Self::new()
        }
    }

    pub fn saves(&self) -> Vec<String> {
        self.saves.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner.keys().await
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn save(&self, key: &str, data: Bytes, content_type: &str) -> StoreResult<StoredObject> {
        self.saves.lock().unwrap().push(key.to_string());
        if self.fail_saves_containing.iter().any(|f| key.contains(f.as_str())) {
            return Err(StoreError::Backend {
                status: 503,
                message: format!("injected failure saving {}", key),
            });
        }
        self.inner.save(key, data, content_type).await
    }

    async fn compose(
        &self,
        sources: &[String],
        destination: &str,
        content_type: &str,
    ) -> StoreResult<StoredObject> {
        self.inner.compose(sources, destination, content_type).await
    }

    async fn download(&self, key: &str) -> StoreResult<Bytes> {
        self.inner.download(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.deletes.lock().unwrap().push(key.to_string());
        if self.fail_deletes {
            return Err(StoreError::Backend {
                status: 503,
                message: format!("injected failure deleting {}", key),
            });
        }
        self.inner.delete(key).await
    }

    fn public_url(&self, key: &str) -> String {
        self.inner.public_url(key)
    }

    async fn check_ready(&self) -> StoreResult<()> {
        Ok(())
    }
}

pub async fn service_with(store: Arc<dyn ObjectStore>) -> UploadService {
    let pool = db::connect("sqlite::memory:", 1).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    UploadService::new(Arc::new(pool), store)
}

pub async fn router_with(store: Arc<dyn ObjectStore>) -> Router {
    app(service_with(store).await, 32 * 1024 * 1024)
}

/// A PNG with enough detail that it does not compress to nothing.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        let noise = (x.wrapping_mul(2654435761) ^ y.wrapping_mul(40503)) >> 7;
        image::Rgb([(x % 256) as u8, (y % 256) as u8, (noise % 256) as u8])
    });
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

pub enum FormPart {
    Text(&'static str, String),
    File {
        field: &'static str,
        file_name: String,
        content_type: String,
        data: Vec<u8>,
    },
}

pub fn text(field: &'static str, value: impl ToString) -> FormPart {
    FormPart::Text(field, value.to_string())
}

pub fn file(field: &'static str, file_name: &str, content_type: &str, data: &[u8]) -> FormPart {
    FormPart::File {
        field,
        file_name: file_name.to_string(),
        content_type: content_type.to_string(),
        data: data.to_vec(),
    }
}

/// POST a multipart body built from `parts`.
pub fn multipart_request(uri: &str, parts: Vec<FormPart>) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            FormPart::Text(field, value) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                        field, value
                    )
                    .as_bytes(),
                );
            }
            FormPart::File {
                field,
                file_name,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        field, file_name, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(&data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

/// Multipart request for chunk `index` of `data` split into `chunk_size` pieces.
pub fn chunk_request(name: &str, data: &[u8], chunk_size: usize, index: usize) -> Request<Body> {
    let total = data.len().div_ceil(chunk_size);
    let start = index * chunk_size;
    let end = (start + chunk_size).min(data.len());
    multipart_request(
        "/api/v1/upload-image?chunked=1",
        vec![
            text("name", name),
            text("size", data.len()),
            text("index", index),
            text("total", total),
            text("type", "image/png"),
            file("chunk", "blob", "application/octet-stream", &data[start..end]),
        ],
    )
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn json_body(res: Response<Body>) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
