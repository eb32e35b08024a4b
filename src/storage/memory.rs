//! In-process object store for development and tests. Content types are
//! not kept; `/media` infers them from the key.

use super::{ObjectStore, StoreError, StoreResult, StoredObject, ensure_key_safe};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    public_base_url: String,
}

impl MemoryObjectStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Keys currently stored, in lexicographic order.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, key: &str, data: Bytes, _content_type: &str) -> StoreResult<StoredObject> {
        ensure_key_safe(key)?;
        let stored = StoredObject {
            key: key.to_string(),
            size_bytes: data.len() as u64,
            etag: Some(format!("{:x}", md5::compute(&data))),
        };
        self.objects.write().await.insert(key.to_string(), data);
        Ok(stored)
    }

    async fn compose(
        &self,
        sources: &[String],
        destination: &str,
        content_type: &str,
    ) -> StoreResult<StoredObject> {
        if sources.is_empty() {
            return Err(StoreError::EmptyCompose);
        }
        ensure_key_safe(destination)?;

        let combined = {
            let objects = self.objects.read().await;
            let mut buf = BytesMut::new();
            for source in sources {
                let data = objects
                    .get(source)
                    .ok_or_else(|| StoreError::NotFound(source.clone()))?;
                buf.extend_from_slice(data);
            }
            buf.freeze()
        };
        self.save(destination, combined, content_type).await
    }

    async fn download(&self, key: &str) -> StoreResult<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/media/{}", self.public_base_url, key)
    }

    async fn check_ready(&self) -> StoreResult<()> {
        Ok(())
    }
}
