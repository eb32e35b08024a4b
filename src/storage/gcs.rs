//! Google Cloud Storage backend.
//!
//! Talks to GCS through the `cloud_storage` SDK, which signs requests with a
//! service account key and refreshes its access token on its own. The SDK
//! reads the key path from `SERVICE_ACCOUNT` or
//! `GOOGLE_APPLICATION_CREDENTIALS`; `StorageSettings::connect` checks the
//! key before this store is built.

use super::{ConfigError, ObjectStore, StoreError, StoreResult, StoredObject, ensure_key_safe};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use cloud_storage::object::{ComposeRequest, SourceObject};
use std::sync::Arc;
use tracing::{debug, warn};

const PUBLIC_HOST: &str = "https://storage.googleapis.com";

/// The compose call accepts at most this many source objects.
const MAX_COMPOSE_SOURCES: usize = 32;

/// Object metadata the store needs back from the API.
#[derive(Debug, Clone)]
pub(crate) struct RemoteObject {
    name: String,
    size: u64,
    md5_hash: Option<String>,
    etag: String,
}

impl From<cloud_storage::Object> for RemoteObject {
    fn from(object: cloud_storage::Object) -> Self {
        Self {
            name: object.name,
            size: object.size,
            md5_hash: object.md5_hash,
            etag: object.etag,
        }
    }
}

impl RemoteObject {
    fn into_stored(self) -> StoredObject {
        StoredObject {
            key: self.name,
            size_bytes: self.size,
            etag: Some(self.etag),
        }
    }
}

/// A failed API call.
#[derive(Debug)]
pub(crate) enum ApiFailure {
    /// GCS answered with an error status.
    Status { code: u16, message: String },
    /// Transport, token or decoding failure.
    Other(String),
}

impl From<cloud_storage::Error> for ApiFailure {
    fn from(err: cloud_storage::Error) -> Self {
        match err {
            cloud_storage::Error::Google(response) => ApiFailure::Status {
                code: response.error.code,
                message: response.error.message,
            },
            other => ApiFailure::Other(other.to_string()),
        }
    }
}

/// The object calls this backend makes.
#[async_trait]
pub(crate) trait GcsApi: Send + Sync + 'static {
    async fn create(
        &self,
        bucket: &str,
        data: Vec<u8>,
        name: &str,
        content_type: &str,
    ) -> Result<RemoteObject, ApiFailure>;

    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> Result<RemoteObject, ApiFailure>;

    async fn download(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ApiFailure>;

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), ApiFailure>;

    async fn read_bucket(&self, bucket: &str) -> Result<(), ApiFailure>;
}

#[async_trait]
impl GcsApi for cloud_storage::Client {
    async fn create(
        &self,
        bucket: &str,
        data: Vec<u8>,
        name: &str,
        content_type: &str,
    ) -> Result<RemoteObject, ApiFailure> {
        let object = self.object().create(bucket, data, name, content_type).await?;
        Ok(object.into())
    }

    async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
    ) -> Result<RemoteObject, ApiFailure> {
        let request = ComposeRequest {
            kind: "storage#composeRequest".to_string(),
            source_objects: sources
                .iter()
                .map(|name| SourceObject {
                    name: name.clone(),
                    generation: None,
                    object_preconditions: None,
                })
                .collect(),
            destination: None,
        };
        let object = self.object().compose(bucket, &request, destination).await?;
        Ok(object.into())
    }

    async fn download(&self, bucket: &str, name: &str) -> Result<Vec<u8>, ApiFailure> {
        Ok(self.object().download(bucket, name).await?)
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), ApiFailure> {
        Ok(self.object().delete(bucket, name).await?)
    }

    async fn read_bucket(&self, bucket: &str) -> Result<(), ApiFailure> {
        self.bucket().read(bucket).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct GcsObjectStore {
    api: Arc<dyn GcsApi>,
    bucket: String,
}

impl GcsObjectStore {
    /// Store backed by the SDK client; credentials are resolved from the
    /// environment on the first call.
    pub fn new(bucket: String) -> Self {
        Self::with_api(bucket, Arc::new(cloud_storage::Client::default()))
    }

    pub(crate) fn with_api(bucket: String, api: Arc<dyn GcsApi>) -> Self {
        Self { api, bucket }
    }

    /// Compose in rounds of at most 32 sources, folding each round into an
    /// intermediate object that heads the next round.
    async fn compose_rounds(
        &self,
        sources: &[String],
        destination: &str,
        intermediates: &mut Vec<String>,
    ) -> StoreResult<StoredObject> {
        let mut pending: Vec<String> = sources.to_vec();
        while pending.len() > MAX_COMPOSE_SOURCES {
            let batch: Vec<String> = pending.drain(..MAX_COMPOSE_SOURCES).collect();
            let key = format!("{}.round-{}", destination, intermediates.len());
            self.api
                .compose(&self.bucket, &batch, &key)
                .await
                .map_err(|err| classify_failure(err, &key))?;
            intermediates.push(key.clone());
            pending.insert(0, key);
        }

        let object = self
            .api
            .compose(&self.bucket, &pending, destination)
            .await
            .map_err(|err| classify_failure(err, destination))?;
        Ok(object.into_stored())
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn save(&self, key: &str, data: Bytes, content_type: &str) -> StoreResult<StoredObject> {
        ensure_key_safe(key)?;
        let expected_md5 = general_purpose::STANDARD.encode(md5::compute(&data).0);

        let object = self
            .api
            .create(&self.bucket, data.to_vec(), key, content_type)
            .await
            .map_err(|err| classify_failure(err, key))?;

        if let Some(actual) = object.md5_hash.as_deref() {
            if actual != expected_md5 {
                if let Err(err) = self.delete(key).await {
                    warn!("failed to delete corrupt object {}: {}", key, err);
                }
                return Err(StoreError::Backend {
                    status: 200,
                    message: format!(
                        "checksum mismatch for `{}`: sent {}, stored {}",
                        key, expected_md5, actual
                    ),
                });
            }
        }
        debug!("stored gs://{}/{}", self.bucket, key);
        Ok(object.into_stored())
    }

    /// The composed object keeps the API's default content type; callers
    /// download it rather than serve it.
    async fn compose(
        &self,
        sources: &[String],
        destination: &str,
        _content_type: &str,
    ) -> StoreResult<StoredObject> {
        if sources.is_empty() {
            return Err(StoreError::EmptyCompose);
        }
        ensure_key_safe(destination)?;

        let mut intermediates = Vec::new();
        let result = self
            .compose_rounds(sources, destination, &mut intermediates)
            .await;

        for key in &intermediates {
            if let Err(err) = self.delete(key).await {
                warn!("failed to delete intermediate compose object {}: {}", key, err);
            }
        }
        result
    }

    async fn download(&self, key: &str) -> StoreResult<Bytes> {
        ensure_key_safe(key)?;
        let data = self
            .api
            .download(&self.bucket, key)
            .await
            .map_err(|err| classify_failure(err, key))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        ensure_key_safe(key)?;
        self.api
            .delete(&self.bucket, key)
            .await
            .map_err(|err| classify_failure(err, key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}/{}", PUBLIC_HOST, self.bucket, key)
    }

    /// Read the bucket to confirm it exists and the key can reach it.
    async fn check_ready(&self) -> StoreResult<()> {
        self.api
            .read_bucket(&self.bucket)
            .await
            .map_err(|err| classify_failure(err, &self.bucket))
    }
}

fn classify_failure(failure: ApiFailure, key: &str) -> StoreError {
    match failure {
        ApiFailure::Status { code: 401 | 403, message } => {
            StoreError::Config(ConfigError::CredentialsRejected(message))
        }
        ApiFailure::Status { code: 404, .. } => StoreError::NotFound(key.to_string()),
        ApiFailure::Status { code, message } => StoreError::Backend {
            status: code,
            message,
        },
        ApiFailure::Other(message) => StoreError::Backend { status: 0, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::{BTreeMap, HashMap},
        sync::Mutex,
    };

    /// In-memory stand-in for the GCS object API.
    #[derive(Default)]
    struct FakeGcs {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        /// Source counts of every compose call, in order.
        compose_calls: Mutex<Vec<usize>>,
        /// Calls touching these names fail with the given status.
        failing: Mutex<HashMap<String, u16>>,
        corrupt_md5: bool,
    }

    impl FakeGcs {
        fn check(&self, name: &str) -> Result<(), ApiFailure> {
            match self.failing.lock().unwrap().get(name) {
                Some(code) => Err(ApiFailure::Status {
                    code: *code,
                    message: format!("injected {}", code),
                }),
                None => Ok(()),
            }
        }

        fn remote(&self, name: &str, data: &[u8]) -> RemoteObject {
            let digest = if self.corrupt_md5 {
                md5::compute(b"something else")
            } else {
                md5::compute(data)
            };
            RemoteObject {
                name: name.to_string(),
                size: data.len() as u64,
                md5_hash: Some(general_purpose::STANDARD.encode(digest.0)),
                etag: format!("etag-{}", name),
            }
        }

        fn names(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl GcsApi for FakeGcs {
        async fn create(
            &self,
            _bucket: &str,
            data: Vec<u8>,
            name: &str,
            _content_type: &str,
        ) -> Result<RemoteObject, ApiFailure> {
            self.check(name)?;
            let remote = self.remote(name, &data);
            self.objects.lock().unwrap().insert(name.to_string(), data);
            Ok(remote)
        }

        async fn compose(
            &self,
            _bucket: &str,
            sources: &[String],
            destination: &str,
        ) -> Result<RemoteObject, ApiFailure> {
            self.compose_calls.lock().unwrap().push(sources.len());
            self.check(destination)?;
            let mut objects = self.objects.lock().unwrap();
            let mut combined = Vec::new();
            for source in sources {
                let data = objects.get(source).ok_or_else(|| ApiFailure::Status {
                    code: 404,
                    message: format!("no such object: {}", source),
                })?;
                combined.extend_from_slice(data);
            }
            let remote = self.remote(destination, &combined);
            objects.insert(destination.to_string(), combined);
            Ok(remote)
        }

        async fn download(&self, _bucket: &str, name: &str) -> Result<Vec<u8>, ApiFailure> {
            self.check(name)?;
            self.objects
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| ApiFailure::Status {
                    code: 404,
                    message: "not found".into(),
                })
        }

        async fn delete(&self, _bucket: &str, name: &str) -> Result<(), ApiFailure> {
            self.check(name)?;
            self.objects
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| ApiFailure::Status {
                    code: 404,
                    message: "not found".into(),
                })
        }

        async fn read_bucket(&self, bucket: &str) -> Result<(), ApiFailure> {
            self.check(bucket)
        }
    }

    fn store(api: &Arc<FakeGcs>) -> GcsObjectStore {
        GcsObjectStore::with_api("resort-media".into(), api.clone())
    }

    async fn save_chunks(store: &GcsObjectStore, count: usize) -> Vec<String> {
        let mut keys = Vec::new();
        for i in 0..count {
            let key = format!("chunks/s/{}", i);
            store
                .save(&key, Bytes::from(vec![i as u8; 3]), "application/octet-stream")
                .await
                .unwrap();
            keys.push(key);
        }
        keys
    }

    #[tokio::test]
    async fn save_download_and_delete() {
        let api = Arc::new(FakeGcs::default());
        let store = store(&api);

        let stored = store
            .save("images/1/small.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 4);
        assert_eq!(
            store.download("images/1/small.jpg").await.unwrap(),
            Bytes::from_static(b"jpeg")
        );

        store.delete("images/1/small.jpg").await.unwrap();
        assert!(matches!(
            store.download("images/1/small.jpg").await,
            Err(StoreError::NotFound(key)) if key == "images/1/small.jpg"
        ));
        assert!(matches!(
            store.delete("images/1/small.jpg").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_drops_the_object() {
        let api = Arc::new(FakeGcs {
            corrupt_md5: true,
            ..Default::default()
        });
        let err = store(&api)
            .save("images/1/small.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend { message, .. } if message.contains("checksum")));
        assert!(api.names().is_empty());
    }

    #[tokio::test]
    async fn compose_small_batches_in_one_call() {
        let api = Arc::new(FakeGcs::default());
        let store = store(&api);
        let sources = save_chunks(&store, 3).await;

        let stored = store
            .compose(&sources, "chunks/s/composed", "image/png")
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 9);
        assert_eq!(*api.compose_calls.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn compose_over_32_sources_runs_in_rounds() {
        let api = Arc::new(FakeGcs::default());
        let store = store(&api);
        let sources = save_chunks(&store, 70).await;

        store
            .compose(&sources, "chunks/s/composed", "image/png")
            .await
            .unwrap();

        // 32 -> round-0, round-0 + 31 -> round-1, round-1 + 7 -> destination
        assert_eq!(*api.compose_calls.lock().unwrap(), vec![32, 32, 8]);
        let composed = store.download("chunks/s/composed").await.unwrap();
        let expected: Vec<u8> = (0..70u8).flat_map(|i| [i; 3]).collect();
        assert_eq!(composed.as_ref(), expected.as_slice());
        assert!(api.names().iter().all(|name| !name.contains(".round-")));
    }

    #[tokio::test]
    async fn failed_round_still_removes_intermediates() {
        let api = Arc::new(FakeGcs::default());
        let store = store(&api);
        let sources = save_chunks(&store, 40).await;
        api.failing
            .lock()
            .unwrap()
            .insert("chunks/s/composed".into(), 503);

        let err = store
            .compose(&sources, "chunks/s/composed", "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend { status: 503, .. }));
        assert_eq!(api.compose_calls.lock().unwrap().len(), 2);
        assert!(api.names().iter().all(|name| !name.contains(".round-")));
    }

    #[tokio::test]
    async fn rejected_credentials_become_config_errors() {
        let api = Arc::new(FakeGcs::default());
        api.failing.lock().unwrap().insert("resort-media".into(), 403);
        api.failing.lock().unwrap().insert("images/x.jpg".into(), 401);
        let store = store(&api);

        assert!(matches!(
            store.check_ready().await,
            Err(StoreError::Config(ConfigError::CredentialsRejected(_)))
        ));
        assert!(matches!(
            store.save("images/x.jpg", Bytes::from_static(b"x"), "image/jpeg").await,
            Err(StoreError::Config(ConfigError::CredentialsRejected(_)))
        ));
    }

    #[test]
    fn transport_failures_are_backend_errors() {
        let err = classify_failure(ApiFailure::Other("connection reset".into()), "k");
        assert!(matches!(err, StoreError::Backend { status: 0, message } if message == "connection reset"));
        let err = classify_failure(
            ApiFailure::Status {
                code: 502,
                message: "upstream".into(),
            },
            "k",
        );
        assert!(matches!(err, StoreError::Backend { status: 502, .. }));
    }

    #[test]
    fn public_url_uses_bucket_path() {
        let api = Arc::new(FakeGcs::default());
        assert_eq!(
            store(&api).public_url("images/1/small.jpg"),
            "https://storage.googleapis.com/resort-media/images/1/small.jpg"
        );
    }
}
