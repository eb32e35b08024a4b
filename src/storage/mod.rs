//! Object storage backends.
//!
//! The upload pipeline only needs a handful of primitives from a store:
//! save a blob, concatenate stored blobs into a new one, read a blob back,
//! delete it, and turn a key into a public URL. `ObjectStore` captures those;
//! `StorageSettings::connect` picks the backend from configuration.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

pub mod gcs;
pub mod local;
pub mod memory;

pub use gcs::GcsObjectStore;
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

/// Missing or rejected storage setup. Always fatal for the request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("storage bucket name is not configured")]
    MissingBucket,
    #[error("storage credentials are not configured")]
    MissingCredentials,
    #[error("storage credentials are unusable: {0}")]
    InvalidCredentials(String),
    #[error("storage credentials were rejected: {0}")]
    CredentialsRejected(String),
}

impl ConfigError {
    /// Human-readable setup hint shown to API callers.
    pub fn hint(&self) -> String {
        match self {
            ConfigError::MissingBucket => {
                "Image storage is not set up: no bucket name configured. \
                 Set MEDIA_GCS_BUCKET (or --gcs-bucket) and restart the server."
                    .to_string()
            }
            ConfigError::MissingCredentials => {
                "Image storage is not set up: no service account key found. \
                 Set GOOGLE_APPLICATION_CREDENTIALS (or SERVICE_ACCOUNT) to the path of a \
                 service account JSON key and restart the server."
                    .to_string()
            }
            ConfigError::InvalidCredentials(detail) => format!(
                "Image storage is not set up: the service account key cannot be used ({}). \
                 Point GOOGLE_APPLICATION_CREDENTIALS at a valid service account JSON key \
                 and restart the server.",
                detail
            ),
            ConfigError::CredentialsRejected(detail) => format!(
                "Image storage rejected the configured credentials ({}). \
                 Check the service account's permissions on the bucket.",
                detail
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("compose requires at least one source object")]
    EmptyCompose,
    #[error("storage backend returned {status}: {message}")]
    Backend { status: u16, message: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Short backend name for logs and readiness output.
    fn name(&self) -> &'static str;

    /// Store `data` under `key`, overwriting any existing object.
    async fn save(&self, key: &str, data: Bytes, content_type: &str) -> StoreResult<StoredObject>;

    /// Concatenate `sources`, in order, into a new object at `destination`.
    async fn compose(
        &self,
        sources: &[String],
        destination: &str,
        content_type: &str,
    ) -> StoreResult<StoredObject>;

    /// Read a whole object into memory.
    async fn download(&self, key: &str) -> StoreResult<Bytes>;

    /// Delete an object. Deleting a missing object is `NotFound`.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Publicly reachable URL of `key`.
    fn public_url(&self, key: &str) -> String;

    /// Cheap round-trip used by the readiness check.
    async fn check_ready(&self) -> StoreResult<()>;
}

/// Which backend serves objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Local,
    Gcs,
    Memory,
}

impl std::str::FromStr for StorageBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "fs" | "filesystem" => Ok(Self::Local),
            "gcs" | "gcp" => Ok(Self::Gcs),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend `{}`", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backend: StorageBackendKind,
    /// Root directory of the local backend.
    pub storage_dir: PathBuf,
    /// Base URL this server is reachable at; used for `/media/...` links.
    pub public_base_url: String,
    pub gcs_bucket: Option<String>,
    /// Service account key file, as read by the GCS SDK.
    pub gcs_service_account: Option<PathBuf>,
}

impl StorageSettings {
    /// Build the configured store.
    ///
    /// Missing GCS settings do not abort startup; the returned store fails
    /// every call with the configuration error so callers see the setup hint.
    pub fn connect(&self) -> Arc<dyn ObjectStore> {
        match self.backend {
            StorageBackendKind::Local => Arc::new(LocalObjectStore::new(
                self.storage_dir.clone(),
                self.public_base_url.clone(),
            )),
            StorageBackendKind::Memory => {
                Arc::new(MemoryObjectStore::new(self.public_base_url.clone()))
            }
            StorageBackendKind::Gcs => {
                let bucket = self.gcs_bucket.as_deref().filter(|b| !b.trim().is_empty());
                let Some(bucket) = bucket else {
                    return Arc::new(UnconfiguredStore::new(ConfigError::MissingBucket));
                };
                let Some(key_path) = self.gcs_service_account.as_deref() else {
                    return Arc::new(UnconfiguredStore::new(ConfigError::MissingCredentials));
                };
                match check_service_account(key_path) {
                    Ok(()) => Arc::new(GcsObjectStore::new(bucket.to_string())),
                    Err(err) => Arc::new(UnconfiguredStore::new(err)),
                }
            }
        }
    }
}

/// Fields the GCS SDK requires in a service account key.
const SERVICE_ACCOUNT_FIELDS: [&str; 10] = [
    "type",
    "project_id",
    "private_key_id",
    "private_key",
    "client_email",
    "client_id",
    "auth_uri",
    "token_uri",
    "auth_provider_x509_cert_url",
    "client_x509_cert_url",
];

/// Make sure the key file is one the SDK can load.
fn check_service_account(path: &Path) -> Result<(), ConfigError> {
    let invalid = |detail: String| ConfigError::InvalidCredentials(format!("{}: {}", path.display(), detail));

    let raw = std::fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
    let key: serde_json::Value = serde_json::from_str(&raw).map_err(|err| invalid(err.to_string()))?;
    if let Some(missing) = SERVICE_ACCOUNT_FIELDS
        .iter()
        .find(|field| !key[**field].is_string())
    {
        return Err(invalid(format!("missing field `{}`", missing)));
    }
    if key["type"] != "service_account" {
        return Err(invalid(format!("key type is {}, expected service_account", key["type"])));
    }
    Ok(())
}

/// Stand-in store used when the backend cannot be configured.
pub struct UnconfiguredStore {
    error: ConfigError,
}

impl UnconfiguredStore {
    pub fn new(error: ConfigError) -> Self {
        tracing::warn!("object storage unavailable: {}", error);
        Self { error }
    }

    fn fail<T>(&self) -> StoreResult<T> {
        Err(StoreError::Config(self.error.clone()))
    }
}

#[async_trait]
impl ObjectStore for UnconfiguredStore {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn save(&self, _key: &str, _data: Bytes, _ct: &str) -> StoreResult<StoredObject> {
        self.fail()
    }

    async fn compose(&self, _s: &[String], _d: &str, _ct: &str) -> StoreResult<StoredObject> {
        self.fail()
    }

    async fn download(&self, _key: &str) -> StoreResult<Bytes> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        self.fail()
    }

    fn public_url(&self, key: &str) -> String {
        key.to_string()
    }

    async fn check_ready(&self) -> StoreResult<()> {
        self.fail()
    }
}

/// Basic key validation shared by the backends.
///
/// Rejects empty or overlong keys, absolute paths, `..` segments and
/// control characters.
pub(crate) fn ensure_key_safe(key: &str) -> StoreResult<()> {
    const MAX_OBJECT_KEY_LEN: usize = 1024;

    let bad = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Content type guessed from a key's extension.
pub fn content_type_for_key(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_control_characters() {
        assert!(ensure_key_safe("images/a/small.jpg").is_ok());
        assert!(ensure_key_safe("").is_err());
        assert!(ensure_key_safe("/etc/passwd").is_err());
        assert!(ensure_key_safe("chunks/../secret").is_err());
        assert!(ensure_key_safe("chunks/a\nb").is_err());
    }

    fn service_account_json(kind: &str) -> String {
        let mut key = serde_json::Map::new();
        for field in SERVICE_ACCOUNT_FIELDS {
            key.insert(field.to_string(), serde_json::Value::from(format!("{}-value", field)));
        }
        key.insert("type".into(), serde_json::Value::from(kind));
        serde_json::Value::Object(key).to_string()
    }

    fn temp_key(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("resort-media-keys-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn gcs_needs_a_bucket_and_a_usable_service_account() {
        let mut settings = StorageSettings {
            backend: StorageBackendKind::Gcs,
            storage_dir: PathBuf::from("./unused"),
            public_base_url: "http://localhost:3000".into(),
            gcs_bucket: None,
            gcs_service_account: Some(temp_key("key.json", &service_account_json("service_account"))),
        };
        assert_eq!(settings.connect().name(), "unconfigured");

        settings.gcs_bucket = Some("resort-media".into());
        assert_eq!(settings.connect().name(), "gcs");

        settings.gcs_service_account = None;
        assert_eq!(settings.connect().name(), "unconfigured");
    }

    #[test]
    fn unusable_service_account_keys_are_reported() {
        let missing = std::env::temp_dir().join("resort-media-no-such-key.json");
        assert!(matches!(
            check_service_account(&missing),
            Err(ConfigError::InvalidCredentials(_))
        ));

        let garbage = temp_key("garbage.json", "not json");
        assert!(matches!(
            check_service_account(&garbage),
            Err(ConfigError::InvalidCredentials(_))
        ));

        let user = temp_key("user.json", &service_account_json("authorized_user"));
        let Err(ConfigError::InvalidCredentials(detail)) = check_service_account(&user) else {
            panic!("expected an invalid key");
        };
        assert!(detail.contains("authorized_user"));

        let ok = temp_key("ok.json", &service_account_json("service_account"));
        assert!(check_service_account(&ok).is_ok());
        assert!(ConfigError::MissingCredentials.hint().contains("GOOGLE_APPLICATION_CREDENTIALS"));
    }

    #[tokio::test]
    async fn unconfigured_store_surfaces_the_config_error() {
        let store = UnconfiguredStore::new(ConfigError::MissingBucket);
        let err = store
            .save("images/x.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Config(ConfigError::MissingBucket)));
    }

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("GCS".parse::<StorageBackendKind>(), Ok(StorageBackendKind::Gcs));
        assert_eq!("fs".parse::<StorageBackendKind>(), Ok(StorageBackendKind::Local));
        assert!("s3".parse::<StorageBackendKind>().is_err());
    }

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for_key("images/1/small.jpg"), "image/jpeg");
        assert_eq!(content_type_for_key("chunks/abc/0"), "application/octet-stream");
    }
}
