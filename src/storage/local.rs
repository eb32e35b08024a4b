//! Local-disk object store.
//!
//! Objects live beneath `base_path/{shard}/{shard}/{key}`, where the shards
//! are the first two bytes of `md5(key)`. Writes go to a temporary file in
//! the target directory, are fsynced and then renamed into place.

use super::{ObjectStore, StoreError, StoreResult, StoredObject, ensure_key_safe};
use async_trait::async_trait;
use bytes::Bytes;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const COPY_BUF_LEN: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    base_path: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Two-level shard identifiers for a key (`00`–`ff` each).
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Physical path of an object. Parent directories may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn open_object(&self, key: &str) -> StoreResult<File> {
        File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })
    }

    /// Create a temp file next to the final location of `key`.
    async fn temp_file(&self, key: &str) -> StoreResult<(PathBuf, PathBuf, File)> {
        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok((file_path, tmp_path, file))
    }

    /// Flush, fsync and move a finished temp file into place.
    async fn commit(&self, mut file: File, tmp_path: &Path, file_path: &Path) -> StoreResult<()> {
        let synced = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = synced {
            let _ = fs::remove_file(tmp_path).await;
            return Err(StoreError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn save(&self, key: &str, data: Bytes, _content_type: &str) -> StoreResult<StoredObject> {
        ensure_key_safe(key)?;
        let (file_path, tmp_path, mut file) = self.temp_file(key).await?;

        if let Err(err) = file.write_all(&data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        self.commit(file, &tmp_path, &file_path).await?;

        Ok(StoredObject {
            key: key.to_string(),
            size_bytes: data.len() as u64,
            etag: Some(format!("{:x}", md5::compute(&data))),
        })
    }

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
        for source in sources {
            ensure_key_safe(source)?;
        }

        let (file_path, tmp_path, mut out) = self.temp_file(destination).await?;
        let mut digest = Context::new();
        let mut size_bytes: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_LEN];

        for source in sources {
            let mut input = match self.open_object(source).await {
                Ok(input) => input,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
            loop {
                let read = match input.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        let _ = fs::remove_file(&tmp_path).await;
                        return Err(StoreError::Io(err));
                    }
                };
                digest.consume(&buf[..read]);
                size_bytes += read as u64;
                if let Err(err) = out.write_all(&buf[..read]).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            }
        }
        self.commit(out, &tmp_path, &file_path).await?;

        debug!(
            "composed {} source objects into {} ({} bytes)",
            sources.len(),
            destination,
            size_bytes
        );
        Ok(StoredObject {
            key: destination.to_string(),
            size_bytes,
            etag: Some(format!("{:x}", digest.compute())),
        })
    }

    async fn download(&self, key: &str) -> StoreResult<Bytes> {
        ensure_key_safe(key)?;
        let mut file = self.open_object(key).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()));
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/media/{}", self.public_base_url, key)
    }

    /// Write, read back and delete a marker file under the base path.
    async fn check_ready(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? != b"readyz" {
            return Err(StoreError::Io(io::Error::new(
                ErrorKind::InvalidData,
                "file content mismatch",
            )));
        }
        Ok(())
    }
}
