use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, path::Path, ObjectStore};
use thiserror::Error;

use crate::config::{OutputTarget, S3Config};

/// Opens the sink for `target`, creating the local output directory when
/// needed.
pub fn new(target: &OutputTarget) -> Result<Store, anyhow::Error> {
    match target {
        OutputTarget::Local(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create output directory {}", dir.display()))?;
            let store = LocalFileSystem::new_with_prefix(dir).context("new local store")?;

            Ok(Store {
                store: Arc::new(store),
                base: "".to_string(),
                description: dir.display().to_string(),
            })
        }
        OutputTarget::S3(s3) => {
            let store = s3_store(s3).context("new s3 store")?;

            Ok(Store {
                store: Arc::new(store),
                base: s3.prefix.clone().unwrap_or_default(),
                description: format!("s3://{}", s3.bucket),
            })
        }
    }
}

fn s3_store(s3: &S3Config) -> Result<impl ObjectStore, object_store::Error> {
    AmazonS3Builder::new()
        .with_endpoint(&s3.endpoint)
        .with_region(&s3.region)
        .with_bucket_name(&s3.bucket)
        .with_access_key_id(&s3.access_key)
        .with_secret_access_key(&s3.secret_key)
        .with_allow_http(true)
        .build()
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write '{key}': {source}")]
    Write {
        key: String,
        #[source]
        source: object_store::Error,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    AlreadyPresent,
}

#[derive(Clone)]
pub struct Store {
    store: Arc<dyn ObjectStore>,
    base: String,
    description: String,
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl Store {
    /// Wraps an already built object store; keys land under `base`.
    pub fn with_object_store<S: Into<String>>(store: Arc<dyn ObjectStore>, base: S) -> Self {
        let base = base.into();
        Store {
            description: format!("{} ({})", store, base),
            store,
            base,
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.store.head(&self.join_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `bytes` under `key` unless the key is already taken. Keys are
    /// content hashes, so a taken key holds the same bytes.
    pub async fn put_if_absent(&self, key: &str, bytes: Bytes) -> Result<PutOutcome, StoreError> {
        if self.exists(key).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        self.store
            .put(&self.join_path(key), bytes)
            .await
            .map_err(|source| StoreError::Write {
                key: key.to_string(),
                source,
            })?;
        Ok(PutOutcome::Stored)
    }

    fn join_path(&self, key: &str) -> Path {
        Path::from(format!(
            "{}/{}",
            self.base.trim_end_matches('/'),
            key.trim_start_matches('/')
        ))
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn put_if_absent_skips_existing_keys() {
        let memory = Arc::new(InMemory::new());
        let store = Store::with_object_store(memory.clone(), "");

        let first = store
            .put_if_absent("abc.jpg", Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = store
            .put_if_absent("abc.jpg", Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(first, PutOutcome::Stored);
        assert_eq!(second, PutOutcome::AlreadyPresent);
        let stored = memory
            .get(&Path::from("abc.jpg"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored, Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn keys_land_under_base() {
        let memory = Arc::new(InMemory::new());
        let store = Store::with_object_store(memory.clone(), "inat/47219/");

        store
            .put_if_absent("/abc.png", Bytes::from_static(b"png"))
            .await
            .unwrap();

        assert!(memory.head(&Path::from("inat/47219/abc.png")).await.is_ok());
        assert!(store.exists("abc.png").await.unwrap());
        assert!(!store.exists("other.png").await.unwrap());
    }

    #[tokio::test]
    async fn local_target_creates_directory_and_writes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("downloaded_images_3");
        let store = new(&OutputTarget::Local(dir.clone())).unwrap();

        let outcome = store
            .put_if_absent("deadbeef.jpg", Bytes::from_static(b"jpeg"))
            .await
            .unwrap();

        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(std::fs::read(dir.join("deadbeef.jpg")).unwrap(), b"jpeg");
    }
}
