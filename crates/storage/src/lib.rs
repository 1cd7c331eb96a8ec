//! Bucket/key blob storage over `object_store`.
//!
//! [`ObjectStorage`] is the port the ingest engine talks to. [`BucketStorage`]
//! implements it on top of a [`StorageBackend`], opening one store per bucket
//! on first use and caching it.

pub mod backend;
pub mod compress;
pub mod error;

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub use backend::StorageBackend;
pub use compress::gzip;
pub use error::StorageError;

/// A fetched object, spooled to an anonymous temp file that is removed when
/// the handle is dropped. The file is positioned at the start.
#[derive(Debug)]
pub struct Blob {
    pub file: std::fs::File,
    pub size: u64,
}

impl Blob {
    /// Read the whole object into memory.
    pub fn into_bytes(mut self) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::with_capacity(self.size as usize);
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Get/put a named blob by bucket and key.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch an object. A missing object is [`StorageError::NotFound`].
    async fn get(&self, bucket: &str, key: &str) -> Result<Blob, StorageError>;

    /// Store an object, replacing any existing one.
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError>;
}

pub struct BucketStorage {
    backend: StorageBackend,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl BucketStorage {
    pub fn new(backend: StorageBackend) -> Self {
        Self {
            backend,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &cobalt_core::Config) -> Result<Self, StorageError> {
        Ok(Self::new(StorageBackend::from_config(config)?))
    }

    pub fn memory() -> Self {
        Self::new(StorageBackend::Memory)
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(StorageBackend::Local { root: root.into() })
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let mut stores = self
            .stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }
        let store = self.backend.open(bucket)?;
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

#[async_trait]
impl ObjectStorage for BucketStorage {
    async fn get(&self, bucket: &str, key: &str) -> Result<Blob, StorageError> {
        let store = self.store(bucket)?;
        let result = match store.get(&Path::from(key)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut spool = tokio::fs::File::from_std(tempfile::tempfile()?);
        let mut stream = result.into_stream();
        let mut size = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            size += chunk.len() as u64;
            spool.write_all(&chunk).await?;
        }
        spool.flush().await?;

        let mut file = spool.into_std().await;
        file.seek(SeekFrom::Start(0))?;
        debug!(bucket, key, size, "Fetched object");
        Ok(Blob { file, size })
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        let store = self.store(bucket)?;
        let size = body.len();
        store.put(&Path::from(key), body.into()).await?;
        debug!(bucket, key, size, "Stored object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_put_then_get() {
        let storage = BucketStorage::memory();
        storage
            .put("processed", "acme/doc1.pdf", Bytes::from_static(b"%PDF-1.4"))
            .await
            .unwrap();
        let blob = storage.get("processed", "acme/doc1.pdf").await.unwrap();
        assert_eq!(blob.size, 8);
        assert_eq!(blob.into_bytes().unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn buckets_are_isolated() {
        let storage = BucketStorage::memory();
        storage.put("a", "k", Bytes::from_static(b"x")).await.unwrap();
        let err = storage.get("b", "k").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn local_round_trip_lands_under_bucket_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BucketStorage::local(tmp.path());
        storage
            .put("processed", "oup/article.xml.gz", Bytes::from_static(b"gz"))
            .await
            .unwrap();
        assert!(tmp.path().join("processed/oup/article.xml.gz").is_file());
        let blob = storage.get("processed", "oup/article.xml.gz").await.unwrap();
        assert_eq!(blob.into_bytes().unwrap(), b"gz");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BucketStorage::local(tmp.path());
        let err = storage.get("raw", "files/acme/none.tar").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }
}
