use std::path::PathBuf;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tracing::info;

use cobalt_core::config::{AwsConfig, StorageConfig};
use cobalt_core::Config;

use crate::error::StorageError;

/// Where buckets live. Each variant knows how to open one
/// [`ObjectStore`] per bucket.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    /// One subdirectory of `root` per bucket.
    Local { root: PathBuf },
    S3(AwsConfig),
    /// Process-local buckets, lost on exit.
    Memory,
}

impl StorageBackend {
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        backend_for(&config.storage, &config.aws)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Local { .. } => "local",
            StorageBackend::S3(_) => "s3",
            StorageBackend::Memory => "memory",
        }
    }

    /// Open a store scoped to `bucket`.
    pub fn open(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        validate_bucket(bucket)?;
        match self {
            StorageBackend::Local { root } => {
                let dir = root.join(bucket);
                std::fs::create_dir_all(&dir)?;
                let canonical = std::fs::canonicalize(&dir).unwrap_or(dir);
                let store = LocalFileSystem::new_with_prefix(&canonical)?;
                info!("Storage: local bucket {} at {}", bucket, canonical.display());
                Ok(Arc::new(store))
            }
            StorageBackend::S3(aws) => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_region(&aws.region)
                    .with_bucket_name(bucket);

                if let (Some(key), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
                    builder = builder
                        .with_access_key_id(key)
                        .with_secret_access_key(secret);
                    if let Some(token) = &aws.session_token {
                        builder = builder.with_token(token);
                    }
                }

                if let Some(endpoint) = aws.endpoint() {
                    builder = builder
                        .with_allow_http(endpoint.starts_with("http://"))
                        .with_endpoint(endpoint);
                }

                let store = builder.build()?;
                info!("Storage: S3 bucket s3://{} (region: {})", bucket, aws.region);
                Ok(Arc::new(store))
            }
            StorageBackend::Memory => Ok(Arc::new(InMemory::new())),
        }
    }
}

fn backend_for(storage: &StorageConfig, aws: &AwsConfig) -> Result<StorageBackend, StorageError> {
    match storage.backend.as_str() {
        "s3" => Ok(StorageBackend::S3(aws.clone())),
        "local" => Ok(StorageBackend::Local {
            root: storage.data_dir.clone(),
        }),
        other => Err(StorageError::NotConfigured(format!(
            "unknown storage backend '{other}'"
        ))),
    }
}

/// Bucket names become path components on the local backend.
fn validate_bucket(bucket: &str) -> Result<(), StorageError> {
    if bucket.is_empty() || bucket.contains('/') || bucket.contains('\\') || bucket.contains("..") {
        return Err(StorageError::InvalidBucket(bucket.to_string()));
    }
    Ok(())
}
