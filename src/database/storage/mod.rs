//! Storage module for backup archives
//!
//! This module provides an abstraction layer over where archives live,
//! allowing the engine to switch between an S3-compatible object store and
//! the local filesystem based on configuration.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::BackupConfig;
use crate::database::Result;

pub mod local_storage;
pub mod multipart;
pub mod s3_storage;
pub mod signing;

#[cfg(test)]
pub(crate) mod test_support;

pub use local_storage::LocalStorageProvider;
pub use s3_storage::S3StorageProvider;

/// Provides a unified interface for backup storage operations
///
/// Archives are addressed by object key; callers build keys with
/// [`crate::database::backup_naming::backup_object_key`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store a backup file under `object_key`
    ///
    /// # Arguments
    /// * `backup_path` - Path to the archive to upload
    /// * `object_key` - Destination key
    /// * `size` - Size of the archive in bytes, used to choose single or multipart upload
    async fn store_backup(&self, backup_path: &Path, object_key: &str, size: u64) -> Result<()>;

    /// Download the object at `object_key` to `destination_path`
    ///
    /// Returns [`crate::database::BackupError::BackupNotFound`] if the object does not exist.
    async fn retrieve_backup(&self, object_key: &str, destination_path: &Path) -> Result<()>;

    /// Delete the object at `object_key`; deleting a missing object succeeds
    async fn delete_backup(&self, object_key: &str) -> Result<()>;
}

/// Create a storage provider based on the current configuration
///
/// An object store is used when a bucket is configured, otherwise archives
/// are kept under the local backup directory.
pub fn create_storage_provider(config: &BackupConfig) -> Result<Arc<dyn StorageProvider>> {
    if config.uses_object_store() {
        let provider = S3StorageProvider::new(config)?;
        info!(bucket = %config.s3_bucket_name, endpoint = %config.s3_endpoint, "using object store");
        Ok(Arc::new(provider))
    } else {
        info!(dir = %config.local_backup_dir.display(), "no bucket configured, using local backup directory");
        Ok(Arc::new(LocalStorageProvider::new(config)))
    }
}
