//! Local filesystem implementation of the StorageProvider trait
//!
//! Used when no object store bucket is configured. Object keys map to paths
//! below the local backup directory.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs as tokio_fs;
use tracing::{debug, info};

use super::StorageProvider;
use crate::config::BackupConfig;
use crate::database::{BackupError, Result};

/// Provides local filesystem storage for backup archives
pub struct LocalStorageProvider {
    /// Base directory for storing backups
    backup_dir: PathBuf,
}

impl LocalStorageProvider {
    /// Create a new LocalStorageProvider with the given configuration
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            backup_dir: config.local_backup_dir.clone(),
        }
    }

    /// Resolve an object key to a path inside the backup directory
    fn object_path(&self, object_key: &str) -> Result<PathBuf> {
        let relative = Path::new(object_key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if object_key.is_empty() || escapes {
            return Err(BackupError::Storage(format!("invalid object key '{}'", object_key)));
        }
        Ok(self.backup_dir.join(relative))
    }
}

#[async_trait]
impl StorageProvider for LocalStorageProvider {
    async fn store_backup(&self, backup_path: &Path, object_key: &str, size: u64) -> Result<()> {
        let dest_path = self.object_path(object_key)?;
        if let Some(parent) = dest_path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        tokio_fs::copy(backup_path, &dest_path).await?;
        info!(path = %dest_path.display(), size, "stored backup locally");
        Ok(())
    }

    async fn retrieve_backup(&self, object_key: &str, destination_path: &Path) -> Result<()> {
        let source_path = self.object_path(object_key)?;
        if !tokio_fs::try_exists(&source_path).await? {
            return Err(BackupError::BackupNotFound);
        }

        if let Some(parent) = destination_path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        tokio_fs::copy(&source_path, destination_path).await?;
        debug!(path = %source_path.display(), "retrieved local backup");
        Ok(())
    }

    async fn delete_backup(&self, object_key: &str) -> Result<()> {
        let path = self.object_path(object_key)?;
        match tokio_fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "deleted local backup");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
