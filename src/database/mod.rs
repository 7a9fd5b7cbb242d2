//! Database backup engine: dump, checksum, upload, verify, retain and record
//! periodic database backups.

// Object store providers (S3 protocol client and local filesystem fallback)
pub mod storage;

// Shared run state: history log, aggregate stats and the run lock
pub mod state;

// Engine modules
pub mod backup;
pub mod backup_naming;
pub mod checksum;
pub mod dump;
pub mod process;
pub mod retention;
pub mod scheduler;
pub mod verify;

pub use backup::{BackupMetadata, BackupOrchestrator, BackupStatus, BackupType};
pub use retention::{RetentionManager, RetentionReport, RetentionTier};
pub use state::{BackupStats, StateStore};
pub use verify::VerifyOutcome;

/// Error type for backup operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup lock is held by another run ({holder})")]
    LockContention { holder: String },

    #[error("dump failed: {0}")]
    Dump(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("restore error: {0}")]
    Restore(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backup not found")]
    BackupNotFound,
}

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::State(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BackupError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        BackupError::State(format!("migration failed: {}", error))
    }
}

impl From<reqwest::Error> for BackupError {
    fn from(error: reqwest::Error) -> Self {
        BackupError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(error: serde_json::Error) -> Self {
        BackupError::State(format!("invalid state payload: {}", error))
    }
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;
