//! Shared backup state
//!
//! The state store is the only coordination point between orchestrator
//! processes. It keeps a bounded newest-first history of finished runs, the
//! unbounded list of stored backups that retention still has to account for,
//! aggregate counters, a pointer to the last run, and the run lock. All keys
//! live under the [`NAMESPACE`] prefix.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::database::Result;
use crate::database::backup::{BackupMetadata, BackupStatus};

pub mod memory_state;
pub mod sqlite_state;

pub use memory_state::MemoryStateStore;
pub use sqlite_state::SqliteStateStore;

/// Prefix shared by every state key
pub const NAMESPACE: &str = "backup:";
pub const HISTORY_KEY: &str = "backup:history";
pub const RETAINED_KEY: &str = "backup:retained";
pub const STATS_KEY: &str = "backup:stats";
pub const LAST_RUN_KEY: &str = "backup:last_run";
pub const LOCK_KEY: &str = "backup:lock";

/// Safety-net expiry of the run lock, in case its holder crashed
pub const LOCK_TTL: Duration = Duration::from_secs(60 * 60);

/// Durable record of backup runs shared by all orchestrator processes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Prepend a finished run to the history log and point "last run" at it.
    ///
    /// A completed run with a stored object is also added to the retained
    /// list, which is not capped by the history limit.
    async fn record_run(&self, metadata: &BackupMetadata) -> Result<()>;

    /// Fold a finished run into the aggregate counters
    async fn increment_stats(&self, metadata: &BackupMetadata) -> Result<()>;

    /// Take the run lock for `holder` if nobody else holds it
    async fn try_acquire_lock(&self, holder: &str, ttl: Duration) -> Result<bool>;

    /// Release the run lock only if it is still held by `holder`
    async fn release_lock(&self, holder: &str) -> Result<bool>;

    /// Current, unexpired lock holder
    async fn lock_holder(&self) -> Result<Option<String>>;

    /// Up to `limit` history entries, newest first
    async fn history(&self, limit: usize) -> Result<Vec<BackupMetadata>>;

    /// Stored backups not yet expired by retention, newest first
    async fn retained(&self) -> Result<Vec<BackupMetadata>>;

    /// Remove a run from the history log and the retained list
    async fn remove_run(&self, backup_id: &str) -> Result<bool>;

    async fn last_run(&self) -> Result<Option<BackupMetadata>>;

    async fn stats(&self) -> Result<BackupStats>;
}

/// Whether a finished run left an object in storage that retention must track
pub(crate) fn holds_stored_object(metadata: &BackupMetadata) -> bool {
    metadata.status == BackupStatus::Completed && !metadata.object_key.is_empty()
}

/// Raw aggregate counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatCounters {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_bytes: u64,
    pub total_duration_ms: u64,
}

impl StatCounters {
    pub const TOTAL: &'static str = "total";
    pub const SUCCESSFUL: &'static str = "successful";
    pub const FAILED: &'static str = "failed";
    pub const TOTAL_BYTES: &'static str = "total_bytes";
    pub const TOTAL_DURATION_MS: &'static str = "total_duration_ms";

    /// Counter increments contributed by one finished run
    pub fn deltas(metadata: &BackupMetadata) -> Vec<(&'static str, u64)> {
        let outcome = if metadata.status == BackupStatus::Completed {
            Self::SUCCESSFUL
        } else {
            Self::FAILED
        };
        vec![
            (Self::TOTAL, 1),
            (outcome, 1),
            (Self::TOTAL_BYTES, metadata.size),
            (Self::TOTAL_DURATION_MS, metadata.duration_ms),
        ]
    }

    /// Apply a named counter value; unknown fields are ignored
    pub fn set(&mut self, field: &str, value: u64) {
        match field {
            Self::TOTAL => self.total = value,
            Self::SUCCESSFUL => self.successful = value,
            Self::FAILED => self.failed = value,
            Self::TOTAL_BYTES => self.total_bytes = value,
            Self::TOTAL_DURATION_MS => self.total_duration_ms = value,
            _ => {}
        }
    }

    pub fn add(&mut self, field: &str, delta: u64) {
        let current = match field {
            Self::TOTAL => self.total,
            Self::SUCCESSFUL => self.successful,
            Self::FAILED => self.failed,
            Self::TOTAL_BYTES => self.total_bytes,
            Self::TOTAL_DURATION_MS => self.total_duration_ms,
            _ => return,
        };
        self.set(field, current.saturating_add(delta));
    }
}

/// Aggregate statistics over every backup attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_bytes: u64,
    pub total_duration_ms: u64,
    /// Fraction of attempts that completed, in `0.0..=1.0`
    pub success_rate: f64,
    pub average_duration_ms: u64,
    pub last_run: Option<BackupMetadata>,
}

impl BackupStats {
    pub fn new(counters: StatCounters, last_run: Option<BackupMetadata>) -> Self {
        let (success_rate, average_duration_ms) = if counters.total == 0 {
            (0.0, 0)
        } else {
            (
                counters.successful as f64 / counters.total as f64,
                counters.total_duration_ms / counters.total,
            )
        };

        Self {
            total: counters.total,
            successful: counters.successful,
            failed: counters.failed,
            total_bytes: counters.total_bytes,
            total_duration_ms: counters.total_duration_ms,
            success_rate,
            average_duration_ms,
            last_run,
        }
    }
}
