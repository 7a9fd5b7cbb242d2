//! Backup orchestration
//!
//! A run moves through `pending → running → uploading → [verifying] →
//! completed`, or to `failed` from any non-terminal state. Whatever happens,
//! the run is recorded exactly once, its scratch file is removed and the run
//! lock is released if this run took it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::BackupConfig;
use crate::database::backup_naming::{backup_object_key, generate_backup_id};
use crate::database::checksum::checksum_file;
use crate::database::dump::{DumpExecutor, PgDumpExecutor};
use crate::database::retention::{RetentionManager, RetentionTier, assign_tier};
use crate::database::scheduler::{BackupRunner, Scheduler};
use crate::database::state::{BackupStats, LOCK_TTL, StateStore};
use crate::database::storage::{StorageProvider, create_storage_provider};
use crate::database::verify::{BackupVerifier, PgScratchDatabase, RestoreVerifier};
use crate::database::{BackupError, Result};

/// Kind of dump taken by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Schema and data
    Full,
    /// Row data only
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(BackupError::Config(format!("unknown backup type '{}'", other))),
        }
    }
}

/// Status of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Pending,
    Running,
    Uploading,
    Verifying,
    Completed,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Uploading => "uploading",
            BackupStatus::Verifying => "verifying",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Record of one backup run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    /// Unique per run
    pub id: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub status: BackupStatus,
    /// Archive size in bytes, 0 until the dump completes
    pub size: u64,
    /// Wall-clock duration in milliseconds, set once terminal
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    /// Empty until the upload begins
    pub object_key: String,
    /// Hex SHA-256 of the archive, empty until computed
    pub checksum: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether a restore into a scratch database succeeded
    pub verified: bool,
    pub error: Option<String>,
    /// Assigned only on success
    pub retention_tier: Option<RetentionTier>,
}

impl BackupMetadata {
    pub fn new(id: String, backup_type: BackupType, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            backup_type,
            status: BackupStatus::Pending,
            size: 0,
            duration_ms: 0,
            object_key: String::new(),
            checksum: String::new(),
            started_at,
            completed_at: None,
            verified: false,
            error: None,
            retention_tier: None,
        }
    }

    fn fail(&mut self, error: &BackupError) {
        self.status = BackupStatus::Failed;
        self.error = Some(error.to_string());
    }

    fn finish(&mut self, started: Instant) {
        self.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.completed_at = Some(Utc::now());
    }
}

/// Drives backup runs and owns the backup schedule
pub struct BackupOrchestrator {
    config: BackupConfig,
    dump: Arc<dyn DumpExecutor>,
    storage: Arc<dyn StorageProvider>,
    verifier: Arc<dyn BackupVerifier>,
    state: Arc<dyn StateStore>,
    retention: RetentionManager,
    scheduler: Mutex<Scheduler>,
}

impl BackupOrchestrator {
    /// Create an orchestrator from its collaborators
    pub fn new(
        config: BackupConfig,
        dump: Arc<dyn DumpExecutor>,
        storage: Arc<dyn StorageProvider>,
        verifier: Arc<dyn BackupVerifier>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        let retention = RetentionManager::new(state.clone(), storage.clone(), config.retention);
        Self {
            config,
            dump,
            storage,
            verifier,
            state,
            retention,
            scheduler: Mutex::new(Scheduler::new()),
        }
    }

    /// Create an orchestrator with the production collaborators for `config`
    pub fn from_config(config: BackupConfig, state: Arc<dyn StateStore>) -> Result<Self> {
        let dump = Arc::new(PgDumpExecutor::new(&config));
        let storage = create_storage_provider(&config)?;
        let scratch = Arc::new(PgScratchDatabase::new(&config.database_url));
        let verifier = Arc::new(RestoreVerifier::new(&config, scratch)?);
        Ok(Self::new(config, dump, storage, verifier, state))
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Perform one backup run and return its final record.
    ///
    /// Failures are reported in the returned metadata, never as an error.
    pub async fn run_backup(&self, backup_type: BackupType) -> BackupMetadata {
        let clock = Instant::now();
        let started_at = Utc::now();
        let mut metadata = BackupMetadata::new(generate_backup_id(started_at), backup_type, started_at);
        info!(backup_id = %metadata.id, %backup_type, "backup run starting");

        let locked = match self.state.try_acquire_lock(&metadata.id, LOCK_TTL).await {
            Ok(true) => true,
            Ok(false) => {
                let holder = match self.state.lock_holder().await {
                    Ok(Some(holder)) => holder,
                    _ => String::from("unknown"),
                };
                let err = BackupError::LockContention { holder };
                warn!(backup_id = %metadata.id, "skipping backup run: {}", err);
                metadata.fail(&err);
                false
            }
            Err(e) => {
                error!(backup_id = %metadata.id, "could not acquire backup lock: {}", e);
                metadata.fail(&e);
                false
            }
        };

        let mut dump_path = None;
        if locked {
            metadata.status = BackupStatus::Running;
            if let Err(e) = self.execute(&mut metadata, &mut dump_path).await {
                error!(backup_id = %metadata.id, step = %metadata.status, "backup run failed: {}", e);
                metadata.fail(&e);
            }
        }
        metadata.finish(clock);

        if let Some(path) = dump_path {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(file = %path.display(), "failed to remove scratch dump: {}", e);
            }
        }

        if let Err(e) = self.state.record_run(&metadata).await {
            error!(backup_id = %metadata.id, "failed to record backup run: {}", e);
        }
        if let Err(e) = self.state.increment_stats(&metadata).await {
            error!(backup_id = %metadata.id, "failed to update backup stats: {}", e);
        }

        if metadata.status == BackupStatus::Completed {
            match self.retention.enforce().await {
                Ok(report) if !report.deleted.is_empty() || !report.failures.is_empty() => {
                    info!(
                        deleted = report.deleted.len(),
                        failures = report.failures.len(),
                        "retention sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("retention sweep skipped: {}", e),
            }
        }

        if locked {
            if let Err(e) = self.state.release_lock(&metadata.id).await {
                error!(backup_id = %metadata.id, "failed to release backup lock: {}", e);
            }
        }

        info!(
            backup_id = %metadata.id,
            %backup_type,
            status = %metadata.status,
            size = metadata.size,
            duration_ms = metadata.duration_ms,
            verified = metadata.verified,
            "backup run finished"
        );
        metadata
    }

    /// The hard steps of a run: dump, checksum, upload, then optional verification
    async fn execute(&self, metadata: &mut BackupMetadata, dump_path: &mut Option<PathBuf>) -> Result<()> {
        let path = self
            .dump
            .dump(&metadata.id, metadata.backup_type, metadata.started_at)
            .await?;
        *dump_path = Some(path.clone());

        metadata.size = tokio::fs::metadata(&path).await?.len();
        metadata.checksum = checksum_file(&path).await?;
        debug!(backup_id = %metadata.id, size = metadata.size, checksum = %metadata.checksum, "dump complete");

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BackupError::Dump(format!("dump path {} has no file name", path.display())))?;
        metadata.object_key = backup_object_key(
            &self.config.s3_prefix,
            metadata.backup_type,
            metadata.started_at,
            &file_name,
        );
        metadata.status = BackupStatus::Uploading;
        self.storage
            .store_backup(&path, &metadata.object_key, metadata.size)
            .await?;

        if metadata.backup_type == BackupType::Full && self.config.verify_enabled {
            metadata.status = BackupStatus::Verifying;
            metadata.verified = self.verifier.verify(&path).await.is_verified();
        }

        metadata.retention_tier = Some(assign_tier(metadata.started_at.date_naive()));
        metadata.status = BackupStatus::Completed;
        Ok(())
    }

    /// Up to `limit` recorded runs, newest first
    pub async fn list_backups(&self, limit: usize) -> Result<Vec<BackupMetadata>> {
        self.state.history(limit).await
    }

    pub async fn get_stats(&self) -> Result<BackupStats> {
        self.state.stats().await
    }

    pub async fn last_backup(&self) -> Result<Option<BackupMetadata>> {
        self.state.last_run().await
    }

    /// Download the newest completed full backup and restore-verify it.
    ///
    /// Returns `false` when there is no completed full backup. The run lock is
    /// held while the scratch database is in use, so a verification never
    /// overlaps a backup run on this or any other process.
    pub async fn verify_latest_backup(&self) -> Result<bool> {
        let history = self.state.history(self.config.history_limit).await?;
        let latest = history
            .into_iter()
            .find(|m| m.status == BackupStatus::Completed && m.backup_type == BackupType::Full);

        let Some(latest) = latest else {
            info!("no completed full backup to verify");
            return Ok(false);
        };

        let holder = format!("verify-{}", generate_backup_id(Utc::now()));
        if !self.state.try_acquire_lock(&holder, LOCK_TTL).await? {
            let holder = self
                .state
                .lock_holder()
                .await?
                .unwrap_or_else(|| String::from("unknown"));
            warn!(backup_id = %latest.id, "skipping verification: backup lock held by {}", holder);
            return Err(BackupError::LockContention { holder });
        }

        let verified = self.verify_stored(&latest).await;

        if let Err(e) = self.state.release_lock(&holder).await {
            error!(holder = %holder, "failed to release backup lock: {}", e);
        }
        verified
    }

    async fn verify_stored(&self, latest: &BackupMetadata) -> Result<bool> {
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        let download = tempfile::Builder::new()
            .prefix("verify-")
            .suffix(".dump")
            .tempfile_in(&self.config.scratch_dir)?;

        info!(backup_id = %latest.id, key = %latest.object_key, "verifying latest full backup");
        self.storage
            .retrieve_backup(&latest.object_key, download.path())
            .await?;

        Ok(self.verifier.verify(download.path()).await.is_verified())
    }

    /// Start the schedule and trigger an immediate full backup
    pub async fn start(self: &Arc<Self>) {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let runner: BackupRunner = Arc::new(move |backup_type| {
            let orchestrator = orchestrator.clone();
            async move {
                if let Some(orchestrator) = orchestrator.upgrade() {
                    orchestrator.run_backup(backup_type).await;
                }
            }
            .boxed()
        });

        self.scheduler.lock().await.start(self.config.schedule, runner);
    }

    /// Stop the schedule; runs in flight are not cancelled
    pub async fn stop(&self) {
        self.scheduler.lock().await.stop();
    }

    /// Stop the schedule and wait for scheduled runs in flight, so each one
    /// is recorded and releases the run lock before the process exits
    pub async fn shutdown(&self) {
        self.scheduler.lock().await.shutdown().await;
    }
}
