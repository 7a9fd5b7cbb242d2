//! Restore-based backup verification
//!
//! A backup is only considered restorable once it has been loaded into a
//! freshly created scratch database. The scratch database is dropped again
//! whatever the restore outcome was.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use sqlx::{Connection, Executor, PgConnection};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::process::{MAX_STDERR_BYTES, run_with_timeout};
use crate::config::BackupConfig;
use crate::database::{BackupError, Result};

/// Wall-clock limit for restoring into the scratch database (10 minutes)
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Result of a verification attempt.
///
/// Verification is advisory: a failed verification is reported here and never
/// surfaces as an error of the backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    NotVerified { reason: String },
}

impl VerifyOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyOutcome::Verified)
    }
}

/// Proves that a dump archive can be restored
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupVerifier: Send + Sync {
    async fn verify(&self, dump_path: &Path) -> VerifyOutcome;
}

/// Creates and removes the disposable database used for verification
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScratchDatabase: Send + Sync {
    /// Drop the database if it exists, then create it empty
    async fn recreate(&self, name: &str) -> Result<()>;

    /// Drop the database if it exists
    async fn drop_database(&self, name: &str) -> Result<()>;
}

/// [`ScratchDatabase`] on the PostgreSQL server that hosts the source database
pub struct PgScratchDatabase {
    admin_url: String,
}

impl PgScratchDatabase {
    pub fn new(admin_url: &str) -> Self {
        Self {
            admin_url: admin_url.to_string(),
        }
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect(&self.admin_url)
            .await
            .map_err(|e| BackupError::Restore(format!("failed to connect to database server: {}", e)))
    }
}

#[async_trait]
impl ScratchDatabase for PgScratchDatabase {
    async fn recreate(&self, name: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        // DROP/CREATE DATABASE cannot run inside a transaction block, so they
        // go out as two separate simple queries.
        conn.execute(format!("DROP DATABASE IF EXISTS {}", quote_ident(name)).as_str())
            .await
            .map_err(|e| BackupError::Restore(format!("failed to drop scratch database: {}", e)))?;
        conn.execute(format!("CREATE DATABASE {}", quote_ident(name)).as_str())
            .await
            .map_err(|e| BackupError::Restore(format!("failed to create scratch database: {}", e)))?;
        let _ = conn.close().await;
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.execute(format!("DROP DATABASE IF EXISTS {}", quote_ident(name)).as_str())
            .await
            .map_err(|e| BackupError::Restore(format!("failed to drop scratch database: {}", e)))?;
        let _ = conn.close().await;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Point a connection string at another database on the same server
pub fn scratch_database_url(database_url: &str, database: &str) -> Result<String> {
    let mut url = Url::parse(database_url)
        .map_err(|e| BackupError::Config(format!("invalid database URL: {}", e)))?;
    url.set_path(&format!("/{}", database));
    Ok(url.to_string())
}

/// [`BackupVerifier`] that restores with `pg_restore` into a scratch database
pub struct RestoreVerifier {
    scratch: Arc<dyn ScratchDatabase>,
    pg_restore_path: PathBuf,
    scratch_name: String,
    scratch_url: String,
    timeout: Duration,
}

impl RestoreVerifier {
    pub fn new(config: &BackupConfig, scratch: Arc<dyn ScratchDatabase>) -> Result<Self> {
        Ok(Self {
            scratch,
            pg_restore_path: config.pg_restore_path.clone(),
            scratch_name: config.verify_database.clone(),
            scratch_url: scratch_database_url(&config.database_url, &config.verify_database)?,
            timeout: RESTORE_TIMEOUT,
        })
    }

    /// Override the restore timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(&self, dump_path: &Path) -> Vec<String> {
        vec![
            format!("--dbname={}", self.scratch_url),
            "--single-transaction".to_string(),
            "--exit-on-error".to_string(),
            "--no-owner".to_string(),
            "--no-privileges".to_string(),
            "--no-password".to_string(),
            dump_path.display().to_string(),
        ]
    }

    async fn restore(&self, dump_path: &Path) -> std::result::Result<(), String> {
        let mut command = Command::new(&self.pg_restore_path);
        command.args(self.build_args(dump_path));

        let output = run_with_timeout(command, self.timeout, MAX_STDERR_BYTES)
            .await
            .map_err(|e| e.to_string())?;

        if output.status.success() {
            debug!(stderr_bytes = output.stderr.len(), "pg_restore finished");
            Ok(())
        } else {
            Err(format!(
                "pg_restore exited with {}: {}",
                output.status,
                output.stderr.trim()
            ))
        }
    }
}

#[async_trait]
impl BackupVerifier for RestoreVerifier {
    async fn verify(&self, dump_path: &Path) -> VerifyOutcome {
        if let Err(e) = self.scratch.recreate(&self.scratch_name).await {
            warn!(database = %self.scratch_name, "could not prepare scratch database: {}", e);
            return VerifyOutcome::NotVerified {
                reason: e.to_string(),
            };
        }

        info!(file = %dump_path.display(), database = %self.scratch_name, "restoring backup into scratch database");
        let restored = self.restore(dump_path).await;

        if let Err(e) = self.scratch.drop_database(&self.scratch_name).await {
            warn!(database = %self.scratch_name, "failed to drop scratch database: {}", e);
        }

        match restored {
            Ok(()) => {
                info!(file = %dump_path.display(), "backup verified");
                VerifyOutcome::Verified
            }
            Err(reason) => {
                warn!(file = %dump_path.display(), "backup verification failed: {}", reason);
                VerifyOutcome::NotVerified { reason }
            }
        }
    }
}
