//! Database dumps through the external `pg_dump` utility
//!
//! Full backups export schema and data. Incremental backups export row data
//! only; they are a lighter periodic snapshot between full backups, not a
//! log-based incremental, and cannot be used for point-in-time recovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::backup::BackupType;
use super::backup_naming::dump_file_path;
use super::process::{MAX_STDERR_BYTES, ProcessError, run_with_timeout};
use crate::config::BackupConfig;
use crate::database::{BackupError, Result};

/// Hard wall-clock limit for a single dump (30 minutes)
pub const DUMP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How long a full dump waits for table locks before giving up
pub const LOCK_WAIT_TIMEOUT_MS: u64 = 60_000;

/// Produces a dump archive of the source database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DumpExecutor: Send + Sync {
    /// Dump the database and return the path of the written archive
    async fn dump(&self, backup_id: &str, backup_type: BackupType, started_at: DateTime<Utc>) -> Result<PathBuf>;
}

/// [`DumpExecutor`] backed by `pg_dump`
pub struct PgDumpExecutor {
    pg_dump_path: PathBuf,
    database_url: String,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl PgDumpExecutor {
    pub fn new(config: &BackupConfig) -> Self {
        Self {
            pg_dump_path: config.pg_dump_path.clone(),
            database_url: config.database_url.clone(),
            scratch_dir: config.scratch_dir.clone(),
            timeout: DUMP_TIMEOUT,
        }
    }

    /// Override the wall-clock timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments for one `pg_dump` invocation writing to `output`
    pub fn build_args(&self, backup_type: BackupType, output: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--dbname={}", self.database_url),
            "--format=custom".to_string(),
            "--compress=9".to_string(),
            "--no-password".to_string(),
            "--verbose".to_string(),
            format!("--file={}", output.display()),
        ];

        match backup_type {
            BackupType::Full => args.push(format!("--lock-wait-timeout={}", LOCK_WAIT_TIMEOUT_MS)),
            BackupType::Incremental => args.push("--data-only".to_string()),
        }

        args
    }
}

#[async_trait]
impl DumpExecutor for PgDumpExecutor {
    async fn dump(&self, backup_id: &str, backup_type: BackupType, started_at: DateTime<Utc>) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let output = dump_file_path(&self.scratch_dir, backup_type, started_at, backup_id);

        let mut command = Command::new(&self.pg_dump_path);
        command.args(self.build_args(backup_type, &output));

        info!(backup_id, %backup_type, file = %output.display(), "starting database dump");

        let result = run_with_timeout(command, self.timeout, MAX_STDERR_BYTES)
            .await
            .map_err(|e| match e {
                ProcessError::TimedOut { .. } => BackupError::Dump(format!("dump timed out: {}", e)),
                other => BackupError::Dump(other.to_string()),
            });

        let process = match result {
            Ok(process) => process,
            Err(e) => {
                remove_partial(&output).await;
                return Err(e);
            }
        };

        if !process.status.success() {
            remove_partial(&output).await;
            let code = process
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(BackupError::Dump(format!(
                "pg_dump exited with {}: {}",
                code,
                last_lines(&process.stderr, 5)
            )));
        }

        for line in process.stderr.lines().filter(|l| l.to_lowercase().contains("warning")) {
            warn!(backup_id, "pg_dump: {}", line);
        }
        debug!(backup_id, stderr_bytes = process.stderr.len(), "pg_dump finished");

        if !tokio::fs::try_exists(&output).await? {
            return Err(BackupError::Dump(format!(
                "pg_dump exited successfully but {} was not written",
                output.display()
            )));
        }

        Ok(output)
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %path.display(), "failed to remove partial dump: {}", e);
        }
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn executor(scratch_dir: &Path, pg_dump: &Path) -> PgDumpExecutor {
        let config = BackupConfig {
            database_url: "postgres://app@db:5432/app".to_string(),
            pg_dump_path: pg_dump.to_path_buf(),
            scratch_dir: scratch_dir.to_path_buf(),
            ..BackupConfig::default()
        };
        PgDumpExecutor::new(&config)
    }

    #[test]
    fn test_full_dump_arguments() {
        let exec = executor(Path::new("/scratch"), Path::new("pg_dump"));
        let args = exec.build_args(BackupType::Full, Path::new("/scratch/full.dump"));

        assert!(args.contains(&"--dbname=postgres://app@db:5432/app".to_string()));
        assert!(args.contains(&"--format=custom".to_string()));
        assert!(args.contains(&"--compress=9".to_string()));
        assert!(args.contains(&"--no-password".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
        assert!(args.contains(&"--file=/scratch/full.dump".to_string()));
        assert!(args.contains(&format!("--lock-wait-timeout={}", LOCK_WAIT_TIMEOUT_MS)));
        assert!(!args.contains(&"--data-only".to_string()));
    }

    #[test]
    fn test_incremental_dump_is_data_only() {
        let exec = executor(Path::new("/scratch"), Path::new("pg_dump"));
        let args = exec.build_args(BackupType::Incremental, Path::new("/scratch/inc.dump"));

        assert!(args.contains(&"--data-only".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--lock-wait-timeout")));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake_pg_dump.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dump_writes_archive_into_scratch_dir() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            r#"for arg in "$@"; do case "$arg" in --file=*) echo archive > "${arg#--file=}";; esac; done
echo "pg_dump: warning: there are circular foreign-key constraints" >&2"#,
        );
        let scratch = dir.path().join("scratch");
        let started_at = Utc.with_ymd_and_hms(2024, 6, 3, 4, 5, 6).unwrap();

        let path = executor(&scratch, &script)
            .dump("1-abc", BackupType::Full, started_at)
            .await
            .unwrap();

        assert_eq!(path, scratch.join("full_20240603T040506Z_1-abc.dump"));
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "archive");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_a_dump_error() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "echo 'connection refused' >&2\nexit 1");

        let err = executor(dir.path(), &script)
            .dump("1-abc", BackupType::Incremental, Utc::now())
            .await
            .unwrap_err();

        match err {
            BackupError::Dump(message) => assert!(message.contains("connection refused")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dump_timeout_is_a_dump_error() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 5");

        let err = executor(dir.path(), &script)
            .with_timeout(Duration::from_millis(100))
            .dump("1-abc", BackupType::Full, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Dump(message) if message.contains("timed out")));
    }
}
