use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::database::{BackupError, Result};

/// Default multipart part size (100 MiB)
pub const DEFAULT_MULTIPART_PART_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum number of completed backups kept per retention tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub daily_count: usize,
    pub weekly_count: usize,
    pub monthly_count: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_count: 7,
            weekly_count: 4,
            monthly_count: 12,
        }
    }
}

/// Timer periods for the two backup schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub full_backup_interval: Duration,
    pub incremental_interval: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            full_backup_interval: Duration::from_millis(86_400_000),
            incremental_interval: Duration::from_millis(3_600_000),
        }
    }
}

/// Configuration for database backup orchestration
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Connection string of the database being backed up
    pub database_url: String,
    /// Path to the `pg_dump` binary
    pub pg_dump_path: PathBuf,
    /// Path to the `pg_restore` binary
    pub pg_restore_path: PathBuf,
    /// Object store bucket; empty means the local filesystem store is used
    pub s3_bucket_name: String,
    /// Object store region used for request signing
    pub s3_region: String,
    /// Object store endpoint (path-style addressing)
    pub s3_endpoint: String,
    /// Key prefix prepended to every backup object
    pub s3_prefix: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Files larger than this are uploaded in parts of this size
    pub multipart_part_size: u64,
    /// Per-request timeout for object store calls
    pub http_timeout: Duration,
    /// Directory where dump files are written before upload
    pub scratch_dir: PathBuf,
    /// Directory used by the local filesystem store
    pub local_backup_dir: PathBuf,
    pub retention: RetentionPolicy,
    pub schedule: SchedulePolicy,
    /// Whether full backups are restore-verified after upload
    pub verify_enabled: bool,
    /// Name of the disposable database used for restore verification
    pub verify_database: String,
    /// Connection string of the shared state database
    pub state_database_url: String,
    /// Maximum number of entries kept in the history log
    pub history_limit: usize,
    /// Bind address of the HTTP query API
    pub api_addr: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let region = String::from("us-east-1");
        Self {
            database_url: String::from("postgres://postgres@localhost:5432/postgres"),
            pg_dump_path: PathBuf::from("pg_dump"),
            pg_restore_path: PathBuf::from("pg_restore"),
            s3_bucket_name: String::new(),
            s3_endpoint: default_endpoint(&region),
            s3_region: region,
            s3_prefix: String::from("backups/"),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            multipart_part_size: DEFAULT_MULTIPART_PART_SIZE,
            http_timeout: Duration::from_secs(300),
            scratch_dir: env::temp_dir().join("db-backups"),
            local_backup_dir: PathBuf::from("./backups"),
            retention: RetentionPolicy::default(),
            schedule: SchedulePolicy::default(),
            verify_enabled: true,
            verify_database: String::from("backup_verify_scratch"),
            state_database_url: String::from("sqlite:backup_state.sqlite"),
            history_limit: 100,
            api_addr: String::from("0.0.0.0:8080"),
        }
    }
}

fn default_endpoint(region: &str) -> String {
    format!("https://s3.{}.amazonaws.com", region)
}

impl BackupConfig {
    /// Load backup configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    ///
    /// Unset variables fall back to [`BackupConfig::default`]; values that are
    /// present but unparseable are rejected rather than silently defaulted.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let s3_region = lookup("AWS_REGION").unwrap_or(defaults.s3_region);
        let s3_endpoint = lookup("BACKUP_S3_ENDPOINT").unwrap_or_else(|| default_endpoint(&s3_region));

        let retention = RetentionPolicy {
            daily_count: parse_or(&lookup, "BACKUP_RETENTION_DAILY", defaults.retention.daily_count)?,
            weekly_count: parse_or(&lookup, "BACKUP_RETENTION_WEEKLY", defaults.retention.weekly_count)?,
            monthly_count: parse_or(&lookup, "BACKUP_RETENTION_MONTHLY", defaults.retention.monthly_count)?,
        };

        let schedule = SchedulePolicy {
            full_backup_interval: Duration::from_millis(parse_or(
                &lookup,
                "BACKUP_FULL_INTERVAL_MS",
                millis(defaults.schedule.full_backup_interval),
            )?),
            incremental_interval: Duration::from_millis(parse_or(
                &lookup,
                "BACKUP_INCREMENTAL_INTERVAL_MS",
                millis(defaults.schedule.incremental_interval),
            )?),
        };

        let verify_enabled = lookup("BACKUP_VERIFY")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(defaults.verify_enabled);

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            pg_dump_path: lookup("PG_DUMP_PATH").map(PathBuf::from).unwrap_or(defaults.pg_dump_path),
            pg_restore_path: lookup("PG_RESTORE_PATH").map(PathBuf::from).unwrap_or(defaults.pg_restore_path),
            s3_bucket_name: lookup("BACKUP_S3_BUCKET").unwrap_or_default(),
            s3_region,
            s3_endpoint,
            s3_prefix: lookup("BACKUP_S3_PREFIX").unwrap_or(defaults.s3_prefix),
            access_key_id: lookup("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: lookup("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            multipart_part_size: parse_or(&lookup, "BACKUP_MULTIPART_PART_SIZE", defaults.multipart_part_size)?,
            http_timeout: Duration::from_secs(parse_or(
                &lookup,
                "BACKUP_HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )?),
            scratch_dir: lookup("BACKUP_SCRATCH_DIR").map(PathBuf::from).unwrap_or(defaults.scratch_dir),
            local_backup_dir: lookup("BACKUP_LOCAL_DIR").map(PathBuf::from).unwrap_or(defaults.local_backup_dir),
            retention,
            schedule,
            verify_enabled,
            verify_database: lookup("BACKUP_VERIFY_DATABASE").unwrap_or(defaults.verify_database),
            state_database_url: lookup("BACKUP_STATE_URL").unwrap_or(defaults.state_database_url),
            history_limit: parse_or(&lookup, "BACKUP_HISTORY_LIMIT", defaults.history_limit)?,
            api_addr: lookup("BACKUP_API_ADDR").unwrap_or(defaults.api_addr),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.multipart_part_size == 0 {
            return Err(BackupError::Config("multipart part size must be greater than zero".into()));
        }
        if self.schedule.full_backup_interval.is_zero() || self.schedule.incremental_interval.is_zero() {
            return Err(BackupError::Config("schedule intervals must be greater than zero".into()));
        }
        if self.verify_database.trim().is_empty() {
            return Err(BackupError::Config("verification database name must not be empty".into()));
        }
        if !self
            .verify_database
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(BackupError::Config(format!(
                "verification database name '{}' may only contain letters, digits and underscores",
                self.verify_database
            )));
        }
        if self.history_limit == 0 {
            return Err(BackupError::Config("history limit must be greater than zero".into()));
        }
        Ok(())
    }

    /// Whether an object store bucket has been configured
    pub fn uses_object_store(&self) -> bool {
        !self.s3_bucket_name.is_empty()
    }

    /// Ensure the scratch directory exists
    pub fn ensure_scratch_dir(&self) -> std::io::Result<()> {
        if !self.scratch_dir.exists() {
            std::fs::create_dir_all(&self.scratch_dir)?;
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BackupError::Config(format!("invalid value for {}: '{}'", key, raw))),
        None => Ok(default),
    }
}
