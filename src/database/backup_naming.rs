//! Backup naming: run identifiers, scratch file names and object keys
//!
//! Identifiers start with the creation time in milliseconds so that they sort
//! chronologically, followed by a short random suffix for uniqueness across
//! processes that start a run in the same millisecond.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};

use super::backup::BackupType;

/// Extension of custom-format dump archives
pub const DUMP_EXTENSION: &str = "dump";

/// Generate a new backup ID for a run started at `timestamp`
pub fn generate_backup_id(timestamp: DateTime<Utc>) -> String {
    format!("{}-{}", timestamp.timestamp_millis(), random_suffix())
}

fn random_suffix() -> String {
    let mut rng = thread_rng();
    (0..8)
        .map(|_| rng.sample(Alphanumeric) as char)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// File name of a dump: `<type>_<timestamp>_<id>.dump`
pub fn dump_file_name(backup_type: BackupType, timestamp: DateTime<Utc>, backup_id: &str) -> String {
    format!(
        "{}_{}_{}.{}",
        backup_type,
        timestamp.format("%Y%m%dT%H%M%SZ"),
        backup_id,
        DUMP_EXTENSION
    )
}

/// Path of a dump inside the scratch directory
pub fn dump_file_path<P: AsRef<Path>>(
    scratch_dir: P,
    backup_type: BackupType,
    timestamp: DateTime<Utc>,
    backup_id: &str,
) -> PathBuf {
    scratch_dir
        .as_ref()
        .join(dump_file_name(backup_type, timestamp, backup_id))
}

/// Object key for a dump: `<prefix><type>/<yyyy>/<mm>/<dd>/<file name>`
pub fn backup_object_key(prefix: &str, backup_type: BackupType, timestamp: DateTime<Utc>, file_name: &str) -> String {
    let prefix = normalize_prefix(prefix);
    format!(
        "{}{}/{}/{}",
        prefix,
        backup_type,
        timestamp.format("%Y/%m/%d"),
        file_name
    )
}

/// Strip leading slashes and ensure a non-empty prefix ends with exactly one `/`
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}
