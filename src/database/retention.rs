//! Grandfather-father-son retention
//!
//! Every completed backup belongs to one tier, decided by the calendar date
//! it was started on. Each tier keeps a fixed number of the newest backups;
//! older ones are deleted from storage and dropped from the state store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RetentionPolicy;
use crate::database::Result;
use crate::database::backup::{BackupMetadata, BackupStatus};
use crate::database::state::StateStore;
use crate::database::storage::StorageProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTier {
    Daily,
    Weekly,
    Monthly,
}

impl fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionTier::Daily => write!(f, "daily"),
            RetentionTier::Weekly => write!(f, "weekly"),
            RetentionTier::Monthly => write!(f, "monthly"),
        }
    }
}

/// Tier of a backup started on `date`: the 1st of a month is monthly, other
/// Sundays are weekly, everything else is daily.
pub fn assign_tier(date: NaiveDate) -> RetentionTier {
    if date.day() == 1 {
        RetentionTier::Monthly
    } else if date.weekday() == Weekday::Sun {
        RetentionTier::Weekly
    } else {
        RetentionTier::Daily
    }
}

fn quota(policy: &RetentionPolicy, tier: RetentionTier) -> usize {
    match tier {
        RetentionTier::Daily => policy.daily_count,
        RetentionTier::Weekly => policy.weekly_count,
        RetentionTier::Monthly => policy.monthly_count,
    }
}

/// A backup that could not be deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionFailure {
    pub backup_id: String,
    pub error: String,
}

/// Outcome of one retention sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// IDs of backups whose objects were deleted
    pub deleted: Vec<String>,
    pub failures: Vec<RetentionFailure>,
}

pub struct RetentionManager {
    state: Arc<dyn StateStore>,
    storage: Arc<dyn StorageProvider>,
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(state: Arc<dyn StateStore>, storage: Arc<dyn StorageProvider>, policy: RetentionPolicy) -> Self {
        Self { state, storage, policy }
    }

    /// Delete completed backups beyond each tier's quota, oldest first.
    ///
    /// Individual delete failures are collected in the report and do not stop
    /// the sweep. Only a failure to read the retained list is returned as an
    /// error.
    pub async fn enforce(&self) -> Result<RetentionReport> {
        let retained = self.state.retained().await?;

        // Retained entries are newest first, so each tier's list is too
        let mut tiers: HashMap<RetentionTier, Vec<BackupMetadata>> = HashMap::new();
        for entry in retained {
            if entry.status != BackupStatus::Completed || entry.object_key.is_empty() {
                continue;
            }
            let tier = entry
                .retention_tier
                .unwrap_or_else(|| assign_tier(entry.started_at.date_naive()));
            tiers.entry(tier).or_default().push(entry);
        }

        let mut report = RetentionReport::default();
        for (tier, entries) in tiers {
            let keep = quota(&self.policy, tier);
            if entries.len() <= keep {
                continue;
            }
            debug!(%tier, count = entries.len(), keep, "tier over quota");

            for entry in entries.into_iter().skip(keep) {
                match self.storage.delete_backup(&entry.object_key).await {
                    Ok(()) => {
                        if let Err(e) = self.state.remove_run(&entry.id).await {
                            warn!(backup_id = %entry.id, "deleted backup but could not drop its state entries: {}", e);
                        }
                        info!(backup_id = %entry.id, %tier, key = %entry.object_key, "expired backup");
                        report.deleted.push(entry.id);
                    }
                    Err(e) => {
                        warn!(backup_id = %entry.id, %tier, "failed to delete expired backup: {}", e);
                        report.failures.push(RetentionFailure {
                            backup_id: entry.id,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(report)
    }
}
