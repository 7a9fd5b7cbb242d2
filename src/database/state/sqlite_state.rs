//! SQLite implementation of the StateStore trait
//!
//! Every process that opens the same database file shares history, counters
//! and the run lock. Each mutation is a single statement or a transaction, so
//! concurrent writers never observe a half-applied update.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, warn};

use super::{
    BackupStats, HISTORY_KEY, LAST_RUN_KEY, LOCK_KEY, RETAINED_KEY, STATS_KEY, StatCounters, StateStore,
    holds_stored_object,
};
use crate::database::Result;
use crate::database::backup::BackupMetadata;

/// Provides durable backup state in a SQLite database
pub struct SqliteStateStore {
    pool: Pool<Sqlite>,
    /// Maximum number of history entries kept
    history_limit: usize,
}

impl SqliteStateStore {
    /// Create a store on a pool whose migrations have already run
    pub fn new(pool: Pool<Sqlite>, history_limit: usize) -> Self {
        Self { pool, history_limit }
    }

    async fn read_string(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let value = sqlx::query_scalar::<_, String>(
            r#"
            SELECT value FROM state_strings
            WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn read_list(&self, key: &str, limit: i64) -> Result<Vec<BackupMetadata>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT value FROM state_lists WHERE key = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_str(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(key, "skipping unreadable list entry: {}", e),
            }
        }
        Ok(entries)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_i64_usize(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn record_run(&self, metadata: &BackupMetadata) -> Result<()> {
        let payload = serde_json::to_string(metadata)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO state_lists (key, member, value) VALUES (?, ?, ?)")
            .bind(HISTORY_KEY)
            .bind(&metadata.id)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;

        // Cap the list, dropping the oldest entries
        sqlx::query(
            r#"
            DELETE FROM state_lists
            WHERE key = ? AND seq NOT IN (
                SELECT seq FROM state_lists WHERE key = ? ORDER BY seq DESC LIMIT ?
            )
            "#,
        )
        .bind(HISTORY_KEY)
        .bind(HISTORY_KEY)
        .bind(to_i64_usize(self.history_limit))
        .execute(&mut *tx)
        .await?;

        if holds_stored_object(metadata) {
            sqlx::query("INSERT INTO state_lists (key, member, value) VALUES (?, ?, ?)")
                .bind(RETAINED_KEY)
                .bind(&metadata.id)
                .bind(&payload)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO state_strings (key, value, expires_at) VALUES (?, ?, NULL)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = NULL
            "#,
        )
        .bind(LAST_RUN_KEY)
        .bind(&payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(backup_id = %metadata.id, "recorded backup run");
        Ok(())
    }

    async fn increment_stats(&self, metadata: &BackupMetadata) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (field, delta) in StatCounters::deltas(metadata) {
            sqlx::query(
                r#"
                INSERT INTO state_hashes (key, field, value) VALUES (?, ?, ?)
                ON CONFLICT(key, field) DO UPDATE SET value = state_hashes.value + excluded.value
                "#,
            )
            .bind(STATS_KEY)
            .bind(field)
            .bind(to_i64(delta))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn try_acquire_lock(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);

        // Insert when absent; take over only when the existing lock has expired.
        let result = sqlx::query(
            r#"
            INSERT INTO state_strings (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            WHERE state_strings.expires_at IS NOT NULL AND state_strings.expires_at <= ?
            "#,
        )
        .bind(LOCK_KEY)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, holder: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM state_strings WHERE key = ? AND value = ?")
            .bind(LOCK_KEY)
            .bind(holder)
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected() > 0;
        if !released {
            warn!(holder, "backup lock was not held by this run when releasing");
        }
        Ok(released)
    }

    async fn lock_holder(&self) -> Result<Option<String>> {
        self.read_string(LOCK_KEY).await
    }

    async fn history(&self, limit: usize) -> Result<Vec<BackupMetadata>> {
        self.read_list(HISTORY_KEY, to_i64_usize(limit)).await
    }

    async fn retained(&self) -> Result<Vec<BackupMetadata>> {
        // SQLite treats a negative LIMIT as no limit
        self.read_list(RETAINED_KEY, -1).await
    }

    async fn remove_run(&self, backup_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM state_lists WHERE key IN (?, ?) AND member = ?")
            .bind(HISTORY_KEY)
            .bind(RETAINED_KEY)
            .bind(backup_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn last_run(&self) -> Result<Option<BackupMetadata>> {
        match self.read_string(LAST_RUN_KEY).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn stats(&self) -> Result<BackupStats> {
        let rows = sqlx::query("SELECT field, value FROM state_hashes WHERE key = ?")
            .bind(STATS_KEY)
            .fetch_all(&self.pool)
            .await?;

        let mut counters = StatCounters::default();
        for row in rows {
            let field: String = row.try_get("field")?;
            let value: i64 = row.try_get("value")?;
            counters.set(&field, u64::try_from(value).unwrap_or(0));
        }

        Ok(BackupStats::new(counters, self.last_run().await?))
    }
}
