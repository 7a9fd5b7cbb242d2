//! In-process implementation of the StateStore trait
//!
//! Suitable for tests and single-process deployments; nothing survives a
//! restart and the lock only excludes runs within this process.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{BackupStats, StatCounters, StateStore, holds_stored_object};
use crate::database::Result;
use crate::database::backup::BackupMetadata;

#[derive(Default)]
struct Inner {
    history: VecDeque<BackupMetadata>,
    retained: VecDeque<BackupMetadata>,
    counters: StatCounters,
    last_run: Option<BackupMetadata>,
    lock: Option<(String, Instant)>,
}

impl Inner {
    fn live_lock(&self) -> Option<&str> {
        match &self.lock {
            Some((holder, expires_at)) if *expires_at > Instant::now() => Some(holder),
            _ => None,
        }
    }
}

/// Provides backup state held in memory
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    history_limit: usize,
}

impl MemoryStateStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            history_limit,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn record_run(&self, metadata: &BackupMetadata) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.history.push_front(metadata.clone());
        inner.history.truncate(self.history_limit);
        if holds_stored_object(metadata) {
            inner.retained.push_front(metadata.clone());
        }
        inner.last_run = Some(metadata.clone());
        Ok(())
    }

    async fn increment_stats(&self, metadata: &BackupMetadata) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (field, delta) in StatCounters::deltas(metadata) {
            inner.counters.add(field, delta);
        }
        Ok(())
    }

    async fn try_acquire_lock(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live_lock().is_some() {
            return Ok(false);
        }
        inner.lock = Some((holder.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn release_lock(&self, holder: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match &inner.lock {
            Some((current, _)) if current == holder => {
                inner.lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_holder(&self) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.live_lock().map(str::to_string))
    }

    async fn history(&self, limit: usize) -> Result<Vec<BackupMetadata>> {
        let inner = self.inner.lock().await;
        Ok(inner.history.iter().take(limit).cloned().collect())
    }

    async fn retained(&self) -> Result<Vec<BackupMetadata>> {
        Ok(self.inner.lock().await.retained.iter().cloned().collect())
    }

    async fn remove_run(&self, backup_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.history.len() + inner.retained.len();
        inner.history.retain(|entry| entry.id != backup_id);
        inner.retained.retain(|entry| entry.id != backup_id);
        Ok(inner.history.len() + inner.retained.len() != before)
    }

    async fn last_run(&self) -> Result<Option<BackupMetadata>> {
        Ok(self.inner.lock().await.last_run.clone())
    }

    async fn stats(&self) -> Result<BackupStats> {
        let inner = self.inner.lock().await;
        Ok(BackupStats::new(inner.counters, inner.last_run.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::backup::{BackupStatus, BackupType};
    use chrono::Utc;

    #[tokio::test]
    async fn test_history_cap() {
        let store = MemoryStateStore::new(2);
        for id in ["a", "b", "c"] {
            let mut meta = BackupMetadata::new(id.to_string(), BackupType::Incremental, Utc::now());
            meta.status = BackupStatus::Completed;
            meta.object_key = format!("backups/incremental/{}.dump", id);
            store.record_run(&meta).await.unwrap();
        }

        let ids: Vec<String> = store.history(10).await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["c", "b"]);

        // The evicted run is still tracked for retention
        let retained: Vec<String> = store.retained().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(retained, vec!["c", "b", "a"]);
        assert!(store.remove_run("a").await.unwrap());
        assert_eq!(store.retained().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expiry_and_ownership() {
        let store = MemoryStateStore::new(10);

        assert!(store.try_acquire_lock("a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.try_acquire_lock("b", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.lock_holder().await.unwrap().is_none());
        assert!(store.try_acquire_lock("b", Duration::from_secs(10)).await.unwrap());

        assert!(!store.release_lock("a").await.unwrap());
        assert!(store.release_lock("b").await.unwrap());
    }
}
