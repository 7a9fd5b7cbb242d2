//! Interval timers for the full and incremental schedules

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::config::SchedulePolicy;
use crate::database::backup::BackupType;

/// Callback that performs one backup run
pub type BackupRunner = Arc<dyn Fn(BackupType) -> BoxFuture<'static, ()> + Send + Sync>;

/// Scheduled runs still in flight
#[derive(Default)]
struct Runs {
    tasks: JoinSet<()>,
    closed: bool,
}

#[derive(Clone, Default)]
struct RunTracker(Arc<Mutex<Runs>>);

impl RunTracker {
    fn lock(&self) -> MutexGuard<'_, Runs> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) {
        self.lock().closed = false;
    }

    /// Spawn a run unless the tracker has been closed for shutdown
    fn spawn(&self, run: BoxFuture<'static, ()>) {
        let mut runs = self.lock();
        if runs.closed {
            return;
        }
        // Reap finished runs so the set only holds live ones
        while runs.tasks.try_join_next().is_some() {}
        runs.tasks.spawn(run);
    }

    fn close(&self) -> JoinSet<()> {
        let mut runs = self.lock();
        runs.closed = true;
        std::mem::take(&mut runs.tasks)
    }

    fn in_flight(&self) -> usize {
        let mut runs = self.lock();
        while runs.tasks.try_join_next().is_some() {}
        runs.tasks.len()
    }
}

/// Owns the two timer tasks and the runs they start.
///
/// Each tick spawns its run on a separate task, so a slow run never delays
/// the other schedule. [`Scheduler::stop`] cancels the timers only;
/// [`Scheduler::shutdown`] also waits for runs in flight to finish.
#[derive(Default)]
pub struct Scheduler {
    timers: Vec<JoinHandle<()>>,
    runs: RunTracker,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Scheduled runs that have not finished yet
    pub fn runs_in_flight(&self) -> usize {
        self.runs.in_flight()
    }

    /// Start both timers and trigger an immediate full run.
    ///
    /// Calling `start` on a running scheduler restarts its timers.
    pub fn start(&mut self, schedule: SchedulePolicy, runner: BackupRunner) {
        self.stop();

        info!(
            full_interval_ms = schedule.full_backup_interval.as_millis() as u64,
            incremental_interval_ms = schedule.incremental_interval.as_millis() as u64,
            "starting backup schedule"
        );

        self.runs.open();
        self.runs.spawn(runner(BackupType::Full));

        self.timers.push(spawn_timer(
            BackupType::Full,
            schedule.full_backup_interval,
            runner.clone(),
            self.runs.clone(),
        ));
        self.timers.push(spawn_timer(
            BackupType::Incremental,
            schedule.incremental_interval,
            runner,
            self.runs.clone(),
        ));
    }

    pub fn stop(&mut self) {
        if self.timers.is_empty() {
            return;
        }
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        info!("backup schedule stopped");
    }

    /// Stop the timers and wait for every scheduled run in flight
    pub async fn shutdown(&mut self) {
        self.stop();

        let mut runs = self.runs.close();
        if !runs.is_empty() {
            info!(in_flight = runs.len(), "waiting for backup runs to finish");
        }
        while let Some(result) = runs.join_next().await {
            if let Err(e) = result {
                warn!("backup run task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_timer(
    backup_type: BackupType,
    period: std::time::Duration,
    runner: BackupRunner,
    runs: RunTracker,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!(%backup_type, "schedule fired");
            runs.spawn(runner(backup_type));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_runner(full: Arc<AtomicUsize>, incremental: Arc<AtomicUsize>) -> BackupRunner {
        Arc::new(move |backup_type| {
            let counter = match backup_type {
                BackupType::Full => full.clone(),
                BackupType::Incremental => incremental.clone(),
            };
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_independently_until_stopped() {
        let full = Arc::new(AtomicUsize::new(0));
        let incremental = Arc::new(AtomicUsize::new(0));
        let schedule = SchedulePolicy {
            full_backup_interval: Duration::from_secs(3600),
            incremental_interval: Duration::from_secs(600),
        };

        let mut scheduler = Scheduler::new();
        scheduler.start(schedule, counting_runner(full.clone(), incremental.clone()));
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(3601)).await;
        // Immediate full run plus one timer tick
        assert_eq!(full.load(Ordering::SeqCst), 2);
        assert_eq!(incremental.load(Ordering::SeqCst), 6);

        scheduler.stop();
        assert!(!scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(full.load(Ordering::SeqCst), 2);
        assert_eq!(incremental.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_timers() {
        let full = Arc::new(AtomicUsize::new(0));
        let incremental = Arc::new(AtomicUsize::new(0));
        let schedule = SchedulePolicy {
            full_backup_interval: Duration::from_secs(100),
            incremental_interval: Duration::from_secs(100),
        };

        let mut scheduler = Scheduler::new();
        scheduler.start(schedule, counting_runner(full.clone(), incremental.clone()));
        scheduler.start(schedule, counting_runner(full.clone(), incremental.clone()));

        tokio::time::sleep(Duration::from_secs(101)).await;
        // Two immediate runs, then a single set of timers
        assert_eq!(full.load(Ordering::SeqCst), 3);
        assert_eq!(incremental.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_runs_in_flight() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let runner: BackupRunner = Arc::new(move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        let schedule = SchedulePolicy {
            full_backup_interval: Duration::from_secs(3600),
            incremental_interval: Duration::from_secs(3600),
        };

        let mut scheduler = Scheduler::new();
        scheduler.start(schedule, runner);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.runs_in_flight(), 1);

        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.runs_in_flight(), 0);
    }
}
