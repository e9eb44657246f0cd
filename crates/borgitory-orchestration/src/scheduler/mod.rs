//! # Scheduler
//!
//! A single timer loop that turns persisted schedule rows into job
//! creations at the right wall-clock times (UTC). Rows are re-read on
//! every tick, so configuration changes take effect without a restart; a
//! change notification wakes the loop early. Overlapping fires for the
//! same schedule coalesce: while a previous instance is still active the
//! new fire is recorded as missed and not enqueued.

use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use borgitory_shared::models::ScheduleRow;
use borgitory_shared::types::JobId;

use crate::manager::JobManager;

/// Cron-driven job creation over the persisted schedule table
#[derive(Debug)]
pub struct Scheduler {
    manager: Arc<JobManager>,
    tick: Duration,
    /// Last job spawned per schedule, for overlap coalescing
    active: DashMap<i64, JobId>,
    /// Fires skipped because the previous instance was still running
    missed: DashMap<i64, u64>,
    last_tick: Mutex<DateTime<Utc>>,
    reload: Notify,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(manager: Arc<JobManager>, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            manager,
            tick,
            active: DashMap::new(),
            missed: DashMap::new(),
            last_tick: Mutex::new(Utc::now()),
            reload: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Wake the loop early after schedule rows changed
    pub fn notify_changed(&self) {
        self.reload.notify_one();
    }

    pub fn missed_count(&self, schedule_id: i64) -> u64 {
        self.missed.get(&schedule_id).map(|v| *v).unwrap_or(0)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    async fn run(&self) {
        info!(tick_secs = self.tick.as_secs(), "scheduler running");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
                _ = self.reload.notified() => {}
            }
            self.process_tick(Utc::now()).await;
        }
        info!("scheduler stopped");
    }

    /// One pass over the enabled schedules: fire everything due since the
    /// previous tick. Multiple missed fire times within one window coalesce
    /// into a single run.
    pub async fn process_tick(&self, now: DateTime<Utc>) {
        let since = {
            let mut last = self.last_tick.lock().expect("tick lock");
            std::mem::replace(&mut *last, now)
        };

        let schedules = match self.manager.database().list_enabled_schedules().await {
            Ok(schedules) => schedules,
            Err(e) => {
                error!(error = %e, "could not read schedules");
                return;
            }
        };

        for row in schedules {
            if Self::due_between(&row, since, now) {
                self.fire(&row).await;
            }
        }
    }

    fn due_between(row: &ScheduleRow, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match CronSchedule::from_str(&row.cron_expr) {
            Ok(schedule) => schedule
                .after(&since)
                .take_while(|fire| *fire <= now)
                .next()
                .is_some(),
            Err(e) => {
                warn!(schedule_id = row.id, cron = %row.cron_expr, error = %e, "invalid cron expression");
                false
            }
        }
    }

    async fn fire(&self, row: &ScheduleRow) {
        // Coalesce with the previous instance of this schedule
        if let Some(previous) = self.active.get(&row.id).map(|entry| *entry) {
            let still_active = self
                .manager
                .get_job_status(previous)
                .await
                .map(|status| !status.status.is_terminal())
                .unwrap_or(false);
            if still_active {
                let missed = *self
                    .missed
                    .entry(row.id)
                    .and_modify(|count| *count += 1)
                    .or_insert(1);
                warn!(
                    schedule_id = row.id,
                    previous_job = %previous,
                    missed,
                    "previous run still active, fire recorded as missed"
                );
                return;
            }
        }

        match self.manager.run_schedule(row).await {
            Ok(job_id) => {
                debug!(schedule_id = row.id, job_id = %job_id, "schedule fired");
                self.active.insert(row.id, job_id);
            }
            Err(e) => {
                error!(schedule_id = row.id, error = %e, "schedule fire failed");
            }
        }
    }
}
