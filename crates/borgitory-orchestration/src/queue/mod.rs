//! # Queue Manager
//!
//! Two bounded pools: the backup pool (jobs containing a backup task) and
//! the generic operation pool. Each pool has a four-level priority FIFO
//! admission queue; dispatch picks the highest non-empty bucket, ties
//! breaking on enqueue order. Capacity is enforced by the worker loops (one
//! per pool slot) that block on [`JobQueueManager::dequeue`]; workers are
//! woken by admit/complete signals with the configured poll interval as a
//! fallback.
//!
//! `enqueue` rejects work once the combined backlog reaches the absolute
//! cap. Cancelling a queued job removes it from its bucket so a worker
//! never picks it up.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use borgitory_shared::types::{JobId, JobKind, JobPriority};

/// Which pool a job is admitted through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Backup,
    Operation,
}

impl PoolKind {
    pub fn name(self) -> &'static str {
        match self {
            PoolKind::Backup => "backup",
            PoolKind::Operation => "operation",
        }
    }
}

/// A queued admission record
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub kind: JobKind,
    pub priority: JobPriority,
    pub enqueue_seq: u64,
}

/// Backlog and occupancy counters per pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub backup_pending: usize,
    pub backup_running: usize,
    pub operation_pending: usize,
    pub operation_running: usize,
}

#[derive(Debug, Default)]
struct Buckets {
    levels: [VecDeque<QueuedJob>; 4],
}

impl Buckets {
    fn push(&mut self, job: QueuedJob) {
        self.levels[job.priority.bucket()].push_back(job);
    }

    fn pop(&mut self) -> Option<QueuedJob> {
        self.levels.iter_mut().find_map(|level| level.pop_front())
    }

    fn remove(&mut self, job_id: JobId) -> bool {
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(|q| q.job_id == job_id) {
                level.remove(pos);
                return true;
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

#[derive(Debug)]
struct Pool {
    capacity: usize,
    queue: Mutex<Buckets>,
    running: Mutex<HashSet<JobId>>,
    notify: Notify,
}

impl Pool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(Buckets::default()),
            running: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }
}

/// Priority FIFO admission over two bounded pools
#[derive(Debug)]
pub struct JobQueueManager {
    backup: Pool,
    operation: Pool,
    max_backlog: usize,
    poll_interval: Duration,
    enqueue_seq: AtomicU64,
}

impl JobQueueManager {
    pub fn new(
        backup_capacity: usize,
        operation_capacity: usize,
        max_backlog: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backup: Pool::new(backup_capacity),
            operation: Pool::new(operation_capacity),
            max_backlog,
            poll_interval,
            enqueue_seq: AtomicU64::new(0),
        }
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::Backup => &self.backup,
            PoolKind::Operation => &self.operation,
        }
    }

    pub fn capacity(&self, kind: PoolKind) -> usize {
        self.pool(kind).capacity
    }

    /// Admit a job to its pool's queue. Returns false when the combined
    /// backlog is at the absolute cap.
    pub fn enqueue(&self, pool: PoolKind, job_id: JobId, kind: JobKind, priority: JobPriority) -> bool {
        let backlog = self.backup.queue.lock().expect("backup queue").len()
            + self.operation.queue.lock().expect("operation queue").len();
        if backlog >= self.max_backlog {
            debug!(job_id = %job_id, backlog, "enqueue rejected, backlog cap reached");
            return false;
        }

        let record = QueuedJob {
            job_id,
            kind,
            priority,
            enqueue_seq: self.enqueue_seq.fetch_add(1, Ordering::Relaxed),
        };
        let pool = self.pool(pool);
        pool.queue.lock().expect("pool queue").push(record);
        pool.notify.notify_one();
        true
    }

    /// Block until a job is available in this pool, highest priority
    /// first. Intended to be called by one worker task per pool slot; a
    /// returned job is already marked running.
    pub async fn dequeue(&self, kind: PoolKind) -> QueuedJob {
        let pool = self.pool(kind);
        loop {
            let notified = pool.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = pool.queue.lock().expect("pool queue");
                if let Some(job) = queue.pop() {
                    pool.running
                        .lock()
                        .expect("running set")
                        .insert(job.job_id);
                    debug!(job_id = %job.job_id, pool = kind.name(), priority = %job.priority, "job admitted");
                    return job;
                }
            }
            // Poll-interval fallback in case a signal was coalesced away
            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }
    }

    /// Completion callback from the runner; frees the slot
    pub fn mark_complete(&self, kind: PoolKind, job_id: JobId, success: bool) {
        let pool = self.pool(kind);
        pool.running.lock().expect("running set").remove(&job_id);
        pool.notify.notify_one();
        debug!(job_id = %job_id, pool = kind.name(), success, "job left pool");
    }

    /// Remove a still-queued job so no worker ever picks it up. Returns
    /// whether the job was found in a queue.
    pub fn cancel_queued(&self, job_id: JobId) -> bool {
        self.backup
            .queue
            .lock()
            .expect("backup queue")
            .remove(job_id)
            || self
                .operation
                .queue
                .lock()
                .expect("operation queue")
                .remove(job_id)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            backup_pending: self.backup.queue.lock().expect("backup queue").len(),
            backup_running: self.backup.running.lock().expect("running set").len(),
            operation_pending: self.operation.queue.lock().expect("operation queue").len(),
            operation_running: self.operation.running.lock().expect("running set").len(),
        }
    }

    pub fn list_running(&self) -> Vec<JobId> {
        let mut running: Vec<JobId> = self
            .backup
            .running
            .lock()
            .expect("running set")
            .iter()
            .copied()
            .collect();
        running.extend(
            self.operation
                .running
                .lock()
                .expect("running set")
                .iter()
                .copied(),
        );
        running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_manager(backlog: usize) -> JobQueueManager {
        JobQueueManager::new(1, 2, backlog, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_fifo_within_priority_level() {
        let queue = queue_manager(10);
        let first = JobId::new();
        let second = JobId::new();
        assert!(queue.enqueue(PoolKind::Operation, first, JobKind::Command, JobPriority::Normal));
        assert!(queue.enqueue(PoolKind::Operation, second, JobKind::Command, JobPriority::Normal));

        assert_eq!(queue.dequeue(PoolKind::Operation).await.job_id, first);
        assert_eq!(queue.dequeue(PoolKind::Operation).await.job_id, second);
    }

    #[tokio::test]
    async fn test_higher_priority_jumps_queue() {
        let queue = queue_manager(10);
        let normal = JobId::new();
        let high = JobId::new();
        queue.enqueue(PoolKind::Backup, normal, JobKind::ManualBackup, JobPriority::Normal);
        queue.enqueue(PoolKind::Backup, high, JobKind::ManualBackup, JobPriority::High);

        assert_eq!(queue.dequeue(PoolKind::Backup).await.job_id, high);
        assert_eq!(queue.dequeue(PoolKind::Backup).await.job_id, normal);
    }

    #[tokio::test]
    async fn test_backlog_cap_rejects() {
        let queue = queue_manager(2);
        assert!(queue.enqueue(PoolKind::Operation, JobId::new(), JobKind::Command, JobPriority::Normal));
        assert!(queue.enqueue(PoolKind::Backup, JobId::new(), JobKind::ManualBackup, JobPriority::Normal));
        // Cap counts both pools together
        assert!(!queue.enqueue(PoolKind::Operation, JobId::new(), JobKind::Command, JobPriority::Normal));
    }

    #[tokio::test]
    async fn test_cancel_queued_removes_record() {
        let queue = queue_manager(10);
        let doomed = JobId::new();
        let kept = JobId::new();
        queue.enqueue(PoolKind::Operation, doomed, JobKind::Command, JobPriority::Critical);
        queue.enqueue(PoolKind::Operation, kept, JobKind::Command, JobPriority::Low);

        assert!(queue.cancel_queued(doomed));
        assert!(!queue.cancel_queued(doomed));
        assert_eq!(queue.dequeue(PoolKind::Operation).await.job_id, kept);
    }

    #[tokio::test]
    async fn test_stats_track_pending_and_running() {
        let queue = queue_manager(10);
        let id = JobId::new();
        queue.enqueue(PoolKind::Backup, id, JobKind::ManualBackup, JobPriority::Normal);
        assert_eq!(queue.stats().backup_pending, 1);

        let admitted = queue.dequeue(PoolKind::Backup).await;
        let stats = queue.stats();
        assert_eq!(stats.backup_pending, 0);
        assert_eq!(stats.backup_running, 1);
        assert_eq!(queue.list_running(), vec![admitted.job_id]);

        queue.mark_complete(PoolKind::Backup, admitted.job_id, true);
        assert_eq!(queue.stats().backup_running, 0);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(queue_manager(10));
        let id = JobId::new();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(PoolKind::Operation).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.enqueue(PoolKind::Operation, id, JobKind::Command, JobPriority::Normal);

        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("woken")
            .expect("join");
        assert_eq!(got.job_id, id);
    }
}
