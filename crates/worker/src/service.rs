//! High-level sync service facade.
//!
//! This is the surface the rest of the application talks to: enqueue,
//! schedule, cancel, retry, inspect. It wires the queue, the outcome log
//! and the pool together and keeps the bookkeeping entries (`Pending`,
//! `Scheduled`) consistent with queue state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use stockbridge_core::{JobId, SyncError};
use stockbridge_queue::{
    EnqueueOptions, Job, JobPayload, JobQueue, OutcomeEntry, OutcomeLog, OutcomeLogError,
    OutcomeStatus, QueueCounts, QueueError,
};

use crate::pool::{PoolStats, RunOptions, TaskOutcome, WorkerPool};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Invalid(#[from] SyncError),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {0} is not in a terminal state and cannot be retried")]
    NotRetryable(JobId),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Log(#[from] OutcomeLogError),
}

/// Receipt for a scheduled job.
#[derive(Debug, Clone, Serialize)]
pub struct Scheduled {
    pub job_id: JobId,
    pub eligible_at: DateTime<Utc>,
}

/// Point-in-time view of the subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Waiting plus delayed jobs.
    pub waiting_count: usize,
    pub active_count: usize,
    pub active_jobs: Vec<Job>,
    pub recent_outcomes: Vec<OutcomeEntry>,
    pub counts: QueueCounts,
    pub pool: PoolStats,
}

/// Facade over queue, outcome log and pool.
pub struct SyncService {
    queue: Arc<dyn JobQueue>,
    log: Arc<dyn OutcomeLog>,
    pool: WorkerPool,
    recent_limit: usize,
}

impl SyncService {
    pub fn new(queue: Arc<dyn JobQueue>, log: Arc<dyn OutcomeLog>, pool: WorkerPool) -> Self {
        Self {
            queue,
            log,
            pool,
            recent_limit: 20,
        }
    }

    pub fn with_recent_limit(mut self, limit: usize) -> Self {
        self.recent_limit = limit;
        self
    }

    pub async fn start(&self) {
        self.pool.start().await;
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Validate and enqueue a job for immediate pickup.
    pub fn enqueue(&self, payload: JobPayload, opts: EnqueueOptions) -> Result<JobId, ServiceError> {
        payload.validate()?;
        let job = Job::new(payload, opts);
        let id = job.id;
        let entry = OutcomeEntry::new(
            id,
            job.payload.lock_resource().cloned(),
            job.kind(),
            OutcomeStatus::Pending,
            "queued",
            job.created_by.clone(),
        );
        // Log first: once the job is visible in the queue a worker may
        // claim it and stamp `Processing` immediately.
        self.log.append(entry)?;
        self.queue.enqueue(job)?;
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Enqueue a job that becomes eligible only after `delay_minutes`.
    pub fn schedule(
        &self,
        payload: JobPayload,
        opts: EnqueueOptions,
        delay_minutes: u64,
    ) -> Result<Scheduled, ServiceError> {
        payload.validate()?;
        let opts = opts.with_delay(Duration::from_secs(delay_minutes * 60));
        let job = Job::new(payload, opts);
        let receipt = Scheduled {
            job_id: job.id,
            eligible_at: job.eligible_at,
        };
        let entry = OutcomeEntry::new(
            job.id,
            job.payload.lock_resource().cloned(),
            job.kind(),
            OutcomeStatus::Scheduled,
            format!("scheduled for {}", receipt.eligible_at.to_rfc3339()),
            job.created_by.clone(),
        );
        self.log.append(entry)?;
        self.queue.enqueue(job)?;
        info!(job_id = %receipt.job_id, eligible_at = %receipt.eligible_at, "job scheduled");
        Ok(receipt)
    }

    /// Cancel a waiting or delayed job. Returns `Ok(false)` when the job has
    /// already started or finished; unknown jobs are not an error here.
    pub fn cancel(&self, job_id: JobId) -> Result<bool, ServiceError> {
        match self.queue.cancel(job_id) {
            Ok(cancelled) => {
                if cancelled {
                    info!(job_id = %job_id, "job cancelled");
                }
                Ok(cancelled)
            }
            Err(QueueError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-enqueue a finished job as a fresh one. The original stays in its
    /// terminal state for the audit trail; the new job carries a pointer
    /// back to it in `created_by`.
    pub fn retry(&self, job_id: JobId) -> Result<JobId, ServiceError> {
        let previous = self
            .queue
            .get(job_id)?
            .ok_or(ServiceError::UnknownJob(job_id))?;
        if !previous.status.is_terminal() {
            return Err(ServiceError::NotRetryable(job_id));
        }
        let opts = EnqueueOptions::default()
            .with_priority(previous.priority)
            .with_max_attempts(previous.max_attempts)
            .with_created_by(format!("retry:{job_id}"));
        self.enqueue(previous.payload, opts)
    }

    pub fn get(&self, job_id: JobId) -> Result<Option<Job>, ServiceError> {
        Ok(self.queue.get(job_id)?)
    }

    pub fn status(&self) -> Result<StatusReport, ServiceError> {
        let counts = self.queue.counts()?;
        let active_jobs = self.queue.list_active()?;
        Ok(StatusReport {
            waiting_count: counts.waiting + counts.delayed,
            active_count: active_jobs.len(),
            active_jobs,
            recent_outcomes: self.log.recent(self.recent_limit)?,
            counts,
            pool: self.pool.stats(),
        })
    }

    /// History of one job, oldest entry first.
    pub fn history(&self, job_id: JobId) -> Result<Vec<OutcomeEntry>, ServiceError> {
        Ok(self.log.for_job(job_id)?)
    }

    /// Delete finished jobs older than `max_age`. Returns how many were
    /// removed. The outcome log is untouched.
    pub fn prune(&self, max_age: Duration) -> Result<usize, ServiceError> {
        let removed = self.queue.prune(max_age)?;
        if removed > 0 {
            info!(removed, "pruned finished jobs");
        }
        Ok(removed)
    }

    /// Run a payload immediately on the calling path, outside the queue.
    pub async fn run_task(&self, payload: JobPayload, opts: RunOptions) -> TaskOutcome {
        self.pool.run_task(payload, opts).await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
