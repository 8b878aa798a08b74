//! Job queue storage.
//!
//! The queue is the only owner of [`Job`] records: workers receive clones
//! through `claim_next` and report back through `ack`. Claiming is atomic;
//! two concurrent claimers never receive the same job.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use stockbridge_core::JobId;

use super::job::{Job, JobStatus};

/// Terminal report a worker hands back when acknowledging a claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletion {
    /// The job finished (including skip-on-contention, which is a
    /// successful non-operation).
    Completed { attempts: u32 },
    /// The job failed; it stays visible and actionable via `retry`.
    Failed { attempts: u32 },
}

impl JobCompletion {
    fn status(&self) -> JobStatus {
        match self {
            JobCompletion::Completed { .. } => JobStatus::Completed,
            JobCompletion::Failed { .. } => JobStatus::Failed,
        }
    }

    fn attempts(&self) -> u32 {
        match self {
            JobCompletion::Completed { attempts } | JobCompletion::Failed { attempts } => *attempts,
        }
    }
}

/// Queue error.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already enqueued: {0}")]
    AlreadyExists(JobId),
    #[error("job {id} is {status:?}, expected {expected}")]
    InvalidStatus {
        id: JobId,
        status: JobStatus,
        expected: &'static str,
    },
}

/// Count of jobs by status, for the status endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Durable holding area for pending sync work.
pub trait JobQueue: Send + Sync {
    /// Store a validated job. The job's status must be waiting or delayed.
    fn enqueue(&self, job: Job) -> Result<JobId, QueueError>;

    /// Atomically claim the highest-priority eligible job, marking it
    /// active. Ties are broken by creation time (FIFO). Returns `None`
    /// when nothing is eligible.
    fn claim_next(&self) -> Result<Option<Job>, QueueError>;

    /// Record the terminal outcome of a claimed job.
    fn ack(&self, job_id: JobId, completion: JobCompletion) -> Result<(), QueueError>;

    /// Cancel a job. Succeeds only while the job is waiting or delayed;
    /// an active job can only be bounded by its timeout.
    fn cancel(&self, job_id: JobId) -> Result<bool, QueueError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Jobs currently being executed, for the status endpoint.
    fn list_active(&self) -> Result<Vec<Job>, QueueError>;

    /// Drop terminal jobs older than `age`. Returns how many were pruned.
    fn prune(&self, age: Duration) -> Result<usize, QueueError>;
}

/// In-memory queue. The persistence boundary is a trait so a durable
/// implementation can be swapped in without touching the pool.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic claim variant used by tests.
    pub fn claim_next_at(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut jobs = self.jobs.write().expect("queue lock poisoned");

        // Highest priority first; FIFO within a priority band. Job ids are
        // time-ordered (UUIDv7), so they make a stable final tiebreak.
        let next = jobs
            .values()
            .filter(|j| !j.status.is_terminal() && j.status != JobStatus::Active)
            .filter(|j| j.is_eligible(now))
            .min_by_key(|j| (std::cmp::Reverse(j.priority), j.created_at, *j.id.as_uuid()))
            .map(|j| j.id);

        if let Some(id) = next {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Active;
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    /// Deterministic prune variant used by tests.
    pub fn prune_at(&self, age: Duration, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let cutoff = now - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut jobs = self.jobs.write().expect("queue lock poisoned");
        let before = jobs.len();
        jobs.retain(|_, j| match (j.status.is_terminal(), j.finished_at) {
            (true, Some(finished)) => finished > cutoff,
            _ => true,
        });
        Ok(before - jobs.len())
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let mut jobs = self.jobs.write().expect("queue lock poisoned");
        if jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        if job.status != JobStatus::Waiting && job.status != JobStatus::Delayed {
            return Err(QueueError::InvalidStatus {
                id: job.id,
                status: job.status,
                expected: "waiting or delayed",
            });
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        self.claim_next_at(Utc::now())
    }

    fn ack(&self, job_id: JobId, completion: JobCompletion) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().expect("queue lock poisoned");
        let job = jobs.get_mut(&job_id).ok_or(QueueError::NotFound(job_id))?;
        if job.status != JobStatus::Active {
            return Err(QueueError::InvalidStatus {
                id: job_id,
                status: job.status,
                expected: "active",
            });
        }
        job.status = completion.status();
        job.attempts = completion.attempts();
        job.finished_at = Some(Utc::now());
        Ok(())
    }

    fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().expect("queue lock poisoned");
        match jobs.get(&job_id) {
            Some(job) if job.status.is_cancellable() => {
                jobs.remove(&job_id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(QueueError::NotFound(job_id)),
        }
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let jobs = self.jobs.read().expect("queue lock poisoned");
        Ok(jobs.get(&job_id).cloned())
    }

    fn counts(&self) -> Result<QueueCounts, QueueError> {
        let jobs = self.jobs.read().expect("queue lock poisoned");
        let mut counts = QueueCounts::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn list_active(&self) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().expect("queue lock poisoned");
        let mut active: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|j| j.created_at);
        Ok(active)
    }

    fn prune(&self, age: Duration) -> Result<usize, QueueError> {
        self.prune_at(age, Utc::now())
    }
}
