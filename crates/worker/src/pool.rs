//! Fixed-size worker pool.
//!
//! Workers share one logical queue and one logical lock table. Claiming is
//! the only place job ownership transfers; lease, handler execution,
//! timeout, outcome entry and ack all happen inside the worker that won
//! the claim. A handler crash is contained to its own task; the pool
//! records the failure and keeps running.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use stockbridge_core::{ErrorKind, JobId, SyncError};
use stockbridge_queue::{
    Job, JobCompletion, JobPayload, JobQueue, Lease, LockManager, OutcomeDetails, OutcomeEntry,
    OutcomeLog, OutcomeStatus, RetryPolicy,
};

use crate::handler::{HandlerError, HandlerRegistry, SyncContext, SyncReport};

/// Reason string recorded when a job loses the lock race.
pub const SKIP_REASON_LOCKED: &str = "resource locked";

/// Pool configuration. Both the lock TTL and the job timeout are explicit
/// here rather than hard-coded at call sites.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// How long an idle worker sleeps between claim attempts.
    pub poll_interval: Duration,
    /// Wall-clock budget for one handler execution.
    pub job_timeout: Duration,
    /// TTL of the lease taken for single-resource jobs.
    pub lock_ttl: Duration,
    /// How long shutdown waits for active handlers before force-stopping.
    pub drain_deadline: Duration,
    pub retry: RetryPolicy,
    /// Seed for backoff jitter; `None` seeds from entropy. Each worker
    /// derives its own stream from this.
    pub rng_seed: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_millis(100),
            job_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(30),
            drain_deadline: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            rng_seed: None,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_drain_deadline(mut self, deadline: Duration) -> Self {
        self.drain_deadline = deadline;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

/// Pool runtime counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub jobs_timed_out: u64,
}

/// Result of one dispatched task, reported back to the caller as a tagged
/// variant rather than an untyped blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(SyncReport),
    Skipped(String),
    Error { kind: ErrorKind, detail: String },
}

/// Options for an ad-hoc `run_task` execution. Unset fields fall back to
/// the pool configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub lock_ttl: Option<Duration>,
    /// Set to `true` to run without leasing (caller already holds it).
    pub skip_lock: bool,
    pub max_attempts: Option<u32>,
}

struct PoolInner {
    queue: Arc<dyn JobQueue>,
    log: Arc<dyn OutcomeLog>,
    ctx: SyncContext,
    registry: HandlerRegistry,
    config: PoolConfig,
    shutting_down: AtomicBool,
    stats: std::sync::Mutex<PoolStats>,
    /// Abort handles of handler tasks currently executing, keyed by job.
    /// Force-stop must kill these too: a worker aborted mid-join would
    /// otherwise detach its handler, which would keep mutating the
    /// external platforms after its lease expired and its job was failed.
    inflight: std::sync::Mutex<HashMap<JobId, AbortHandle>>,
}

/// The worker pool. Owned by the process composition root; construction is
/// explicit and there is no global "initialized" flag.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        log: Arc<dyn OutcomeLog>,
        ctx: SyncContext,
        registry: HandlerRegistry,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                queue,
                log,
                ctx,
                registry,
                config,
                shutting_down: AtomicBool::new(false),
                stats: std::sync::Mutex::new(PoolStats::default()),
                inflight: std::sync::Mutex::new(HashMap::new()),
            }),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks. Calling `start` twice is a no-op.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }
        for index in 0..self.inner.config.workers {
            let inner = self.inner.clone();
            handles.push(tokio::spawn(worker_loop(inner, index)));
        }
        info!(workers = self.inner.config.workers, "worker pool started");
    }

    /// Graceful shutdown: stop claiming, drain active handlers up to the
    /// drain deadline, then force-stop and mark leftover active jobs
    /// failed so an external caller can re-enqueue them.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let mut handles = self.handles.lock().await;

        let deadline = tokio::time::Instant::now() + self.inner.config.drain_deadline;
        for handle in handles.drain(..) {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("drain deadline hit, force-stopping worker");
                abort.abort();
            }
        }

        // Aborting a worker mid-join detaches its handler task. Kill the
        // handlers too, before their jobs are handed back for re-enqueue.
        let stuck: Vec<(JobId, AbortHandle)> = self
            .inner
            .inflight
            .lock()
            .expect("inflight table poisoned")
            .drain()
            .collect();
        for (job_id, abort) in stuck {
            warn!(%job_id, "aborting in-flight handler");
            abort.abort();
        }

        // Anything still active was force-stopped mid-handler.
        match self.inner.queue.list_active() {
            Ok(active) => {
                for job in active {
                    let entry = OutcomeEntry::new(
                        job.id,
                        job.payload.lock_resource().cloned(),
                        job.kind(),
                        OutcomeStatus::Error,
                        "worker pool shutdown",
                        "pool",
                    )
                    .with_details(OutcomeDetails::Failure {
                        kind: ErrorKind::Internal,
                        detail: "force-stopped during shutdown".to_string(),
                        attempts: job.attempts,
                    });
                    if let Err(e) = self.inner.log.append(entry) {
                        warn!(job_id = %job.id, error = %e, "failed to log shutdown outcome");
                    }
                    if let Err(e) = self
                        .inner
                        .queue
                        .ack(job.id, JobCompletion::Failed { attempts: job.attempts })
                    {
                        warn!(job_id = %job.id, error = %e, "failed to fail job on shutdown");
                    }
                }
            }
            Err(e) => error!(error = %e, "could not list active jobs during shutdown"),
        }
        info!("worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.lock().expect("stats poisoned").clone()
    }

    /// Single ad-hoc execution outside the main loop (e.g. a manual sync
    /// from the admin UI). Follows the identical lock/timeout/retry
    /// contract as pool-dispatched jobs, including outcome logging.
    pub async fn run_task(&self, payload: JobPayload, opts: RunOptions) -> TaskOutcome {
        if let Err(e) = payload.validate() {
            return TaskOutcome::Error {
                kind: e.kind(),
                detail: e.to_string(),
            };
        }

        let max_attempts = opts
            .max_attempts
            .unwrap_or(self.inner.config.retry.max_attempts);
        let job = Job::new(
            payload,
            stockbridge_queue::EnqueueOptions::default()
                .with_max_attempts(max_attempts)
                .with_created_by("ad-hoc"),
        );

        let mut rng = make_rng(self.inner.config.rng_seed, u64::MAX);
        let timeout = opts.timeout.unwrap_or(self.inner.config.job_timeout);
        let lock_ttl = opts.lock_ttl.unwrap_or(self.inner.config.lock_ttl);

        let lease = if opts.skip_lock {
            None
        } else {
            match take_lease(&self.inner, &job, lock_ttl) {
                Ok(lease) => lease,
                Err(outcome) => {
                    record_skip(&self.inner, &job, "ad-hoc");
                    return outcome;
                }
            }
        };

        let started = tokio::time::Instant::now();
        let result = run_with_timeout(&self.inner, &job, timeout, &mut rng).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        release_lease(&self.inner, lease);
        record_outcome(&self.inner, &job, "ad-hoc", &result, elapsed_ms);

        match result {
            Ok(report) => TaskOutcome::Success(report),
            Err(e) => TaskOutcome::Error {
                kind: e.error.kind(),
                detail: e.error.to_string(),
            },
        }
    }
}

fn make_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

async fn worker_loop(inner: Arc<PoolInner>, index: usize) {
    let worker = format!("worker-{index}");
    let mut rng = make_rng(inner.config.rng_seed, index as u64);
    info!(%worker, "sync worker started");

    loop {
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        match inner.queue.claim_next() {
            Ok(Some(job)) => {
                debug!(%worker, job_id = %job.id, kind = %job.kind(), "claimed job");
                execute_claimed(&inner, &worker, job, &mut rng).await;
            }
            Ok(None) => tokio::time::sleep(inner.config.poll_interval).await,
            Err(e) => {
                error!(%worker, error = %e, "failed to claim job");
                tokio::time::sleep(inner.config.poll_interval).await;
            }
        }
    }

    info!(%worker, "sync worker stopped");
}

/// Run one claimed job to a terminal state. Never propagates an error:
/// every failure path ends in an outcome entry and a queue ack.
async fn execute_claimed(inner: &Arc<PoolInner>, worker: &str, job: Job, rng: &mut StdRng) {
    let processing = OutcomeEntry::new(
        job.id,
        job.payload.lock_resource().cloned(),
        job.kind(),
        OutcomeStatus::Processing,
        format!("claimed by {worker}"),
        worker,
    );
    if let Err(e) = inner.log.append(processing) {
        warn!(job_id = %job.id, error = %e, "failed to log processing marker");
    }

    let lease = match take_lease(inner, &job, inner.config.lock_ttl) {
        Ok(lease) => lease,
        Err(_) => {
            // Lost the lock race: a successful non-operation, not an
            // error, and no retry attempt is consumed.
            record_skip(inner, &job, worker);
            if let Err(e) = inner.queue.ack(job.id, JobCompletion::Completed { attempts: 0 }) {
                error!(job_id = %job.id, error = %e, "failed to ack skipped job");
            }
            let mut stats = inner.stats.lock().expect("stats poisoned");
            stats.jobs_processed += 1;
            stats.jobs_skipped += 1;
            return;
        }
    };

    let started = tokio::time::Instant::now();
    let result = run_with_timeout(inner, &job, inner.config.job_timeout, rng).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    release_lease(inner, lease);
    record_outcome(inner, &job, worker, &result, elapsed_ms);

    let completion = match &result {
        Ok(report) => JobCompletion::Completed { attempts: report.attempts },
        Err(e) => JobCompletion::Failed { attempts: e.attempts },
    };
    if let Err(e) = inner.queue.ack(job.id, completion) {
        error!(job_id = %job.id, error = %e, "failed to ack job");
    }

    let mut stats = inner.stats.lock().expect("stats poisoned");
    stats.jobs_processed += 1;
    match &result {
        Ok(_) => stats.jobs_succeeded += 1,
        Err(e) => {
            stats.jobs_failed += 1;
            if matches!(e.error, SyncError::Timeout(_)) {
                stats.jobs_timed_out += 1;
            }
        }
    }
}

/// Acquire the job's lease if its payload names one. `Err` carries the
/// skip outcome for the caller to return.
fn take_lease(
    inner: &Arc<PoolInner>,
    job: &Job,
    ttl: Duration,
) -> Result<Option<Lease>, TaskOutcome> {
    match job.payload.lock_resource() {
        None => Ok(None),
        Some(resource_id) => match inner.ctx.locks.acquire(resource_id, ttl) {
            Some(lease) => Ok(Some(lease)),
            None => Err(TaskOutcome::Skipped(SKIP_REASON_LOCKED.to_string())),
        },
    }
}

fn release_lease(inner: &Arc<PoolInner>, lease: Option<Lease>) {
    if let Some(lease) = lease {
        if !inner.ctx.locks.release(&lease.resource_id, lease.token) {
            // Lease expired mid-run; the next holder owns it now.
            warn!(resource_id = %lease.resource_id, "lease no longer ours at release");
        }
    }
}

/// Execute the handler for `job` in its own task, bounded by `timeout`.
///
/// Spawning isolates handler panics: a crash becomes a classified error
/// here instead of tearing down the worker.
async fn run_with_timeout(
    inner: &Arc<PoolInner>,
    job: &Job,
    timeout: Duration,
    rng: &mut StdRng,
) -> Result<SyncReport, HandlerError> {
    let Some(handler) = inner.registry.resolve(job.kind()) else {
        return Err(HandlerError::fatal(SyncError::validation(format!(
            "no handler for job kind {}",
            job.kind()
        ))));
    };

    let job_id = job.id;
    let ctx = inner.ctx.clone();
    let job = job.clone();
    let mut task_rng = StdRng::seed_from_u64(rng.r#gen());
    let handle = tokio::spawn(async move { handler.run(&job, &ctx, &mut task_rng).await });
    let abort = handle.abort_handle();
    inner
        .inflight
        .lock()
        .expect("inflight table poisoned")
        .insert(job_id, abort.clone());

    let result = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(HandlerError::fatal(SyncError::Internal(format!(
            "handler crashed: {join_err}"
        )))),
        Err(_) => {
            abort.abort();
            Err(HandlerError {
                error: SyncError::Timeout(timeout),
                attempts: 1,
            })
        }
    };
    inner
        .inflight
        .lock()
        .expect("inflight table poisoned")
        .remove(&job_id);
    result
}

fn record_skip(inner: &Arc<PoolInner>, job: &Job, by: &str) {
    let entry = OutcomeEntry::new(
        job.id,
        job.payload.lock_resource().cloned(),
        job.kind(),
        OutcomeStatus::Skipped,
        SKIP_REASON_LOCKED,
        by,
    )
    .with_details(OutcomeDetails::Skip {
        reason: SKIP_REASON_LOCKED.to_string(),
    });
    if let Err(e) = inner.log.append(entry) {
        warn!(job_id = %job.id, error = %e, "failed to log skip");
    }
}

fn record_outcome(
    inner: &Arc<PoolInner>,
    job: &Job,
    by: &str,
    result: &Result<SyncReport, HandlerError>,
    elapsed_ms: u64,
) {
    let entry = match result {
        Ok(report) => OutcomeEntry::new(
            job.id,
            job.payload.lock_resource().cloned(),
            job.kind(),
            OutcomeStatus::Success,
            format!("synced {} resource(s)", report.resources_synced),
            by,
        )
        .with_details(OutcomeDetails::Execution {
            attempts: report.attempts,
            elapsed_ms,
        }),
        Err(e) => {
            let message = match e.error {
                SyncError::Timeout(_) => "timeout".to_string(),
                _ => e.error.to_string(),
            };
            OutcomeEntry::new(
                job.id,
                job.payload.lock_resource().cloned(),
                job.kind(),
                OutcomeStatus::Error,
                message,
                by,
            )
            .with_details(OutcomeDetails::Failure {
                kind: e.error.kind(),
                detail: e.error.to_string(),
                attempts: e.attempts,
            })
        }
    };
    if let Err(e) = inner.log.append(entry) {
        warn!(job_id = %job.id, error = %e, "failed to log outcome");
    }
}
