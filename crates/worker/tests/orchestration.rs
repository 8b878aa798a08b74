//! End-to-end orchestration tests: queue, leases, retry, pool, service.
//!
//! All tests run on a paused tokio clock with a seeded RNG, so backoff
//! sleeps and timeouts elapse instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use stockbridge_core::{ApiCredentials, JobId, ResourceId, Settings, StaticSettings, SyncError};
use stockbridge_queue::{
    EnqueueOptions, InMemoryJobQueue, InMemoryLockManager, InMemoryOutcomeLog, JobPayload,
    JobStatus, LockManager, OutcomeLog, OutcomeStatus, RetryPolicy, SyncOptions, with_retry,
};
use stockbridge_worker::{
    HandlerRegistry, InMemoryCommerceClient, PoolConfig, RemoteState, RunOptions, SyncContext,
    SyncService, TaskOutcome, WorkerPool, SKIP_REASON_LOCKED,
};

struct Harness {
    service: Arc<SyncService>,
    source: Arc<InMemoryCommerceClient>,
    target: Arc<InMemoryCommerceClient>,
    locks: Arc<InMemoryLockManager>,
    log: Arc<InMemoryOutcomeLog>,
    retry: RetryPolicy,
}

fn harness(config: PoolConfig) -> Harness {
    let queue = Arc::new(InMemoryJobQueue::new());
    let log = Arc::new(InMemoryOutcomeLog::new());
    let locks = Arc::new(InMemoryLockManager::new());
    let source = Arc::new(InMemoryCommerceClient::new());
    let target = Arc::new(InMemoryCommerceClient::new());
    let settings = Arc::new(StaticSettings::new(Settings {
        source: ApiCredentials::new("https://source.example", "key-a"),
        target: ApiCredentials::new("https://target.example", "key-b"),
        auto_sync_enabled: false,
        interval_minutes: 15,
    }));
    let retry = config.retry.clone();
    let ctx = SyncContext {
        source: source.clone(),
        target: target.clone(),
        settings,
        locks: locks.clone(),
        retry: retry.clone(),
        lock_ttl: config.lock_ttl,
    };
    let pool = WorkerPool::new(
        queue.clone(),
        log.clone(),
        ctx,
        HandlerRegistry::builtin(),
        config,
    );
    Harness {
        service: Arc::new(SyncService::new(queue, log.clone(), pool)),
        source,
        target,
        locks,
        log,
        retry,
    }
}

fn config() -> PoolConfig {
    PoolConfig::default().with_rng_seed(42)
}

fn resource(id: &str) -> ResourceId {
    ResourceId::new(id).unwrap()
}

fn sync_all(id: &str) -> JobPayload {
    JobPayload::SyncAll {
        resource_id: resource(id),
        options: SyncOptions::default(),
    }
}

/// Poll until the job reaches a terminal status or virtual time runs out.
async fn wait_terminal(service: &SyncService, job_id: JobId) -> JobStatus {
    for _ in 0..2000 {
        if let Some(job) = service.get(job_id).unwrap() {
            if job.status.is_terminal() {
                return job.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {job_id} never reached a terminal status");
}

async fn wait_active(service: &SyncService, job_id: JobId) {
    for _ in 0..2000 {
        let job = service.get(job_id).unwrap().unwrap();
        if job.status == JobStatus::Active {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never became active");
}

#[tokio::test(start_paused = true)]
async fn two_jobs_on_one_resource_sync_once_and_skip_once() {
    let h = harness(config().with_workers(2));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    // Per-call latency keeps the first job inside its lease while the
    // second one is claimed.
    h.source.set_latency(Duration::from_secs(2));

    let a = h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    let b = h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    h.service.start().await;

    let status_a = wait_terminal(&h.service, a).await;
    let status_b = wait_terminal(&h.service, b).await;

    // Both jobs end Completed; exactly one of them did the write, the
    // other was skipped on lock contention without consuming an attempt.
    assert_eq!(status_a, JobStatus::Completed);
    assert_eq!(status_b, JobStatus::Completed);
    assert_eq!(h.target.applied().len(), 1);
    assert_eq!(h.log.count_by_status(OutcomeStatus::Success).unwrap(), 1);
    assert_eq!(h.log.count_by_status(OutcomeStatus::Skipped).unwrap(), 1);

    // The skipped job consumed no attempts.
    let zero_attempt_jobs = [a, b]
        .iter()
        .filter(|id| h.service.get(**id).unwrap().unwrap().attempts == 0)
        .count();
    assert_eq!(zero_attempt_jobs, 1);

    let stats = h.service.pool_stats();
    assert_eq!(stats.jobs_processed, 2);
    assert_eq!(stats.jobs_succeeded, 1);
    assert_eq!(stats.jobs_skipped, 1);

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn higher_priority_jobs_are_claimed_first() {
    let h = harness(config().with_workers(1));
    h.source.set_state(resource("low"), RemoteState::new(1, 100));
    h.source.set_state(resource("high"), RemoteState::new(2, 200));

    let low = h.service.enqueue(sync_all("low"), EnqueueOptions::default()).unwrap();
    let high = h
        .service
        .enqueue(sync_all("high"), EnqueueOptions::default().with_priority(10))
        .unwrap();
    h.service.start().await;
    wait_terminal(&h.service, low).await;
    wait_terminal(&h.service, high).await;

    // The single worker claimed the high-priority job first even though
    // it was enqueued second.
    let recent = h.log.recent(20).unwrap();
    let processing: Vec<JobId> = recent
        .iter()
        .rev()
        .filter(|e| e.status == OutcomeStatus::Processing)
        .map(|e| e.job_id)
        .collect();
    assert_eq!(processing, vec![high, low]);

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff_until_success() {
    let h = harness(config().with_workers(1));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    for _ in 0..3 {
        h.source.push_failure(SyncError::transient("connection reset"));
    }

    let started = tokio::time::Instant::now();
    let id = h
        .service
        .enqueue(sync_all("map-1"), EnqueueOptions::default().with_max_attempts(5))
        .unwrap();
    h.service.start().await;

    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Completed);
    let job = h.service.get(id).unwrap().unwrap();
    assert_eq!(job.attempts, 4, "three failures then one success");
    assert_eq!(h.target.applied().len(), 1);
    // The three backoff sleeps must actually have elapsed.
    assert!(started.elapsed() >= h.retry.min_total_backoff(3));

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_fails_the_job_without_extra_attempts() {
    let h = harness(config().with_workers(1));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    for _ in 0..6 {
        h.source.push_failure(SyncError::transient("connection reset"));
    }

    let id = h
        .service
        .enqueue(sync_all("map-1"), EnqueueOptions::default().with_max_attempts(5))
        .unwrap();
    h.service.start().await;

    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Failed);
    let job = h.service.get(id).unwrap().unwrap();
    assert_eq!(job.attempts, 5);
    // Exactly five scripted failures were consumed, never a sixth.
    assert_eq!(h.source.pending_failures(), 1);
    assert!(h.target.applied().is_empty());

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn fatal_upstream_errors_are_not_retried() {
    let h = harness(config().with_workers(1));
    // Resource is unknown on the source: 404, fatal.
    let id = h
        .service
        .enqueue(sync_all("missing"), EnqueueOptions::default().with_max_attempts(5))
        .unwrap();
    h.service.start().await;

    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Failed);
    assert_eq!(h.service.get(id).unwrap().unwrap().attempts, 1);

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn a_handler_exceeding_its_budget_times_out_and_fails_the_job() {
    let h = harness(config().with_workers(1).with_job_timeout(Duration::from_secs(60)));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    h.source.set_latency(Duration::from_secs(600));

    let id = h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    h.service.start().await;

    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Failed);
    let history = h.service.history(id).unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.status, OutcomeStatus::Error);
    assert_eq!(last.message, "timeout");
    assert!(h.target.applied().is_empty());
    assert_eq!(h.service.pool_stats().jobs_timed_out, 1);

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn delayed_jobs_can_be_cancelled_before_they_run() {
    let h = harness(config().with_workers(1));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    h.service.start().await;

    let receipt = h
        .service
        .schedule(sync_all("map-1"), EnqueueOptions::default(), 10)
        .unwrap();
    assert!(h.service.cancel(receipt.job_id).unwrap());
    assert!(h.service.get(receipt.job_id).unwrap().is_none());

    // Cancelling twice, or cancelling an unknown id, is a clean no-op.
    assert!(!h.service.cancel(receipt.job_id).unwrap());
    assert!(h.target.applied().is_empty());

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retrying_a_failed_job_creates_a_fresh_one() {
    let h = harness(config().with_workers(1));
    // First run fails: resource unknown on the source.
    let id = h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    h.service.start().await;
    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Failed);

    // Fix the cause and retry.
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    let retry_id = h.service.retry(id).unwrap();
    assert_ne!(retry_id, id);
    assert_eq!(wait_terminal(&h.service, retry_id).await, JobStatus::Completed);

    // The original stays failed for the audit trail.
    assert_eq!(h.service.get(id).unwrap().unwrap().status, JobStatus::Failed);
    let retried = h.service.get(retry_id).unwrap().unwrap();
    assert_eq!(retried.created_by, format!("retry:{id}"));

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_force_stops_stuck_handlers_and_fails_their_jobs() {
    let h = harness(
        config()
            .with_workers(1)
            .with_drain_deadline(Duration::from_millis(100))
            .with_job_timeout(Duration::from_secs(3600)),
    );
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    h.source.set_latency(Duration::from_secs(1800));

    let id = h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    h.service.start().await;
    wait_active(&h.service, id).await;

    h.service.shutdown().await;

    let job = h.service.get(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let last = h.service.history(id).unwrap().into_iter().next_back().unwrap();
    assert_eq!(last.status, OutcomeStatus::Error);
    assert_eq!(last.message, "worker pool shutdown");
}

#[tokio::test(start_paused = true)]
async fn forced_shutdown_aborts_in_flight_handlers_for_good() {
    let h = harness(
        config()
            .with_workers(1)
            .with_drain_deadline(Duration::from_millis(100))
            .with_job_timeout(Duration::from_secs(3600)),
    );
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    h.source.set_latency(Duration::from_secs(120));

    let id = h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    h.service.start().await;
    wait_active(&h.service, id).await;

    h.service.shutdown().await;
    assert_eq!(h.service.get(id).unwrap().unwrap().status, JobStatus::Failed);
    assert!(h.target.applied().is_empty());

    // The handler was force-stopped with the job; its lease is long gone
    // by now, so a write landing here would race the job's re-enqueue.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(h.target.applied().is_empty(), "handler survived the force-stop");
}

#[tokio::test(start_paused = true)]
async fn job_history_is_ordered_pending_processing_terminal() {
    let h = harness(config().with_workers(1));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));
    h.service.start().await;

    // The pool is already running: the bookkeeping entry must land before
    // a worker can claim the job and stamp its own marker.
    let id = h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Completed);

    let statuses: Vec<OutcomeStatus> =
        h.service.history(id).unwrap().iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![OutcomeStatus::Pending, OutcomeStatus::Processing, OutcomeStatus::Success]
    );

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn run_task_executes_inline_and_respects_leases() {
    let h = harness(config());
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));

    let outcome = h.service.run_task(sync_all("map-1"), RunOptions::default()).await;
    match outcome {
        TaskOutcome::Success(report) => {
            assert_eq!(report.resources_synced, 1);
            assert_eq!(report.attempts, 1);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(h.target.applied().len(), 1);

    // Someone else holds the lease now, so an ad-hoc run is skipped.
    let lease = h.locks.acquire(&resource("map-1"), Duration::from_secs(30)).unwrap();
    let outcome = h.service.run_task(sync_all("map-1"), RunOptions::default()).await;
    assert_eq!(outcome, TaskOutcome::Skipped(SKIP_REASON_LOCKED.to_string()));
    assert_eq!(h.target.applied().len(), 1);
    h.locks.release(&lease.resource_id, lease.token);
}

#[tokio::test(start_paused = true)]
async fn dry_run_jobs_fetch_but_never_write() {
    let h = harness(config().with_workers(1));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));

    let id = h
        .service
        .enqueue(
            JobPayload::SyncAll {
                resource_id: resource("map-1"),
                options: SyncOptions { dry_run: true },
            },
            EnqueueOptions::default(),
        )
        .unwrap();
    h.service.start().await;

    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Completed);
    assert!(h.target.applied().is_empty());

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_jobs_survive_partial_failure() {
    let h = harness(config().with_workers(1));
    // "b" is unknown on the source and fails fatally; "a" and "c" sync.
    h.source.set_state(resource("a"), RemoteState::new(1, 100));
    h.source.set_state(resource("c"), RemoteState::new(3, 300));

    let id = h
        .service
        .enqueue(
            JobPayload::BatchSync {
                resource_ids: vec![resource("a"), resource("b"), resource("c")],
                options: SyncOptions::default(),
            },
            EnqueueOptions::default(),
        )
        .unwrap();
    h.service.start().await;

    assert_eq!(wait_terminal(&h.service, id).await, JobStatus::Failed);
    assert_eq!(h.target.applied().len(), 2);

    h.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_batch_payloads_are_rejected_at_enqueue() {
    let h = harness(config());
    let err = h
        .service
        .enqueue(
            JobPayload::BatchSync {
                resource_ids: Vec::new(),
                options: SyncOptions::default(),
            },
            EnqueueOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        stockbridge_worker::ServiceError::Invalid(SyncError::Validation(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn status_reports_queue_and_pool_state() {
    let h = harness(config().with_workers(1));
    h.source.set_state(resource("map-1"), RemoteState::new(10, 999));

    h.service.enqueue(sync_all("map-1"), EnqueueOptions::default()).unwrap();
    h.service.schedule(sync_all("map-1"), EnqueueOptions::default(), 60).unwrap();

    let report = h.service.status().unwrap();
    assert_eq!(report.waiting_count, 2, "waiting plus delayed");
    assert_eq!(report.active_count, 0);
    assert_eq!(report.recent_outcomes.len(), 2);
}

// Retry backoff determinism is a wrapper property, checked here against
// the same seeded RNG the pool derives worker streams from.
#[tokio::test(start_paused = true)]
async fn seeded_backoff_schedules_are_reproducible() {
    let policy = RetryPolicy::default();
    let mut a = StdRng::seed_from_u64(42);
    let mut b = StdRng::seed_from_u64(42);

    let run = |rng: &mut StdRng| {
        let delays: Vec<Duration> = (0..4).map(|n| policy.delay_after(n, rng)).collect();
        delays
    };
    assert_eq!(run(&mut a), run(&mut b));
}

#[tokio::test(start_paused = true)]
async fn retry_wrapper_gives_up_immediately_on_fatal_errors() {
    let policy = RetryPolicy::default().with_max_attempts(5);
    let mut rng = StdRng::seed_from_u64(1);
    let mut calls = 0u32;

    let err = with_retry(&policy, &mut rng, || {
        calls += 1;
        async { Err::<(), _>(SyncError::validation("bad payload")) }
    })
    .await
    .unwrap_err();

    assert_eq!(calls, 1);
    assert_eq!(err.attempts, 1);
}
