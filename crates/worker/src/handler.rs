//! Job handlers: the sync logic executed by the pool.
//!
//! Handlers never panic past the worker boundary and never manage job
//! state themselves. They return a report or a classified error, and the
//! pool turns that into outcome-log entries and a queue ack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use stockbridge_core::{ResourceId, SettingsProvider, SyncError, SyncResult};
use stockbridge_queue::{Job, JobKind, JobPayload, LockManager, RetryPolicy, with_retry};

use crate::client::{CommerceClient, RemoteState};

/// Everything a handler needs to perform a sync, owned by the composition
/// root and shared across workers.
#[derive(Clone)]
pub struct SyncContext {
    pub source: Arc<dyn CommerceClient>,
    pub target: Arc<dyn CommerceClient>,
    pub settings: Arc<dyn SettingsProvider>,
    pub locks: Arc<dyn LockManager>,
    pub retry: RetryPolicy,
    pub lock_ttl: Duration,
}

/// What a successful handler run accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub resources_synced: u32,
    /// Upstream attempts consumed, including retries.
    pub attempts: u32,
    /// Resources skipped because their lease was held elsewhere.
    pub skipped: Vec<ResourceId>,
}

/// Classified handler failure, with the upstream attempts consumed before
/// giving up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct HandlerError {
    pub error: SyncError,
    pub attempts: u32,
}

impl HandlerError {
    /// A failure that happened before any upstream call was made.
    pub fn fatal(error: SyncError) -> Self {
        Self { error, attempts: 0 }
    }
}

impl From<stockbridge_queue::RetryError> for HandlerError {
    fn from(e: stockbridge_queue::RetryError) -> Self {
        Self {
            error: e.error,
            attempts: e.attempts,
        }
    }
}

/// Which fields of the remote state a job synchronizes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncScope {
    Inventory,
    Price,
    All,
}

impl SyncScope {
    /// Reduce a fetched state to the fields this scope writes, so a
    /// price-only sync never clobbers inventory and vice versa.
    pub fn mask(&self, state: RemoteState) -> RemoteState {
        match self {
            SyncScope::Inventory => RemoteState {
                quantity: state.quantity,
                price_cents: None,
            },
            SyncScope::Price => RemoteState {
                quantity: None,
                price_cents: state.price_cents,
            },
            SyncScope::All => state,
        }
    }
}

/// A registered executor for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        job: &Job,
        ctx: &SyncContext,
        rng: &mut StdRng,
    ) -> Result<SyncReport, HandlerError>;
}

/// One fetch-and-apply pass for a single resource. Idempotent, so the
/// retry wrapper may re-run it as a whole.
async fn sync_once(
    ctx: &SyncContext,
    resource_id: &ResourceId,
    scope: SyncScope,
    dry_run: bool,
) -> SyncResult<()> {
    let state = ctx.source.fetch_remote_state(resource_id).await?;
    let update = scope.mask(state);
    if dry_run {
        tracing::debug!(%resource_id, ?update, "dry run, skipping apply");
        return Ok(());
    }
    ctx.target.apply_local_update(resource_id, update).await
}

/// Handler for the three single-resource job kinds.
pub struct PlatformSyncHandler {
    scope: SyncScope,
}

impl PlatformSyncHandler {
    pub fn new(scope: SyncScope) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl JobHandler for PlatformSyncHandler {
    async fn run(
        &self,
        job: &Job,
        ctx: &SyncContext,
        rng: &mut StdRng,
    ) -> Result<SyncReport, HandlerError> {
        // Settings are polled at job start; missing credentials abort the
        // attempt before any upstream call.
        ctx.settings.settings().map_err(HandlerError::fatal)?;

        let resource_id = job.payload.lock_resource().ok_or_else(|| {
            HandlerError::fatal(SyncError::validation(
                "batch payload routed to single-resource handler",
            ))
        })?;
        let dry_run = job.payload.options().dry_run;
        let policy = ctx.retry.clone().with_max_attempts(job.max_attempts);

        let attempted = with_retry(&policy, rng, || {
            sync_once(ctx, resource_id, self.scope, dry_run)
        })
        .await?;

        Ok(SyncReport {
            resources_synced: 1,
            attempts: attempted.attempts,
            skipped: Vec::new(),
        })
    }
}

/// Handler for batch jobs: leases each resource individually and skips the
/// ones whose lease is held elsewhere.
pub struct BatchSyncHandler;

#[async_trait]
impl JobHandler for BatchSyncHandler {
    async fn run(
        &self,
        job: &Job,
        ctx: &SyncContext,
        rng: &mut StdRng,
    ) -> Result<SyncReport, HandlerError> {
        ctx.settings.settings().map_err(HandlerError::fatal)?;

        let JobPayload::BatchSync { resource_ids, options } = &job.payload else {
            return Err(HandlerError::fatal(SyncError::validation(
                "single-resource payload routed to batch handler",
            )));
        };
        let policy = ctx.retry.clone().with_max_attempts(job.max_attempts);

        let mut report = SyncReport::default();
        let mut first_error: Option<SyncError> = None;
        let mut failed = 0u32;

        for resource_id in resource_ids {
            let Some(lease) = ctx.locks.acquire(resource_id, ctx.lock_ttl) else {
                report.skipped.push(resource_id.clone());
                continue;
            };

            let result = with_retry(&policy, rng, || {
                sync_once(ctx, resource_id, SyncScope::All, options.dry_run)
            })
            .await;
            ctx.locks.release(&lease.resource_id, lease.token);

            match result {
                Ok(attempted) => {
                    report.resources_synced += 1;
                    report.attempts += attempted.attempts;
                }
                Err(e) => {
                    failed += 1;
                    report.attempts += e.attempts;
                    warn!(job_id = %job.id, %resource_id, error = %e.error, "batch resource failed");
                    first_error.get_or_insert(e.error);
                }
            }
        }

        // The batch keeps going past individual failures; the job itself
        // fails if any resource did, surfacing the first error.
        match first_error {
            None => Ok(report),
            Some(error) => {
                warn!(
                    job_id = %job.id,
                    failed,
                    total = resource_ids.len(),
                    "batch finished with failures"
                );
                Err(HandlerError {
                    error,
                    attempts: report.attempts,
                })
            }
        }
    }
}

/// Routing table from job kind to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn resolve(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// The four built-in sync handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            JobKind::SyncInventory,
            Arc::new(PlatformSyncHandler::new(SyncScope::Inventory)),
        );
        registry.register(
            JobKind::SyncPrice,
            Arc::new(PlatformSyncHandler::new(SyncScope::Price)),
        );
        registry.register(
            JobKind::SyncAll,
            Arc::new(PlatformSyncHandler::new(SyncScope::All)),
        );
        registry.register(JobKind::BatchSync, Arc::new(BatchSyncHandler));
        registry
    }
}
