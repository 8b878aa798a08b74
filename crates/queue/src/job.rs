//! Job model: typed payloads, status lifecycle, enqueue options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockbridge_core::{JobId, ResourceId, SyncError, SyncResult};

/// Kind of sync work a job requests, used to route to a handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    SyncInventory,
    SyncPrice,
    SyncAll,
    BatchSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncInventory => "sync-inventory",
            JobKind::SyncPrice => "sync-price",
            JobKind::SyncAll => "sync-all",
            JobKind::BatchSync => "batch-sync",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job sync options carried in the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Fetch and diff but do not write to the target platform.
    #[serde(default)]
    pub dry_run: bool,
}

/// Typed job payload.
///
/// A closed set of variants rather than a free-form blob, so payloads are
/// validated at enqueue time and handlers never parse untyped JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    /// Sync the inventory level of one product mapping.
    SyncInventory {
        resource_id: ResourceId,
        #[serde(default)]
        options: SyncOptions,
    },
    /// Sync the price of one product mapping.
    SyncPrice {
        resource_id: ResourceId,
        #[serde(default)]
        options: SyncOptions,
    },
    /// Sync both inventory and price of one product mapping.
    SyncAll {
        resource_id: ResourceId,
        #[serde(default)]
        options: SyncOptions,
    },
    /// Sync a set of product mappings; each resource is leased individually.
    BatchSync {
        resource_ids: Vec<ResourceId>,
        #[serde(default)]
        options: SyncOptions,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::SyncInventory { .. } => JobKind::SyncInventory,
            JobPayload::SyncPrice { .. } => JobKind::SyncPrice,
            JobPayload::SyncAll { .. } => JobKind::SyncAll,
            JobPayload::BatchSync { .. } => JobKind::BatchSync,
        }
    }

    /// The resource the worker must lease before running the handler.
    ///
    /// Batch jobs return `None`: the batch handler leases each resource
    /// itself and skips the ones it cannot get.
    pub fn lock_resource(&self) -> Option<&ResourceId> {
        match self {
            JobPayload::SyncInventory { resource_id, .. }
            | JobPayload::SyncPrice { resource_id, .. }
            | JobPayload::SyncAll { resource_id, .. } => Some(resource_id),
            JobPayload::BatchSync { .. } => None,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        match self {
            JobPayload::SyncInventory { options, .. }
            | JobPayload::SyncPrice { options, .. }
            | JobPayload::SyncAll { options, .. }
            | JobPayload::BatchSync { options, .. } => options,
        }
    }

    /// Validate the payload at enqueue time.
    pub fn validate(&self) -> SyncResult<()> {
        match self {
            JobPayload::BatchSync { resource_ids, .. } => {
                if resource_ids.is_empty() {
                    return Err(SyncError::validation("batch sync requires at least one resource"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Job lifecycle status.
///
/// Transitions are monotonic along `Waiting/Delayed -> Active ->
/// {Completed, Failed}`. A failed job that is deliberately retried does so
/// as a **new** job; the old one is never resurrected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a job in this status may still be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }
}

/// Options accepted at enqueue time.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Higher runs sooner among co-eligible jobs.
    pub priority: i32,
    /// Delay before the job becomes claimable.
    pub delay: Duration,
    /// Retry budget handed to the backoff wrapper for upstream calls.
    pub max_attempts: u32,
    /// Who requested the job (user, "auto-sync", "retry:<id>").
    pub created_by: String,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            max_attempts: 3,
            created_by: "system".to_string(),
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }
}

/// A single unit of requested synchronization work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: i32,
    /// Upstream attempts consumed by the last execution.
    pub attempts: u32,
    /// Retry budget for upstream calls.
    pub max_attempts: u32,
    pub status: JobStatus,
    /// Earliest instant the job may be claimed.
    pub eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Set when the job reaches a terminal status; drives retention pruning.
    pub finished_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl Job {
    pub fn new(payload: JobPayload, opts: EnqueueOptions) -> Self {
        Self::new_at(payload, opts, Utc::now())
    }

    /// Deterministic constructor used by tests.
    pub fn new_at(payload: JobPayload, opts: EnqueueOptions, now: DateTime<Utc>) -> Self {
        let delayed = !opts.delay.is_zero();
        // Absurd delays are clamped rather than allowed to overflow the clock.
        let delay = chrono::Duration::from_std(opts.delay)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let eligible_at = now + delay;
        Self {
            id: JobId::new(),
            payload,
            priority: opts.priority,
            attempts: 0,
            max_attempts: opts.max_attempts,
            status: if delayed { JobStatus::Delayed } else { JobStatus::Waiting },
            eligible_at,
            created_at: now,
            finished_at: None,
            created_by: opts.created_by,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.eligible_at <= now
    }
}
