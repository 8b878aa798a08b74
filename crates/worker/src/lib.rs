//! `stockbridge-worker`: worker pool, job handlers and the sync service
//! facade.
//!
//! The composition root builds a [`SyncService`] from a queue, an outcome
//! log, a lock manager and two [`CommerceClient`]s, then calls
//! [`SyncService::start`]. Jobs flow queue -> claim -> lease -> handler ->
//! outcome entry -> ack; the optional [`AutoSync`] loop feeds the queue on
//! a settings-driven cadence.

pub mod autosync;
pub mod client;
pub mod handler;
pub mod pool;
pub mod service;

pub use autosync::AutoSync;
pub use client::{
    CommerceClient, InMemoryCommerceClient, RemoteState, ResourceCatalog, StaticCatalog,
};
pub use handler::{
    BatchSyncHandler, HandlerError, HandlerRegistry, JobHandler, PlatformSyncHandler, SyncContext,
    SyncReport, SyncScope,
};
pub use pool::{PoolConfig, PoolStats, RunOptions, TaskOutcome, WorkerPool, SKIP_REASON_LOCKED};
pub use service::{Scheduled, ServiceError, StatusReport, SyncService};
