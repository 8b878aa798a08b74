//! `stockbridge-queue`: job queue, resource leases, retry policy, and the
//! append-only outcome log.
//!
//! ## Design
//!
//! - Jobs carry a closed set of typed payloads, validated at enqueue
//! - Priority + FIFO ordering among simultaneously eligible jobs
//! - `claim_next` is the only place job ownership transfers, and it is atomic
//! - Leases expire passively via TTL; at most one live lease per resource
//! - Backoff with jitter drawn from an injected, seedable RNG
//! - The outcome log is append-only; history is corrected by appending,
//!   never by editing
//!
//! ## Components
//!
//! - [`Job`] / [`JobPayload`]: the unit of requested sync work
//! - [`JobQueue`]: durable holding area for pending work (in-memory impl)
//! - [`LockManager`]: time-bounded exclusive leases per resource id
//! - [`RetryPolicy`] / [`with_retry`]: bounded exponential backoff
//! - [`OutcomeLog`]: auditable history of every attempt

pub mod job;
pub mod lock;
pub mod outcome;
pub mod retry;
pub mod store;

pub use job::{EnqueueOptions, Job, JobKind, JobPayload, JobStatus, SyncOptions};
pub use lock::{DEFAULT_LOCK_TTL, InMemoryLockManager, Lease, LockManager};
pub use outcome::{
    DEFAULT_STUCK_THRESHOLD, InMemoryOutcomeLog, OutcomeDetails, OutcomeEntry, OutcomeLog,
    OutcomeLogError, OutcomeStatus,
};
pub use retry::{Attempted, RetryError, RetryPolicy, with_retry};
pub use store::{InMemoryJobQueue, JobCompletion, JobQueue, QueueCounts, QueueError};
