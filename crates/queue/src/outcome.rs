//! Append-only outcome log.
//!
//! One immutable entry per completed attempt, plus in-progress markers.
//! A job's lifecycle produces zero or more `Processing` markers and exactly
//! one terminal entry. Correcting a misclassified outcome means appending a
//! new entry; history is never edited.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockbridge_core::{ErrorKind, JobId, OutcomeId, ResourceId};

use super::job::JobKind;

/// Default age after which a `Processing` marker with no terminal entry
/// counts as stuck.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(300);

/// Status of an outcome-log entry.
///
/// `Scheduled` marks scheduler-created jobs awaiting eligibility, `Pending`
/// the window between enqueue and claim, `Processing` an in-flight attempt.
/// The rest are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Scheduled,
    Pending,
    Processing,
    Success,
    Error,
    Skipped,
}

impl OutcomeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutcomeStatus::Success | OutcomeStatus::Error | OutcomeStatus::Skipped)
    }

    /// Whether `next` is a legal successor in the status state machine
    /// (`scheduled -> pending -> processing -> terminal`). A scheduled job
    /// that is claimed goes straight to `Processing` without a `Pending`
    /// marker. Correction entries appended after a terminal entry are
    /// always legal.
    pub fn allows(&self, next: OutcomeStatus) -> bool {
        if self.is_terminal() {
            return next.is_terminal();
        }
        match self {
            OutcomeStatus::Scheduled => {
                matches!(next, OutcomeStatus::Pending | OutcomeStatus::Processing)
            }
            OutcomeStatus::Pending => next == OutcomeStatus::Processing,
            OutcomeStatus::Processing => next.is_terminal(),
            _ => unreachable!("terminal handled above"),
        }
    }
}

/// Structured payload of an outcome entry, a closed union rather than a
/// free-form blob, so the audit trail stays queryable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutcomeDetails {
    /// Timings and attempt count of a successful execution.
    Execution { attempts: u32, elapsed_ms: u64 },
    /// Classified failure, with the attempts consumed before giving up.
    Failure {
        kind: ErrorKind,
        detail: String,
        attempts: u32,
    },
    /// Raw upstream response worth keeping for the audit trail.
    Upstream { status: u16, body: String },
    /// Why the job was skipped (e.g. "resource locked").
    Skip { reason: String },
}

/// One record in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEntry {
    pub id: OutcomeId,
    pub job_id: JobId,
    /// Resource the entry is about; `None` for batch-level entries.
    pub resource_id: Option<ResourceId>,
    pub action: JobKind,
    pub status: OutcomeStatus,
    pub message: String,
    pub details: Option<OutcomeDetails>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl OutcomeEntry {
    pub fn new(
        job_id: JobId,
        resource_id: Option<ResourceId>,
        action: JobKind,
        status: OutcomeStatus,
        message: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id: OutcomeId::new(),
            job_id,
            resource_id,
            action,
            status,
            message: message.into(),
            details: None,
            created_at: Utc::now(),
            created_by: created_by.into(),
        }
    }

    pub fn with_details(mut self, details: OutcomeDetails) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum OutcomeLogError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("job {job_id}: illegal outcome transition {from:?} -> {to:?}")]
    IllegalTransition {
        job_id: JobId,
        from: OutcomeStatus,
        to: OutcomeStatus,
    },
}

/// Append/query store for the audit trail. Append-only by construction:
/// there is no update or delete operation.
pub trait OutcomeLog: Send + Sync {
    /// Append an entry. Rejects entries whose status is not a legal
    /// successor of the job's latest entry (see [`OutcomeStatus::allows`]).
    fn append(&self, entry: OutcomeEntry) -> Result<OutcomeId, OutcomeLogError>;

    /// Most recent entries first.
    fn recent(&self, limit: usize) -> Result<Vec<OutcomeEntry>, OutcomeLogError>;

    fn count_by_status(&self, status: OutcomeStatus) -> Result<usize, OutcomeLogError>;

    /// Entries created within `[from, to)`, oldest first.
    fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OutcomeEntry>, OutcomeLogError>;

    /// Full history for one job, oldest first.
    fn for_job(&self, job_id: JobId) -> Result<Vec<OutcomeEntry>, OutcomeLogError>;

    /// Last terminal entry recorded for a resource.
    fn latest_for_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Option<OutcomeEntry>, OutcomeLogError>;

    /// `Processing` markers older than `threshold` with no later terminal
    /// entry for the same job. A health-check signal, not a failure.
    fn stuck_processing(&self, threshold: Duration) -> Result<Vec<OutcomeEntry>, OutcomeLogError>;
}

/// In-memory log. Entries are held in append order.
#[derive(Debug, Default)]
pub struct InMemoryOutcomeLog {
    entries: RwLock<Vec<OutcomeEntry>>,
}

impl InMemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic stuck-marker query used by tests.
    pub fn stuck_processing_at(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutcomeEntry>, OutcomeLogError> {
        let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let entries = self.entries.read().expect("outcome log poisoned");
        let stuck = entries
            .iter()
            .filter(|e| e.status == OutcomeStatus::Processing && e.created_at <= cutoff)
            .filter(|marker| {
                !entries.iter().any(|later| {
                    later.job_id == marker.job_id
                        && later.status.is_terminal()
                        && later.created_at >= marker.created_at
                })
            })
            .cloned()
            .collect();
        Ok(stuck)
    }
}

impl OutcomeLog for InMemoryOutcomeLog {
    fn append(&self, entry: OutcomeEntry) -> Result<OutcomeId, OutcomeLogError> {
        let id = entry.id;
        let mut entries = self.entries.write().expect("outcome log poisoned");
        if let Some(last) = entries.iter().rev().find(|e| e.job_id == entry.job_id) {
            if !last.status.allows(entry.status) {
                return Err(OutcomeLogError::IllegalTransition {
                    job_id: entry.job_id,
                    from: last.status,
                    to: entry.status,
                });
            }
        }
        entries.push(entry);
        Ok(id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<OutcomeEntry>, OutcomeLogError> {
        let entries = self.entries.read().expect("outcome log poisoned");
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    fn count_by_status(&self, status: OutcomeStatus) -> Result<usize, OutcomeLogError> {
        let entries = self.entries.read().expect("outcome log poisoned");
        Ok(entries.iter().filter(|e| e.status == status).count())
    }

    fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OutcomeEntry>, OutcomeLogError> {
        let entries = self.entries.read().expect("outcome log poisoned");
        Ok(entries
            .iter()
            .filter(|e| e.created_at >= from && e.created_at < to)
            .cloned()
            .collect())
    }

    fn for_job(&self, job_id: JobId) -> Result<Vec<OutcomeEntry>, OutcomeLogError> {
        let entries = self.entries.read().expect("outcome log poisoned");
        Ok(entries.iter().filter(|e| e.job_id == job_id).cloned().collect())
    }

    fn latest_for_resource(
        &self,
        resource_id: &ResourceId,
    ) -> Result<Option<OutcomeEntry>, OutcomeLogError> {
        let entries = self.entries.read().expect("outcome log poisoned");
        Ok(entries
            .iter()
            .rev()
            .find(|e| e.status.is_terminal() && e.resource_id.as_ref() == Some(resource_id))
            .cloned())
    }

    fn stuck_processing(&self, threshold: Duration) -> Result<Vec<OutcomeEntry>, OutcomeLogError> {
        self.stuck_processing_at(threshold, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str) -> ResourceId {
        ResourceId::new(id).unwrap()
    }

    fn entry(job_id: JobId, status: OutcomeStatus) -> OutcomeEntry {
        OutcomeEntry::new(
            job_id,
            Some(resource("map-1")),
            JobKind::SyncAll,
            status,
            "test",
            "worker-0",
        )
    }

    #[test]
    fn state_machine_orders_statuses() {
        use OutcomeStatus::*;
        assert!(Scheduled.allows(Pending));
        assert!(Scheduled.allows(Processing));
        assert!(Pending.allows(Processing));
        assert!(Processing.allows(Success));
        assert!(Processing.allows(Error));
        assert!(Processing.allows(Skipped));

        assert!(!Scheduled.allows(Success));
        assert!(!Pending.allows(Success));
        assert!(!Processing.allows(Pending));

        // Corrections: terminal may be followed only by another terminal.
        assert!(Error.allows(Success));
        assert!(!Success.allows(Processing));
    }

    #[test]
    fn append_rejects_illegal_transitions() {
        let log = InMemoryOutcomeLog::new();
        let job = JobId::new();
        log.append(entry(job, OutcomeStatus::Pending)).unwrap();

        // Pending cannot jump straight to a terminal state.
        let err = log.append(entry(job, OutcomeStatus::Success)).unwrap_err();
        assert!(matches!(err, OutcomeLogError::IllegalTransition { .. }));

        log.append(entry(job, OutcomeStatus::Processing)).unwrap();
        log.append(entry(job, OutcomeStatus::Success)).unwrap();
        // Corrections after a terminal entry are allowed.
        log.append(entry(job, OutcomeStatus::Error)).unwrap();

        // Another job is unaffected by this job's history.
        log.append(entry(JobId::new(), OutcomeStatus::Processing)).unwrap();
    }

    #[test]
    fn recent_returns_newest_first() {
        let log = InMemoryOutcomeLog::new();
        let a = JobId::new();
        let b = JobId::new();
        log.append(entry(a, OutcomeStatus::Pending)).unwrap();
        log.append(entry(b, OutcomeStatus::Success)).unwrap();

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].job_id, b);
        assert_eq!(recent[1].job_id, a);
    }

    #[test]
    fn counts_and_ranges() {
        let log = InMemoryOutcomeLog::new();
        log.append(entry(JobId::new(), OutcomeStatus::Success)).unwrap();
        log.append(entry(JobId::new(), OutcomeStatus::Success)).unwrap();
        log.append(entry(JobId::new(), OutcomeStatus::Skipped)).unwrap();

        assert_eq!(log.count_by_status(OutcomeStatus::Success).unwrap(), 2);
        assert_eq!(log.count_by_status(OutcomeStatus::Skipped).unwrap(), 1);
        assert_eq!(log.count_by_status(OutcomeStatus::Error).unwrap(), 0);

        let now = Utc::now();
        let all = log
            .in_range(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1))
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(log.in_range(now + chrono::Duration::minutes(1), now + chrono::Duration::minutes(2)).unwrap().is_empty());
    }

    #[test]
    fn latest_for_resource_ignores_markers() {
        let log = InMemoryOutcomeLog::new();
        let job = JobId::new();
        log.append(entry(job, OutcomeStatus::Processing)).unwrap();
        log.append(entry(job, OutcomeStatus::Error)).unwrap();
        log.append(entry(JobId::new(), OutcomeStatus::Processing)).unwrap();

        let latest = log.latest_for_resource(&resource("map-1")).unwrap().unwrap();
        assert_eq!(latest.status, OutcomeStatus::Error);
        assert_eq!(latest.job_id, job);
    }

    #[test]
    fn stuck_detection_flags_old_markers_without_terminal_entries() {
        let log = InMemoryOutcomeLog::new();
        let finished = JobId::new();
        let stuck = JobId::new();

        log.append(entry(finished, OutcomeStatus::Processing)).unwrap();
        log.append(entry(finished, OutcomeStatus::Success)).unwrap();
        log.append(entry(stuck, OutcomeStatus::Processing)).unwrap();

        let threshold = Duration::from_secs(300);

        // Fresh markers are not stuck yet.
        assert!(log.stuck_processing_at(threshold, Utc::now()).unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::minutes(10);
        let flagged = log.stuck_processing_at(threshold, later).unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].job_id, stuck);
    }

    #[test]
    fn details_round_trip_as_tagged_union() {
        let details = OutcomeDetails::Failure {
            kind: ErrorKind::Upstream,
            detail: "503 from target".into(),
            attempts: 5,
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["type"], "failure");
        let back: OutcomeDetails = serde_json::from_value(json).unwrap();
        assert_eq!(back, details);
    }
}
