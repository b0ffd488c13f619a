use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use strum::Display;
use strum::EnumString;
use strum::IntoStaticStr;

use super::ThreadId;
use super::ThreadMetadata;

/// Lifecycle of a per-thread stage-1 extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage1JobStatus {
    Pending,
    Claimed,
    Succeeded,
    SucceededNoOutput,
    Failed,
}

impl Stage1JobStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Persisted state of one stage-1 job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage1Job {
    pub thread_id: ThreadId,
    pub status: Stage1JobStatus,
    pub worker_id: Option<String>,
    pub ownership_token: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub retry_after: Option<i64>,
    /// Thread `updated_at` the latest claim was made against.
    pub source_updated_at: i64,
    pub last_error: Option<String>,
    /// Number of recorded failures. Informational only.
    pub attempts: i64,
}

impl Stage1Job {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let thread_id: String = row.try_get("thread_id")?;
        Ok(Self {
            thread_id: ThreadId::from(thread_id),
            status: status.parse()?,
            worker_id: row.try_get("worker_id")?,
            ownership_token: row.try_get("ownership_token")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            retry_after: row.try_get("retry_after")?,
            source_updated_at: row.try_get("source_updated_at")?,
            last_error: row.try_get("last_error")?,
            attempts: row.try_get("attempts")?,
        })
    }
}

/// Lifecycle of the singleton global consolidation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase2JobStatus {
    Idle,
    Claimed,
    Failed,
}

impl Phase2JobStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Persisted state of the singleton phase-2 job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalPhase2Job {
    pub status: Phase2JobStatus,
    pub worker_id: Option<String>,
    pub ownership_token: Option<String>,
    pub lease_expires_at: Option<i64>,
    /// Highest stage-1 `source_updated_at` enqueued so far.
    pub input_watermark: i64,
    pub retry_after: Option<i64>,
    pub last_error: Option<String>,
    /// Monotonic count of force-dirty requests.
    pub dirty_requests: i64,
    /// Value of `dirty_requests` observed by the latest claim.
    pub dirty_requests_claimed: i64,
    /// Value of `dirty_requests` folded in by the latest success.
    pub dirty_requests_consumed: i64,
}

impl GlobalPhase2Job {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            status: status.parse()?,
            worker_id: row.try_get("worker_id")?,
            ownership_token: row.try_get("ownership_token")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            input_watermark: row.try_get("input_watermark")?,
            retry_after: row.try_get("retry_after")?,
            last_error: row.try_get("last_error")?,
            dirty_requests: row.try_get("dirty_requests")?,
            dirty_requests_claimed: row.try_get("dirty_requests_claimed")?,
            dirty_requests_consumed: row.try_get("dirty_requests_consumed")?,
        })
    }

    /// Whether the row holds a lease that has not expired at `now`.
    pub fn is_leased_at(&self, now: i64) -> bool {
        self.status == Phase2JobStatus::Claimed
            && self
                .lease_expires_at
                .is_some_and(|lease_expires_at| lease_expires_at > now)
    }

    pub fn has_pending_dirty_request(&self) -> bool {
        self.dirty_requests > self.dirty_requests_consumed
    }
}

/// Claimed stage-1 job with thread metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage1JobClaim {
    pub thread: ThreadMetadata,
    pub ownership_token: String,
    /// Thread `updated_at` (unix seconds) this claim covers.
    pub source_updated_at: i64,
}

/// Inputs of [`crate::StateRuntime::claim_stage1_jobs`].
#[derive(Debug, Clone, Copy)]
pub struct Stage1ClaimParams<'a> {
    pub now: i64,
    pub scan_limit: usize,
    pub max_claims: usize,
    pub max_age_days: i64,
    pub min_idle_hours: i64,
    pub lease_seconds: i64,
    /// Upper bound on unexpired stage-1 claims across all workers.
    pub running_cap: usize,
    pub worker_id: &'a str,
    pub exclude_thread_ids: &'a [ThreadId],
}

/// Result of trying to claim a phase-2 consolidation job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase2JobClaimOutcome {
    /// The caller owns the global lock and should run consolidation.
    Claimed {
        ownership_token: String,
        /// Snapshot of `input_watermark` at claim time.
        input_watermark: i64,
    },
    /// Nothing new to consolidate, or the job is backing off after a failure.
    NotReady,
    /// Another worker currently owns a fresh global consolidation lease.
    AlreadyClaimed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Request a consolidation run even when `source_updated_at` does not
    /// move past the consolidated watermark.
    pub force_dirty_when_not_advanced: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stage1StatusCounts {
    pub pending: i64,
    pub claimed: i64,
    pub succeeded: i64,
    pub succeeded_no_output: i64,
    pub failed: i64,
}

/// Snapshot of the whole memory pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStatus {
    pub threads: i64,
    pub stage1_jobs: Stage1StatusCounts,
    pub stage1_outputs: i64,
    pub phase2: GlobalPhase2Job,
    pub watermark: i64,
}
