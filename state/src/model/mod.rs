mod memories;
mod stage1_output;
mod thread_metadata;

use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

pub use memories::EnqueueOptions;
pub use memories::GlobalPhase2Job;
pub use memories::MemoryStatus;
pub use memories::Phase2JobClaimOutcome;
pub use memories::Phase2JobStatus;
pub use memories::Stage1ClaimParams;
pub use memories::Stage1Job;
pub use memories::Stage1JobClaim;
pub use memories::Stage1JobStatus;
pub use memories::Stage1StatusCounts;
pub use stage1_output::Stage1Output;
pub use thread_metadata::ThreadId;
pub use thread_metadata::ThreadMetadata;

pub(crate) use stage1_output::Stage1OutputRow;
pub(crate) use thread_metadata::ThreadRow;

pub(crate) fn epoch_seconds_to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid unix timestamp: {secs}"))
}
