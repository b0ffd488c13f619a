//! SQLite-backed job store for the memory pipeline.
//!
//! Every process that runs the pipeline opens the same database file. All
//! coordination between them goes through the token-gated operations on
//! [`StateRuntime`]; nothing here relies on in-process locks.

mod migrations;
mod model;
mod runtime;

/// Preferred entrypoint: owns the connection pool and every job operation.
pub use runtime::StateRuntime;

pub use model::EnqueueOptions;
pub use model::GlobalPhase2Job;
pub use model::MemoryStatus;
pub use model::Phase2JobClaimOutcome;
pub use model::Phase2JobStatus;
pub use model::Stage1ClaimParams;
pub use model::Stage1Job;
pub use model::Stage1JobClaim;
pub use model::Stage1JobStatus;
pub use model::Stage1Output;
pub use model::Stage1StatusCounts;
pub use model::ThreadId;
pub use model::ThreadMetadata;
pub use runtime::STATE_DB_FILENAME;
pub use runtime::STATE_DB_VERSION;
pub use runtime::state_db_filename;
pub use runtime::state_db_path;
