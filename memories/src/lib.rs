//! Memory subsystem for startup extraction and consolidation.
//!
//! The startup memory pipeline is split into two phases:
//! - Phase 1: claim rollouts, extract stage-1 raw memories, persist stage-1 outputs, and enqueue consolidation.
//! - Phase 2: claim the global consolidation lease, materialize consolidation inputs, and run one consolidation.
//!
//! Workers in separate processes coordinate only through the job store in
//! `mnemo-state`.

mod config;
mod context;
mod error;
mod layout;
mod model;
mod paths;
pub mod phase1;
pub mod phase2;
mod prompts;
mod rollout;
mod schema;
mod start;
mod storage;

use mnemo_state::EnqueueOptions;
use mnemo_state::StateRuntime;
use std::path::Path;

pub use config::MemoriesConfig;
pub use config::MemoriesToml;
pub use context::MemoryRunContext;
pub use error::MemoryError;
pub use error::SchemaError;
pub use layout::memory_home_for_cwd;
pub use layout::memory_root;
pub use model::ContentBlock;
pub use model::MemoryModelClient;
pub use model::ModelInfo;
pub use model::ModelRequest;
pub use model::ModelResponse;
pub use model::StopReason;
pub use model::TokenUsage;
pub use paths::sanitize_skill_relative_path;
pub use paths::slugify_skill_name;
pub use phase1::Phase1Summary;
pub use phase2::Phase2Outcome;
pub use rollout::RolloutItem;
pub use schema::ConsolidationOutput;
pub use schema::SkillBundle;
pub use schema::SkillFile;
pub use schema::StageOneOutput;
pub use schema::parse_consolidation_output;
pub use schema::parse_stage_one_output;
pub use start::MemoryStartupParams;
pub use start::MemoryStartupReport;
pub use start::SessionSource;
pub use start::run_memories_startup_pipeline;
pub use start::start_memories_startup_task;

/// Builds the developer instructions that expose the memory summary to a
/// session, truncated to `summary_injection_token_limit`.
///
/// Returns `None` when there is no summary to share yet.
pub async fn build_memory_tool_developer_instructions(
    memory_root: &Path,
    config: &MemoriesConfig,
) -> Option<String> {
    prompts::build_memory_tool_developer_instructions(
        memory_root,
        config.summary_injection_token_limit,
    )
    .await
}

/// Wipes every memory job and output from the store and deletes the memory
/// root. Registered threads are kept so they can be extracted again.
pub async fn clear_memory_data(state_db: &StateRuntime, memory_root: &Path) -> anyhow::Result<()> {
    state_db.clear_memory_data().await?;
    match tokio::fs::remove_dir_all(memory_root).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Requests a consolidation run even though no new stage-1 output exists.
pub async fn enqueue_memory_consolidation(state_db: &StateRuntime) -> anyhow::Result<()> {
    let watermark = state_db.get_memory_watermark().await?;
    state_db
        .enqueue_global_watermark(
            watermark,
            EnqueueOptions {
                force_dirty_when_not_advanced: true,
            },
        )
        .await
}
