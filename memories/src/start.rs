use crate::config::MemoriesConfig;
use crate::context::MemoryRunContext;
use crate::layout::memory_home_for_cwd;
use crate::layout::memory_root;
use crate::model::MemoryModelClient;
use crate::model::ModelInfo;
use crate::phase1;
use crate::phase1::Phase1Summary;
use crate::phase2;
use crate::phase2::Phase2Outcome;
use mnemo_state::StateRuntime;
use mnemo_state::ThreadId;
use mnemo_state::ThreadMetadata;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

/// Where the session that triggers the pipeline came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Cli,
    Exec,
    /// Spawned by another agent; never runs the pipeline.
    SubAgent,
}

/// Inputs for one startup run, supplied by the session host.
#[derive(Clone)]
pub struct MemoryStartupParams {
    /// Application home; per-project state lives under `<home>/memories/`.
    pub home: PathBuf,
    pub cwd: PathBuf,
    pub config: MemoriesConfig,
    pub ephemeral: bool,
    pub source: SessionSource,
    /// Nesting depth of the session's task; only top-level sessions run.
    pub task_depth: u32,
    pub current_thread_id: Option<ThreadId>,
    /// Rollouts discovered on disk, registered before claiming.
    pub threads: Vec<ThreadMetadata>,
    pub model_client: Arc<dyn MemoryModelClient>,
    pub phase_1_model: ModelInfo,
    pub phase_2_model: ModelInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStartupReport {
    pub phase1: Phase1Summary,
    pub phase2: Phase2Outcome,
}

fn should_run_startup_pipeline(params: &MemoryStartupParams) -> bool {
    params.config.enabled
        && !params.ephemeral
        && params.source != SessionSource::SubAgent
        && params.task_depth == 0
}

/// Starts the asynchronous startup memory pipeline for an eligible root
/// session.
///
/// Returns `None` without spawning anything for disabled, ephemeral, subagent
/// and nested sessions. The spawned task resolves to `None` when the job
/// store cannot be opened.
pub fn start_memories_startup_task(
    params: MemoryStartupParams,
) -> Option<JoinHandle<Option<MemoryStartupReport>>> {
    if !should_run_startup_pipeline(&params) {
        debug!("memories startup pipeline skipped for this session");
        return None;
    }

    Some(tokio::spawn(async move {
        let memory_home = memory_home_for_cwd(&params.home, &params.cwd);
        let state_db = match StateRuntime::init(memory_home.clone()).await {
            Ok(state_db) => state_db,
            Err(err) => {
                debug!(
                    "memory store unavailable at {}; skipping memories startup: {err}",
                    memory_home.display()
                );
                return None;
            }
        };
        if let Err(err) = state_db.upsert_threads(&params.threads).await {
            warn!("failed to register threads for memories startup: {err}");
        }

        let ctx = MemoryRunContext::new(
            state_db,
            memory_root(&memory_home),
            params.config,
            params.model_client,
            params.phase_1_model,
            params.phase_2_model,
        )
        .with_exclude_thread_ids(params.current_thread_id.into_iter().collect());
        Some(run_memories_startup_pipeline(&ctx).await)
    }))
}

/// Runs phase 1 then phase 2 to completion.
pub async fn run_memories_startup_pipeline(ctx: &MemoryRunContext) -> MemoryStartupReport {
    // Run phase 1.
    let phase1 = phase1::run(ctx).await;
    // Run phase 2.
    let phase2 = phase2::run(ctx).await;
    MemoryStartupReport { phase1, phase2 }
}
