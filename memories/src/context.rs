use crate::config::MemoriesConfig;
use crate::model::MemoryModelClient;
use crate::model::ModelInfo;
use chrono::Utc;
use mnemo_state::StateRuntime;
use mnemo_state::ThreadId;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub(crate) const MIN_PHASE2_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Everything one pipeline run needs, passed explicitly to both phases.
#[derive(Clone)]
pub struct MemoryRunContext {
    pub state_db: Arc<StateRuntime>,
    /// Directory holding `MEMORY.md`, `raw_memories.md` and friends.
    pub memory_root: PathBuf,
    pub config: MemoriesConfig,
    pub model_client: Arc<dyn MemoryModelClient>,
    pub phase_1_model: ModelInfo,
    pub phase_2_model: ModelInfo,
    /// Recorded on every claim this run makes.
    pub worker_id: String,
    /// Threads that must not be extracted, typically the live session.
    pub exclude_thread_ids: Vec<ThreadId>,
    pub phase2_heartbeat_interval: Duration,
}

impl MemoryRunContext {
    /// Builds a context with a fresh worker id. Configured model overrides
    /// replace the slugs of `phase_1_model` and `phase_2_model`.
    pub fn new(
        state_db: Arc<StateRuntime>,
        memory_root: PathBuf,
        config: MemoriesConfig,
        model_client: Arc<dyn MemoryModelClient>,
        phase_1_model: ModelInfo,
        phase_2_model: ModelInfo,
    ) -> Self {
        let phase_1_model = phase_1_model.with_slug_override(config.phase_1_model.as_deref());
        let phase_2_model = phase_2_model.with_slug_override(config.phase_2_model.as_deref());
        let phase2_heartbeat_interval = Duration::from_secs(config.phase2_heartbeat_seconds.max(1));
        Self {
            state_db,
            memory_root,
            config,
            model_client,
            phase_1_model,
            phase_2_model,
            worker_id: format!("pid-{}-{}", std::process::id(), Uuid::new_v4()),
            exclude_thread_ids: Vec::new(),
            phase2_heartbeat_interval,
        }
    }

    pub fn with_exclude_thread_ids(mut self, exclude_thread_ids: Vec<ThreadId>) -> Self {
        self.exclude_thread_ids = exclude_thread_ids;
        self
    }

    /// Overrides the lease renewal period. Periods under 10ms, zero
    /// included, are raised to 10ms.
    pub fn with_phase2_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.phase2_heartbeat_interval = interval.max(MIN_PHASE2_HEARTBEAT_INTERVAL);
        self
    }

    pub(crate) fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}
