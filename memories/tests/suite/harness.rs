#![allow(clippy::expect_used)]

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use mnemo_memories::ContentBlock;
use mnemo_memories::MemoriesConfig;
use mnemo_memories::MemoryModelClient;
use mnemo_memories::MemoryRunContext;
use mnemo_memories::ModelInfo;
use mnemo_memories::ModelRequest;
use mnemo_memories::ModelResponse;
use mnemo_memories::StopReason;
use mnemo_memories::TokenUsage;
use mnemo_memories::memory_root;
use mnemo_state::StateRuntime;
use mnemo_state::ThreadId;
use mnemo_state::ThreadMetadata;
use serde_json::Value;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub(crate) const EXTRACT_MODEL: &str = "memory-extract";
pub(crate) const CONSOLIDATE_MODEL: &str = "memory-consolidate";
pub(crate) const FAKE_SECRET: &str = "sk-ABCDEFGHIJKLMNOPQRSTUVWX";

type Responder = Box<dyn Fn(&ModelRequest) -> anyhow::Result<ModelResponse> + Send + Sync>;

/// Model double that answers each phase from a fixed script and records
/// every request it sees.
pub(crate) struct ScriptedModel {
    stage_one: Responder,
    consolidation: Responder,
    lease_thief: Option<Arc<StateRuntime>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub(crate) fn new<S, C>(stage_one: S, consolidation: C) -> Self
    where
        S: Fn(&ModelRequest) -> anyhow::Result<ModelResponse> + Send + Sync + 'static,
        C: Fn(&ModelRequest) -> anyhow::Result<ModelResponse> + Send + Sync + 'static,
    {
        Self {
            stage_one: Box::new(stage_one),
            consolidation: Box::new(consolidation),
            lease_thief: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// While consolidating, hands the phase-2 lease to another worker and
    /// stalls long enough for the heartbeat to notice.
    pub(crate) fn with_lease_thief(mut self, state_db: Arc<StateRuntime>) -> Self {
        self.lease_thief = Some(state_db);
        self
    }

    pub(crate) fn requests_for(&self, model: &str) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|request| request.model == model)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MemoryModelClient for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if request.model == EXTRACT_MODEL {
            return (self.stage_one)(&request);
        }
        if let Some(state_db) = &self.lease_thief {
            let far_future = Utc::now().timestamp() + 86_400;
            state_db
                .try_claim_global_phase2_job("thief", 3_600, far_future)
                .await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        (self.consolidation)(&request)
    }
}

pub(crate) fn text_response(text: impl Into<String>) -> ModelResponse {
    ModelResponse {
        stop_reason: StopReason::Stop,
        error_message: None,
        content: vec![ContentBlock::Text { text: text.into() }],
        usage: TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            total_tokens: 120,
        },
    }
}

pub(crate) fn stage_one_json(
    raw_memory: &str,
    rollout_summary: &str,
    slug: Option<&str>,
) -> String {
    json!({
        "raw_memory": raw_memory,
        "rollout_summary": rollout_summary,
        "rollout_slug": slug,
    })
    .to_string()
}

pub(crate) fn consolidation_json(memory_md: &str, memory_summary: &str, skills: Value) -> String {
    json!({
        "memory_md": memory_md,
        "memory_summary": memory_summary,
        "skills": skills,
    })
    .to_string()
}

pub(crate) fn test_config() -> MemoriesConfig {
    MemoriesConfig {
        enabled: true,
        ..MemoriesConfig::default()
    }
}

/// A project home with an open job store and a rollouts directory.
pub(crate) struct TestEnv {
    pub(crate) home: TempDir,
    pub(crate) state_db: Arc<StateRuntime>,
    pub(crate) memory_root: PathBuf,
}

impl TestEnv {
    pub(crate) async fn new() -> anyhow::Result<Self> {
        let home = TempDir::new()?;
        let project_home = home.path().join("project");
        let state_db = StateRuntime::init(project_home.clone()).await?;
        tokio::fs::create_dir_all(home.path().join("rollouts")).await?;
        Ok(Self {
            memory_root: memory_root(&project_home),
            home,
            state_db,
        })
    }

    /// Writes a rollout for `id` and registers it as last active
    /// `idle_hours` ago.
    pub(crate) async fn add_thread(
        &self,
        id: &str,
        idle_hours: i64,
        items: &[Value],
    ) -> anyhow::Result<ThreadMetadata> {
        let rollout_path = self.home.path().join("rollouts").join(format!("{id}.jsonl"));
        let body = items
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(&rollout_path, body).await?;

        let updated_at =
            DateTime::<Utc>::from_timestamp(Utc::now().timestamp() - idle_hours * 3_600, 0)
                .expect("valid timestamp");
        let thread = ThreadMetadata {
            id: ThreadId::from(id),
            rollout_path,
            cwd: PathBuf::from("/workspace/app"),
            source: "cli".to_string(),
            updated_at,
        };
        self.state_db
            .upsert_threads(std::slice::from_ref(&thread))
            .await?;
        Ok(thread)
    }

    pub(crate) fn context(&self, model: Arc<ScriptedModel>) -> MemoryRunContext {
        MemoryRunContext::new(
            Arc::clone(&self.state_db),
            self.memory_root.clone(),
            test_config(),
            model,
            ModelInfo::new(EXTRACT_MODEL, None),
            ModelInfo::new(CONSOLIDATE_MODEL, None),
        )
    }
}

pub(crate) fn rollout_about(topic: &str) -> Vec<Value> {
    vec![
        json!({"type": "session_meta", "cwd": "/workspace/app"}),
        json!({"type": "message", "role": "user", "content": format!("please {topic}")}),
        json!({"type": "tool_result", "tool_name": "shell", "output": format!("ran {topic}")}),
        json!({"type": "tool_result", "tool_name": "web_search", "output": "SEARCH_NOISE"}),
        json!({"type": "message", "role": "assistant", "content": format!("done with {topic}")}),
    ]
}
