use crate::config::MemoriesConfig;
use crate::layout::memory_summary_file;
use crate::model::ModelInfo;
use askama::Template;
use mnemo_utils_string::truncate_head_tail;
use std::path::Path;
use tokio::fs;
use tracing::warn;

pub(crate) const STAGE_ONE_SYSTEM_PROMPT: &str =
    include_str!("../templates/memories/stage_one_system.md");
pub(crate) const CONSOLIDATION_SYSTEM_PROMPT: &str =
    include_str!("../templates/memories/consolidation_system.md");

/// Rough bytes-per-token ratio used to turn token budgets into byte budgets.
const APPROX_BYTES_PER_TOKEN: usize = 4;
const ROLLOUT_TRUNCATION_MARKER: &str = "\n\n[... ROLLOUT TRUNCATED FOR MEMORY EXTRACTION ...]\n\n";
const RAW_MEMORIES_TRUNCATION_MARKER: &str =
    "\n\n[... RAW MEMORIES TRUNCATED FOR CONSOLIDATION ...]\n\n";
const SUMMARY_TRUNCATION_MARKER: &str = "\n\n[... MEMORY SUMMARY TRUNCATED ...]\n\n";

#[derive(Template)]
#[template(path = "memories/stage_one_input.md", escape = "none")]
struct StageOneInputTemplate<'a> {
    rollout_path: &'a str,
    rollout_cwd: &'a str,
    rollout_contents: &'a str,
}

#[derive(Template)]
#[template(path = "memories/consolidation_input.md", escape = "none")]
struct ConsolidationInputTemplate<'a> {
    memory_root: &'a str,
    existing_memory_md: &'a str,
    rollout_summaries: &'a str,
    raw_memories: &'a str,
}

#[derive(Template)]
#[template(path = "memory_tool/developer_instructions.md", escape = "none")]
struct MemoryToolDeveloperInstructionsTemplate<'a> {
    base_path: &'a str,
    memory_summary: &'a str,
}

/// Byte budget for a model payload: a share of the context window when the
/// model reports one, the configured fallback token limit otherwise.
pub(crate) fn payload_byte_budget(model_info: &ModelInfo, config: &MemoriesConfig) -> usize {
    let tokens = model_info
        .context_window
        .filter(|window| *window > 0)
        .map(|window| (window as f64 * config.rollout_payload_percent) as usize)
        .filter(|tokens| *tokens > 0)
        .unwrap_or(config.fallback_token_limit);
    tokens.saturating_mul(APPROX_BYTES_PER_TOKEN)
}

/// Builds the stage-1 user message containing rollout metadata and content.
///
/// Large rollout payloads are truncated to the model's byte budget while
/// keeping both head and tail context.
pub(crate) fn build_stage_one_input_message(
    model_info: &ModelInfo,
    config: &MemoriesConfig,
    rollout_path: &Path,
    rollout_cwd: &Path,
    rollout_contents: &str,
) -> String {
    let budget = payload_byte_budget(model_info, config);
    let rollout_contents =
        match truncate_head_tail(rollout_contents, budget, ROLLOUT_TRUNCATION_MARKER) {
            Some(truncated) => {
                warn!(
                    "truncated rollout {} for stage-1 memory prompt to {budget} bytes",
                    rollout_path.display()
                );
                truncated
            }
            None => rollout_contents.to_string(),
        };

    let rollout_path = rollout_path.display().to_string();
    let rollout_cwd = rollout_cwd.display().to_string();
    let template = StageOneInputTemplate {
        rollout_path: &rollout_path,
        rollout_cwd: &rollout_cwd,
        rollout_contents: &rollout_contents,
    };
    template.render().unwrap_or_else(|err| {
        warn!("failed to render memories stage-one input template: {err}");
        format!(
            "Analyze this rollout and produce JSON with `raw_memory`, `rollout_summary`, and `rollout_slug`.\n\nrollout_context:\n- rollout_path: {rollout_path}\n- rollout_cwd: {rollout_cwd}\n\nrendered conversation:\n{rollout_contents}"
        )
    })
}

/// Builds the phase-2 user message from the synced artifacts.
pub(crate) fn build_consolidation_input_message(
    model_info: &ModelInfo,
    config: &MemoriesConfig,
    memory_root: &Path,
    existing_memory_md: Option<&str>,
    rollout_summary_files: &[String],
    raw_memories: &str,
) -> String {
    let budget = payload_byte_budget(model_info, config);
    let existing_memory_md = existing_memory_md
        .map(str::trim)
        .filter(|existing| !existing.is_empty())
        .unwrap_or("(none yet)");
    let rollout_summaries = if rollout_summary_files.is_empty() {
        "(none)".to_string()
    } else {
        rollout_summary_files
            .iter()
            .map(|name| format!("- rollout_summaries/{name}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    // MEMORY.md and the index are small; the raw memories take what is left.
    let raw_budget = budget
        .saturating_sub(existing_memory_md.len())
        .saturating_sub(rollout_summaries.len());
    let raw_memories = truncate_head_tail(raw_memories, raw_budget, RAW_MEMORIES_TRUNCATION_MARKER)
        .unwrap_or_else(|| raw_memories.to_string());

    let memory_root = memory_root.display().to_string();
    let template = ConsolidationInputTemplate {
        memory_root: &memory_root,
        existing_memory_md,
        rollout_summaries: &rollout_summaries,
        raw_memories: &raw_memories,
    };
    template.render().unwrap_or_else(|err| {
        warn!("failed to render memories consolidation input template: {err}");
        format!(
            "Consolidate the memories stored in: {memory_root}\n\n## Current MEMORY.md\n\n{existing_memory_md}\n\n## Rollout summary files\n\n{rollout_summaries}\n\n## Raw memories\n\n{raw_memories}"
        )
    })
}

/// Renders the developer instructions that point a session at its memories.
///
/// Returns `None` when `memory_summary.md` is missing or blank.
pub(crate) async fn build_memory_tool_developer_instructions(
    memory_root: &Path,
    token_limit: usize,
) -> Option<String> {
    let memory_summary = fs::read_to_string(memory_summary_file(memory_root))
        .await
        .ok()?
        .trim()
        .to_string();
    if memory_summary.is_empty() {
        return None;
    }
    let max_bytes = token_limit.saturating_mul(APPROX_BYTES_PER_TOKEN);
    let memory_summary = truncate_head_tail(&memory_summary, max_bytes, SUMMARY_TRUNCATION_MARKER)
        .unwrap_or(memory_summary);
    let base_path = memory_root.display().to_string();
    let template = MemoryToolDeveloperInstructionsTemplate {
        base_path: &base_path,
        memory_summary: &memory_summary,
    };
    template.render().ok()
}
