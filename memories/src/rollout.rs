use crate::error::MemoryError;
use crate::error::Result;
use mnemo_utils_string::truncate_head_tail;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// Tool results worth remembering. Everything else (search hits, image
/// payloads, MCP chatter) is dropped before extraction.
const MEMORY_TOOL_ALLOWLIST: &[&str] = &[
    "shell",
    "exec_command",
    "apply_patch",
    "read_file",
    "list_dir",
    "grep_files",
];
const MEMORY_MESSAGE_ROLES: &[&str] = &["system", "user", "assistant"];
pub(crate) const MAX_TOOL_RESULT_BYTES: usize = 2_000;
const TOOL_RESULT_TRUNCATION_MARKER: &str = "\n[... tool output truncated ...]\n";

/// One line of a rollout JSONL file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutItem {
    Message {
        role: String,
        content: String,
    },
    ToolResult {
        tool_name: String,
        output: String,
    },
    /// Session metadata, reasoning, events and anything else the pipeline
    /// has no use for.
    #[serde(other)]
    Other,
}

#[derive(Debug, Default)]
pub(crate) struct LoadedRollout {
    pub(crate) items: Vec<RolloutItem>,
    /// Non-blank lines that failed to parse.
    pub(crate) skipped_lines: usize,
}

pub(crate) async fn load_rollout_items(path: &Path) -> Result<LoadedRollout> {
    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| MemoryError::ReadRollout {
                path: path.to_path_buf(),
                source,
            })?;
    let loaded = parse_rollout_lines(&contents);
    if loaded.skipped_lines > 0 {
        debug!(
            "skipped {} unparseable line(s) in rollout {}",
            loaded.skipped_lines,
            path.display()
        );
    }
    Ok(loaded)
}

fn parse_rollout_lines(contents: &str) -> LoadedRollout {
    let mut loaded = LoadedRollout::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RolloutItem>(line) {
            Ok(item) => loaded.items.push(item),
            Err(_) => loaded.skipped_lines += 1,
        }
    }
    loaded
}

/// Keeps conversational messages and allow-listed tool results, truncating
/// each tool result to [`MAX_TOOL_RESULT_BYTES`].
pub(crate) fn filter_rollout_items(items: &[RolloutItem]) -> Vec<RolloutItem> {
    items
        .iter()
        .filter_map(|item| match item {
            RolloutItem::Message { role, .. }
                if MEMORY_MESSAGE_ROLES.contains(&role.to_ascii_lowercase().as_str()) =>
            {
                Some(item.clone())
            }
            RolloutItem::ToolResult { tool_name, output }
                if MEMORY_TOOL_ALLOWLIST.contains(&tool_name.as_str()) =>
            {
                let output = truncate_head_tail(
                    output,
                    MAX_TOOL_RESULT_BYTES,
                    TOOL_RESULT_TRUNCATION_MARKER,
                )
                .unwrap_or_else(|| output.clone());
                Some(RolloutItem::ToolResult {
                    tool_name: tool_name.clone(),
                    output,
                })
            }
            RolloutItem::Message { .. } | RolloutItem::ToolResult { .. } | RolloutItem::Other => {
                None
            }
        })
        .collect()
}

/// Serializes filtered stage-1 memory items for prompt inclusion.
pub(crate) fn serialize_filtered_rollout_items(items: &[RolloutItem]) -> Result<String> {
    let filtered = filter_rollout_items(items);
    Ok(serde_json::to_string(&filtered)?)
}
