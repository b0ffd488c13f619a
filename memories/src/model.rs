//! Boundary to the language model that performs extraction and consolidation.
//!
//! Provider adapters live outside this crate; the pipeline only needs one
//! structured completion per job.

use crate::error::MemoryError;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Model identity plus what the pipeline needs to size its prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub slug: String,
    /// Context window in tokens, when the provider reports one.
    pub context_window: Option<i64>,
}

impl ModelInfo {
    pub fn new(slug: impl Into<String>, context_window: Option<i64>) -> Self {
        Self {
            slug: slug.into(),
            context_window,
        }
    }

    /// Returns a copy pointed at `slug` when an override is configured.
    pub(crate) fn with_slug_override(&self, slug: Option<&str>) -> Self {
        match slug {
            Some(slug) => Self {
                slug: slug.to_string(),
                context_window: self.context_window,
            },
            None => self.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// JSON schema the response text must satisfy.
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    /// Reasoning traces and other non-text output; ignored by the pipeline.
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

impl TokenUsage {
    pub fn add_assign(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub stop_reason: StopReason,
    /// Provider message accompanying [`StopReason::Error`].
    pub error_message: Option<String>,
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    /// Concatenates every text block in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect()
    }
}

/// Returns the response text, or the failure it represents.
pub(crate) fn response_text(response: &ModelResponse) -> crate::error::Result<String> {
    if response.stop_reason == StopReason::Error {
        let message = response
            .error_message
            .clone()
            .unwrap_or_else(|| "unknown provider error".to_string());
        return Err(MemoryError::ModelStopped(message));
    }
    let text = response.text();
    if text.trim().is_empty() {
        return Err(MemoryError::EmptyModelOutput);
    }
    Ok(text)
}

#[async_trait]
pub trait MemoryModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse>;
}
