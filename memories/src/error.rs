use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryError>;

/// A failure that ends one memory job. Recorded in the job store as its
/// display string; never propagated past the job boundary.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("failed to read rollout {}: {source}", path.display())]
    ReadRollout {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model request failed: {0}")]
    ModelRequest(#[source] anyhow::Error),

    #[error("model returned an error: {0}")]
    ModelStopped(String),

    #[error("model returned no text output")]
    EmptyModelOutput,

    #[error("invalid model output: {0}")]
    Schema(#[from] SchemaError),

    #[error("failed to serialize rollout: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("job exceeded its {0}s deadline")]
    Deadline(i64),

    #[error("lease ownership lost before completion")]
    OwnershipLost,

    #[error("failed to write memory artifacts: {0}")]
    Io(#[from] std::io::Error),

    #[error("state db error: {0}")]
    State(#[source] anyhow::Error),
}

/// Reason a model payload was rejected by exact-shape validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("{context} must be a JSON object")]
    NotAnObject { context: String },

    #[error("{context} is missing required key `{key}`")]
    MissingKey { context: String, key: String },

    #[error("{context} has unexpected key `{key}`")]
    UnexpectedKey { context: String, key: String },

    #[error("{context}.{key} must be {expected}")]
    WrongType {
        context: String,
        key: String,
        expected: &'static str,
    },
}
