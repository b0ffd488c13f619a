use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt;
use std::path::PathBuf;

use super::epoch_seconds_to_datetime;

/// Stable identifier of a recorded session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ThreadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A discovered rollout as registered in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMetadata {
    pub id: ThreadId,
    /// Absolute path of the rollout JSONL file.
    pub rollout_path: PathBuf,
    /// Working directory the session ran in.
    pub cwd: PathBuf,
    /// Where the session came from (`cli`, `exec`, `vscode`, ...).
    pub source: String,
    /// Last activity in the rollout. Never moves backwards once stored.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct ThreadRow {
    id: String,
    rollout_path: String,
    cwd: String,
    source: String,
    updated_at: i64,
}

impl ThreadRow {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            rollout_path: row.try_get("rollout_path")?,
            cwd: row.try_get("cwd")?,
            source: row.try_get("source")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<ThreadRow> for ThreadMetadata {
    type Error = anyhow::Error;

    fn try_from(row: ThreadRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: ThreadId::from(row.id),
            rollout_path: PathBuf::from(row.rollout_path),
            cwd: PathBuf::from(row.cwd),
            source: row.source,
            updated_at: epoch_seconds_to_datetime(row.updated_at)?,
        })
    }
}
