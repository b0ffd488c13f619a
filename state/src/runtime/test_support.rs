use chrono::DateTime;
use chrono::Utc;
use std::path::Path;

use crate::ThreadId;
use crate::ThreadMetadata;

pub(crate) fn test_thread(home: &Path, id: &str, updated_at: i64) -> ThreadMetadata {
    ThreadMetadata {
        id: ThreadId::from(id),
        rollout_path: home.join(format!("rollout-{id}.jsonl")),
        cwd: home.join("workspace"),
        source: "cli".to_string(),
        updated_at: DateTime::<Utc>::from_timestamp(updated_at, 0).unwrap_or_default(),
    }
}
