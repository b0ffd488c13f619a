use crate::ThreadId;
use crate::ThreadMetadata;
use crate::migrations::MIGRATOR;
use crate::model::ThreadRow;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

mod memories;
// Stage-1 / phase-2 job lifecycle methods live in `runtime/memories.rs`.
#[cfg(test)]
mod test_support;

pub const STATE_DB_FILENAME: &str = "memories";
pub const STATE_DB_VERSION: u32 = 1;

#[derive(Clone)]
pub struct StateRuntime {
    pool: Arc<sqlx::SqlitePool>,
}

impl StateRuntime {
    /// Initialize the state runtime rooted at `home`.
    ///
    /// This opens (and migrates) the SQLite database at
    /// `home/memories_<version>.sqlite`, removing database files left behind
    /// by other schema versions.
    pub async fn init(home: PathBuf) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&home).await?;
        remove_stale_state_db_files(&home).await;
        let state_path = state_db_path(home.as_path());
        let pool = open_sqlite(&state_path).await.inspect_err(|err| {
            warn!("failed to open memory store at {}: {err}", state_path.display());
        })?;
        Ok(Arc::new(Self {
            pool: Arc::new(pool),
        }))
    }

    /// Register or refresh discovered threads.
    ///
    /// `updated_at` only ever moves forward: re-registering a thread with an
    /// older timestamp keeps the stored one. A `pending` stage-1 job row is
    /// seeded for threads seen for the first time.
    pub async fn upsert_threads(&self, threads: &[ThreadMetadata]) -> anyhow::Result<()> {
        if threads.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for thread in threads {
            sqlx::query(
                r#"
INSERT INTO threads (
    id,
    rollout_path,
    cwd,
    source,
    updated_at
) VALUES (?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    rollout_path = excluded.rollout_path,
    cwd = excluded.cwd,
    source = excluded.source,
    updated_at = max(threads.updated_at, excluded.updated_at)
                "#,
            )
            .bind(thread.id.as_str())
            .bind(thread.rollout_path.display().to_string())
            .bind(thread.cwd.display().to_string())
            .bind(thread.source.as_str())
            .bind(thread.updated_at.timestamp())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
INSERT INTO stage1_jobs (thread_id, status, source_updated_at)
VALUES (?, 'pending', -1)
ON CONFLICT(thread_id) DO NOTHING
                "#,
            )
            .bind(thread.id.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Load thread metadata by id.
    pub async fn get_thread(&self, id: &ThreadId) -> anyhow::Result<Option<ThreadMetadata>> {
        let row = sqlx::query(
            r#"
SELECT id, rollout_path, cwd, source, updated_at
FROM threads
WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(|row| ThreadRow::try_from_row(&row).and_then(ThreadMetadata::try_from))
            .transpose()
    }
}

async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

pub fn state_db_filename() -> String {
    format!("{STATE_DB_FILENAME}_{STATE_DB_VERSION}.sqlite")
}

pub fn state_db_path(home: &Path) -> PathBuf {
    home.join(state_db_filename())
}

async fn remove_stale_state_db_files(home: &Path) {
    let current_name = state_db_filename();
    let mut entries = match tokio::fs::read_dir(home).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!("failed to list {} for stale memory stores: {err}", home.display());
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("failed to list {} for stale memory stores: {err}", home.display());
                break;
            }
        };
        let is_file = matches!(entry.file_type().await, Ok(file_type) if file_type.is_file());
        let file_name = entry.file_name();
        if !is_file || !is_stale_state_db_file(&file_name.to_string_lossy(), &current_name) {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("removed stale memory store {}", path.display()),
            Err(err) => warn!("could not remove stale memory store {}: {err}", path.display()),
        }
    }
}

/// True for store files, and their `-wal`/`-shm`/`-journal` siblings, that
/// belong to a schema version other than `current_name`.
fn is_stale_state_db_file(file_name: &str, current_name: &str) -> bool {
    let base = file_name
        .strip_suffix("-wal")
        .or_else(|| file_name.strip_suffix("-shm"))
        .or_else(|| file_name.strip_suffix("-journal"))
        .unwrap_or(file_name);
    if base == current_name {
        return false;
    }
    match base
        .strip_prefix(STATE_DB_FILENAME)
        .and_then(|rest| rest.strip_suffix(".sqlite"))
    {
        Some("") => true,
        Some(version) => version.strip_prefix('_').is_some_and(|digits| {
            !digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit())
        }),
        None => false,
    }
}
