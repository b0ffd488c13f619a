use super::*;
use crate::model::EnqueueOptions;
use crate::model::GlobalPhase2Job;
use crate::model::MemoryStatus;
use crate::model::Phase2JobClaimOutcome;
use crate::model::Stage1ClaimParams;
use crate::model::Stage1Job;
use crate::model::Stage1JobClaim;
use crate::model::Stage1JobStatus;
use crate::model::Stage1Output;
use crate::model::Stage1OutputRow;
use crate::model::Stage1StatusCounts;
use sqlx::Executor;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;
use uuid::Uuid;

const SECONDS_PER_HOUR: i64 = 60 * 60;
const SECONDS_PER_DAY: i64 = 24 * SECONDS_PER_HOUR;

impl StateRuntime {
    /// Deletes all persisted memory state in one transaction.
    ///
    /// Removes every `stage1_outputs` and `stage1_jobs` row, resets the
    /// singleton phase-2 row and the watermark. Threads are kept so the next
    /// startup can extract them again.
    pub async fn clear_memory_data(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
DELETE FROM stage1_outputs
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
DELETE FROM stage1_jobs
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
UPDATE global_phase2_job
SET
    status = 'idle',
    worker_id = NULL,
    ownership_token = NULL,
    lease_expires_at = NULL,
    input_watermark = 0,
    retry_after = NULL,
    last_error = NULL,
    dirty_requests = 0,
    dirty_requests_claimed = 0,
    dirty_requests_consumed = 0,
    started_at = NULL,
    finished_at = NULL
WHERE id = 1
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
UPDATE watermark
SET value = 0, updated_at = NULL
WHERE id = 1
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Selects and claims a batch of stage-1 jobs in one `BEGIN IMMEDIATE`
    /// transaction.
    ///
    /// Query behavior:
    /// - returns nothing when `running_cap` unexpired claims already exist,
    ///   and never claims more than the remaining headroom
    /// - keeps threads in the age window:
    ///   `updated_at >= now - max_age_days` and `updated_at <= now - min_idle_hours`
    /// - skips threads in `exclude_thread_ids` and jobs with an unexpired lease
    /// - keeps threads with no job row, `pending` jobs, `failed` jobs past
    ///   `retry_after`, `claimed` jobs whose lease expired, and jobs whose
    ///   `source_updated_at` is behind the thread
    /// - orders by `updated_at DESC, id DESC` and applies `scan_limit`
    ///
    /// Each selected job is set to `claimed` with a fresh ownership token and
    /// `lease_expires_at = now + lease_seconds`.
    pub async fn claim_stage1_jobs(
        &self,
        params: Stage1ClaimParams<'_>,
    ) -> anyhow::Result<Vec<Stage1JobClaim>> {
        let Stage1ClaimParams {
            now,
            scan_limit,
            max_claims,
            max_age_days,
            min_idle_hours,
            lease_seconds,
            running_cap,
            worker_id,
            exclude_thread_ids,
        } = params;
        if scan_limit == 0 || max_claims == 0 || running_cap == 0 {
            return Ok(Vec::new());
        }

        let max_age_cutoff =
            now.saturating_sub(max_age_days.max(0).saturating_mul(SECONDS_PER_DAY));
        let idle_cutoff =
            now.saturating_sub(min_idle_hours.max(0).saturating_mul(SECONDS_PER_HOUR));
        let lease_expires_at = now.saturating_add(lease_seconds.max(0));

        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let running: i64 = sqlx::query(
            r#"
SELECT COUNT(*) AS running
FROM stage1_jobs
WHERE status = 'claimed'
  AND lease_expires_at IS NOT NULL
  AND lease_expires_at > ?
            "#,
        )
        .bind(now)
        .fetch_one(&mut *tx)
        .await?
        .try_get("running")?;
        let headroom = (running_cap as i64).saturating_sub(running);
        if headroom <= 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }
        let max_claims = max_claims.min(headroom as usize);

        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
SELECT
    threads.id AS id,
    threads.rollout_path AS rollout_path,
    threads.cwd AS cwd,
    threads.source AS source,
    threads.updated_at AS updated_at
FROM threads
LEFT JOIN stage1_jobs AS jobs
    ON jobs.thread_id = threads.id
WHERE threads.updated_at >= "#,
        );
        builder.push_bind(max_age_cutoff);
        builder
            .push(" AND threads.updated_at <= ")
            .push_bind(idle_cutoff);
        builder
            .push(
                " AND NOT (COALESCE(jobs.status, '') = 'claimed' AND COALESCE(jobs.lease_expires_at, 0) > ",
            )
            .push_bind(now)
            .push(")");
        builder.push(
            r#"
  AND (
      jobs.thread_id IS NULL
      OR jobs.status = 'pending'
      OR jobs.status = 'claimed'
      OR threads.updated_at > jobs.source_updated_at
      OR (jobs.status = 'failed' AND COALESCE(jobs.retry_after, 0) <= "#,
        );
        builder.push_bind(now).push("))");
        if !exclude_thread_ids.is_empty() {
            builder.push(" AND threads.id NOT IN (");
            let mut separated = builder.separated(", ");
            for thread_id in exclude_thread_ids {
                separated.push_bind(thread_id.as_str());
            }
            separated.push_unseparated(")");
        }
        builder
            .push(" ORDER BY threads.updated_at DESC, threads.id DESC LIMIT ")
            .push_bind(scan_limit as i64);

        let candidates = builder
            .build()
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| ThreadRow::try_from_row(&row).and_then(ThreadMetadata::try_from))
            .collect::<Result<Vec<_>, _>>()?;

        let mut claimed = Vec::new();
        for thread in candidates {
            if claimed.len() >= max_claims {
                break;
            }
            let ownership_token = Uuid::new_v4().to_string();
            let source_updated_at = thread.updated_at.timestamp();
            let rows_affected = sqlx::query(
                r#"
INSERT INTO stage1_jobs (
    thread_id,
    status,
    worker_id,
    ownership_token,
    lease_expires_at,
    retry_after,
    source_updated_at,
    last_error,
    started_at,
    finished_at
) VALUES (?, 'claimed', ?, ?, ?, NULL, ?, NULL, ?, NULL)
ON CONFLICT(thread_id) DO UPDATE SET
    status = 'claimed',
    worker_id = excluded.worker_id,
    ownership_token = excluded.ownership_token,
    lease_expires_at = excluded.lease_expires_at,
    retry_after = NULL,
    source_updated_at = excluded.source_updated_at,
    last_error = NULL,
    started_at = excluded.started_at,
    finished_at = NULL
WHERE NOT (
    stage1_jobs.status = 'claimed'
    AND COALESCE(stage1_jobs.lease_expires_at, 0) > excluded.started_at
)
                "#,
            )
            .bind(thread.id.as_str())
            .bind(worker_id)
            .bind(ownership_token.as_str())
            .bind(lease_expires_at)
            .bind(source_updated_at)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if rows_affected > 0 {
                claimed.push(Stage1JobClaim {
                    thread,
                    ownership_token,
                    source_updated_at,
                });
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Lists the most recent non-empty stage-1 outputs for global consolidation.
    ///
    /// Query behavior:
    /// - filters out rows where both `raw_memory` and `rollout_summary` are blank
    /// - joins `threads` to include thread `cwd`
    /// - orders by `source_updated_at DESC, thread_id DESC`
    /// - applies `LIMIT n`
    pub async fn list_stage1_outputs_for_global(
        &self,
        n: usize,
    ) -> anyhow::Result<Vec<Stage1Output>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, Stage1OutputRow>(
            r#"
SELECT
    so.thread_id,
    so.source_updated_at,
    so.raw_memory,
    so.rollout_summary,
    so.rollout_slug,
    so.generated_at,
    COALESCE(t.cwd, '') AS cwd
FROM stage1_outputs AS so
LEFT JOIN threads AS t
    ON t.id = so.thread_id
WHERE length(trim(so.raw_memory)) > 0 OR length(trim(so.rollout_summary)) > 0
ORDER BY so.source_updated_at DESC, so.thread_id DESC
LIMIT ?
            "#,
        )
        .bind(n as i64)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter().map(Stage1Output::try_from).collect()
    }

    /// Marks a claimed stage-1 job successful and upserts generated output.
    ///
    /// Transaction behavior:
    /// - updates `stage1_jobs` only for the currently owned claimed row
    /// - upserts `stage1_outputs`, replacing an existing output only when
    ///   `source_updated_at` is newer or equal
    /// - enqueues the global phase-2 job at `source_updated_at`, forcing a
    ///   consolidation when that does not advance the watermark
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_stage1_job_succeeded(
        &self,
        thread_id: &ThreadId,
        ownership_token: &str,
        source_updated_at: i64,
        raw_memory: &str,
        rollout_summary: &str,
        rollout_slug: Option<&str>,
        now: i64,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows_affected = finish_stage1_job(
            &mut *tx,
            thread_id,
            ownership_token,
            Stage1JobStatus::Succeeded,
            now,
        )
        .await?;
        if rows_affected == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
INSERT INTO stage1_outputs (
    thread_id,
    source_updated_at,
    raw_memory,
    rollout_summary,
    rollout_slug,
    generated_at
) VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT(thread_id) DO UPDATE SET
    source_updated_at = excluded.source_updated_at,
    raw_memory = excluded.raw_memory,
    rollout_summary = excluded.rollout_summary,
    rollout_slug = excluded.rollout_slug,
    generated_at = excluded.generated_at
WHERE excluded.source_updated_at >= stage1_outputs.source_updated_at
            "#,
        )
        .bind(thread_id.as_str())
        .bind(source_updated_at)
        .bind(raw_memory)
        .bind(rollout_summary)
        .bind(rollout_slug)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        enqueue_global_watermark_with_executor(
            &mut *tx,
            source_updated_at,
            EnqueueOptions {
                force_dirty_when_not_advanced: true,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Marks a claimed stage-1 job successful when extraction produced no output.
    ///
    /// Transaction behavior:
    /// - updates `stage1_jobs` only for the currently owned claimed row
    /// - deletes any existing `stage1_outputs` row for the thread
    /// - when a row was deleted, force-dirties the global phase-2 job so the
    ///   consolidated memory drops it
    pub async fn mark_stage1_job_succeeded_no_output(
        &self,
        thread_id: &ThreadId,
        ownership_token: &str,
        now: i64,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows_affected = finish_stage1_job(
            &mut *tx,
            thread_id,
            ownership_token,
            Stage1JobStatus::SucceededNoOutput,
            now,
        )
        .await?;
        if rows_affected == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        let source_updated_at = sqlx::query(
            r#"
SELECT source_updated_at
FROM stage1_jobs
WHERE thread_id = ? AND ownership_token = ?
            "#,
        )
        .bind(thread_id.as_str())
        .bind(ownership_token)
        .fetch_one(&mut *tx)
        .await?
        .try_get::<i64, _>("source_updated_at")?;

        let deleted_rows = sqlx::query(
            r#"
DELETE FROM stage1_outputs
WHERE thread_id = ?
            "#,
        )
        .bind(thread_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if deleted_rows > 0 {
            enqueue_global_watermark_with_executor(
                &mut *tx,
                source_updated_at,
                EnqueueOptions {
                    force_dirty_when_not_advanced: true,
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Marks a claimed stage-1 job as failed and schedules retry backoff.
    ///
    /// Query behavior:
    /// - updates only the owned claimed row
    /// - sets `status='failed'`, clears the lease, writes `last_error`
    /// - sets `retry_after = now + retry_delay_seconds`
    /// - bumps `attempts`; there is no cap on retries
    pub async fn mark_stage1_job_failed(
        &self,
        thread_id: &ThreadId,
        ownership_token: &str,
        retry_delay_seconds: i64,
        failure_reason: &str,
        now: i64,
    ) -> anyhow::Result<bool> {
        let retry_after = now.saturating_add(retry_delay_seconds.max(0));
        let rows_affected = sqlx::query(
            r#"
UPDATE stage1_jobs
SET
    status = 'failed',
    finished_at = ?,
    lease_expires_at = NULL,
    retry_after = ?,
    attempts = attempts + 1,
    last_error = ?
WHERE thread_id = ?
  AND status = 'claimed' AND ownership_token = ?
            "#,
        )
        .bind(now)
        .bind(retry_after)
        .bind(failure_reason)
        .bind(thread_id.as_str())
        .bind(ownership_token)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Raises the global phase-2 job's `input_watermark`.
    ///
    /// With `force_dirty_when_not_advanced`, a `source_updated_at` at or
    /// below the consolidated watermark records a force-dirty request so the
    /// next claim still runs. A pending retry backoff is cleared unless the
    /// job is currently claimed.
    pub async fn enqueue_global_watermark(
        &self,
        source_updated_at: i64,
        options: EnqueueOptions,
    ) -> anyhow::Result<()> {
        enqueue_global_watermark_with_executor(self.pool.as_ref(), source_updated_at, options).await
    }

    /// Attempts to claim the global phase-2 consolidation job.
    ///
    /// Claim semantics, checked in order inside `BEGIN IMMEDIATE`:
    /// - `AlreadyClaimed` when a claimed row holds an unexpired lease
    /// - `NotReady` while `retry_after` is in the future
    /// - `NotReady` unless dirty: `max(input_watermark, newest output) >
    ///   watermark`, or an unconsumed force-dirty request
    /// - otherwise sets `status='claimed'` with a fresh token and lease,
    ///   snapshots `dirty_requests`, and returns `Claimed`
    pub async fn try_claim_global_phase2_job(
        &self,
        worker_id: &str,
        lease_seconds: i64,
        now: i64,
    ) -> anyhow::Result<Phase2JobClaimOutcome> {
        let lease_expires_at = now.saturating_add(lease_seconds.max(0));
        let ownership_token = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let job = GlobalPhase2Job::try_from_row(
            &sqlx::query(GLOBAL_PHASE2_SELECT)
                .fetch_one(&mut *tx)
                .await?,
        )?;
        if job.is_leased_at(now) {
            tx.commit().await?;
            return Ok(Phase2JobClaimOutcome::AlreadyClaimed);
        }
        if job.retry_after.is_some_and(|retry_after| retry_after > now) {
            tx.commit().await?;
            return Ok(Phase2JobClaimOutcome::NotReady);
        }

        let row = sqlx::query(
            r#"
SELECT
    (SELECT value FROM watermark WHERE id = 1) AS watermark,
    (SELECT MAX(source_updated_at) FROM stage1_outputs) AS newest_output
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;
        let watermark: i64 = row.try_get("watermark")?;
        let newest_output: Option<i64> = row.try_get("newest_output")?;
        let newest_input = job.input_watermark.max(newest_output.unwrap_or(0));
        if newest_input <= watermark && !job.has_pending_dirty_request() {
            tx.commit().await?;
            return Ok(Phase2JobClaimOutcome::NotReady);
        }

        let rows_affected = sqlx::query(
            r#"
UPDATE global_phase2_job
SET
    status = 'claimed',
    worker_id = ?,
    ownership_token = ?,
    lease_expires_at = ?,
    retry_after = NULL,
    last_error = NULL,
    dirty_requests_claimed = dirty_requests,
    started_at = ?,
    finished_at = NULL
WHERE id = 1
  AND NOT (status = 'claimed' AND COALESCE(lease_expires_at, 0) > ?)
            "#,
        )
        .bind(worker_id)
        .bind(ownership_token.as_str())
        .bind(lease_expires_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        if rows_affected == 0 {
            Ok(Phase2JobClaimOutcome::AlreadyClaimed)
        } else {
            Ok(Phase2JobClaimOutcome::Claimed {
                ownership_token,
                input_watermark: job.input_watermark,
            })
        }
    }

    /// Extends the lease for an owned claimed phase-2 global job.
    pub async fn heartbeat_global_phase2_job(
        &self,
        ownership_token: &str,
        lease_seconds: i64,
        now: i64,
    ) -> anyhow::Result<bool> {
        let lease_expires_at = now.saturating_add(lease_seconds.max(0));
        let rows_affected = sqlx::query(
            r#"
UPDATE global_phase2_job
SET lease_expires_at = ?
WHERE id = 1
  AND status = 'claimed' AND ownership_token = ?
            "#,
        )
        .bind(lease_expires_at)
        .bind(ownership_token)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Marks the owned claimed global phase-2 job as succeeded.
    ///
    /// Transaction behavior:
    /// - updates only the owned claimed singleton row back to `idle`
    /// - consumes the force-dirty requests observed at claim time
    /// - advances the watermark to `max(watermark, completed_watermark)`
    pub async fn mark_global_phase2_job_succeeded(
        &self,
        ownership_token: &str,
        completed_watermark: i64,
        now: i64,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rows_affected = sqlx::query(
            r#"
UPDATE global_phase2_job
SET
    status = 'idle',
    finished_at = ?,
    lease_expires_at = NULL,
    retry_after = NULL,
    last_error = NULL,
    dirty_requests_consumed = max(dirty_requests_consumed, dirty_requests_claimed)
WHERE id = 1
  AND status = 'claimed' AND ownership_token = ?
            "#,
        )
        .bind(now)
        .bind(ownership_token)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
UPDATE watermark
SET value = max(value, ?), updated_at = ?
WHERE id = 1
            "#,
        )
        .bind(completed_watermark)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Marks the owned claimed global phase-2 job as failed and schedules retry.
    pub async fn mark_global_phase2_job_failed(
        &self,
        ownership_token: &str,
        retry_delay_seconds: i64,
        failure_reason: &str,
        now: i64,
    ) -> anyhow::Result<bool> {
        let retry_after = now.saturating_add(retry_delay_seconds.max(0));
        let rows_affected = sqlx::query(
            r#"
UPDATE global_phase2_job
SET
    status = 'failed',
    finished_at = ?,
    lease_expires_at = NULL,
    retry_after = ?,
    last_error = ?
WHERE id = 1
  AND status = 'claimed' AND ownership_token = ?
            "#,
        )
        .bind(now)
        .bind(retry_after)
        .bind(failure_reason)
        .bind(ownership_token)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Fallback failure finalization when ownership may have been lost.
    ///
    /// Query behavior:
    /// - same state transition as [`Self::mark_global_phase2_job_failed`]
    /// - matches a claimed row that still carries `ownership_token`, carries
    ///   no token, or whose lease has already expired
    /// - never touches a row another worker holds with a fresh lease
    pub async fn mark_global_phase2_job_failed_unowned(
        &self,
        ownership_token: &str,
        retry_delay_seconds: i64,
        failure_reason: &str,
        now: i64,
    ) -> anyhow::Result<bool> {
        let retry_after = now.saturating_add(retry_delay_seconds.max(0));
        let rows_affected = sqlx::query(
            r#"
UPDATE global_phase2_job
SET
    status = 'failed',
    finished_at = ?,
    lease_expires_at = NULL,
    retry_after = ?,
    last_error = ?
WHERE id = 1
  AND status = 'claimed'
  AND (
      ownership_token = ?
      OR ownership_token IS NULL
      OR COALESCE(lease_expires_at, 0) <= ?
  )
            "#,
        )
        .bind(now)
        .bind(retry_after)
        .bind(failure_reason)
        .bind(ownership_token)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    pub async fn get_stage1_job(&self, thread_id: &ThreadId) -> anyhow::Result<Option<Stage1Job>> {
        let row = sqlx::query(
            r#"
SELECT
    thread_id,
    status,
    worker_id,
    ownership_token,
    lease_expires_at,
    retry_after,
    source_updated_at,
    last_error,
    attempts
FROM stage1_jobs
WHERE thread_id = ?
            "#,
        )
        .bind(thread_id.as_str())
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(|row| Stage1Job::try_from_row(&row)).transpose()
    }

    pub async fn get_global_phase2_job(&self) -> anyhow::Result<GlobalPhase2Job> {
        let row = sqlx::query(GLOBAL_PHASE2_SELECT)
            .fetch_one(self.pool.as_ref())
            .await?;
        GlobalPhase2Job::try_from_row(&row)
    }

    /// Newest stage-1 `source_updated_at` folded into consolidated memory.
    pub async fn get_memory_watermark(&self) -> anyhow::Result<i64> {
        let value = sqlx::query(
            r#"
SELECT COALESCE((SELECT value FROM watermark WHERE id = 1), 0) AS value
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await?
        .try_get("value")?;
        Ok(value)
    }

    /// Aggregate counters for status reporting.
    pub async fn memory_status(&self) -> anyhow::Result<MemoryStatus> {
        let threads: i64 = sqlx::query("SELECT COUNT(*) AS n FROM threads")
            .fetch_one(self.pool.as_ref())
            .await?
            .try_get("n")?;
        let stage1_outputs: i64 = sqlx::query("SELECT COUNT(*) AS n FROM stage1_outputs")
            .fetch_one(self.pool.as_ref())
            .await?
            .try_get("n")?;

        let mut stage1_jobs = Stage1StatusCounts::default();
        let rows = sqlx::query(
            r#"
SELECT status, COUNT(*) AS n
FROM stage1_jobs
GROUP BY status
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let slot = match status.parse::<Stage1JobStatus>()? {
                Stage1JobStatus::Pending => &mut stage1_jobs.pending,
                Stage1JobStatus::Claimed => &mut stage1_jobs.claimed,
                Stage1JobStatus::Succeeded => &mut stage1_jobs.succeeded,
                Stage1JobStatus::SucceededNoOutput => &mut stage1_jobs.succeeded_no_output,
                Stage1JobStatus::Failed => &mut stage1_jobs.failed,
            };
            *slot = count;
        }

        Ok(MemoryStatus {
            threads,
            stage1_jobs,
            stage1_outputs,
            phase2: self.get_global_phase2_job().await?,
            watermark: self.get_memory_watermark().await?,
        })
    }
}

const GLOBAL_PHASE2_SELECT: &str = r#"
SELECT
    status,
    worker_id,
    ownership_token,
    lease_expires_at,
    input_watermark,
    retry_after,
    last_error,
    dirty_requests,
    dirty_requests_claimed,
    dirty_requests_consumed
FROM global_phase2_job
WHERE id = 1
"#;

async fn finish_stage1_job<'e, E>(
    executor: E,
    thread_id: &ThreadId,
    ownership_token: &str,
    status: Stage1JobStatus,
    now: i64,
) -> anyhow::Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows_affected = sqlx::query(
        r#"
UPDATE stage1_jobs
SET
    status = ?,
    finished_at = ?,
    lease_expires_at = NULL,
    retry_after = NULL,
    last_error = NULL
WHERE thread_id = ?
  AND status = 'claimed' AND ownership_token = ?
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(thread_id.as_str())
    .bind(ownership_token)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows_affected)
}

async fn enqueue_global_watermark_with_executor<'e, E>(
    executor: E,
    source_updated_at: i64,
    options: EnqueueOptions,
) -> anyhow::Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
UPDATE global_phase2_job
SET
    input_watermark = max(input_watermark, ?),
    dirty_requests = dirty_requests + CASE
        WHEN ? AND ? <= COALESCE((SELECT value FROM watermark WHERE id = 1), 0) THEN 1
        ELSE 0
    END,
    retry_after = CASE
        WHEN status = 'claimed' THEN retry_after
        ELSE NULL
    END
WHERE id = 1
        "#,
    )
    .bind(source_updated_at)
    .bind(options.force_dirty_when_not_advanced)
    .bind(source_updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[cfg(test)]
#[path = "memories_tests.rs"]
mod tests;
