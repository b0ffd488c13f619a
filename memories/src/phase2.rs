use crate::context::MemoryRunContext;
use crate::error::MemoryError;
use crate::model::ModelRequest;
use crate::model::TokenUsage;
use crate::model::response_text;
use crate::prompts::CONSOLIDATION_SYSTEM_PROMPT;
use crate::prompts::build_consolidation_input_message;
use crate::schema::ConsolidationOutput;
use crate::schema::SkillFile;
use crate::schema::consolidation_output_schema;
use crate::schema::parse_consolidation_output;
use crate::storage::apply_consolidation;
use crate::storage::prune_consolidated_artifacts;
use crate::storage::read_memory_registry;
use crate::storage::rebuild_raw_memories_file;
use crate::storage::sync_rollout_summaries;
use mnemo_state::Phase2JobClaimOutcome;
use mnemo_state::StateRuntime;
use mnemo_state::Stage1Output;
use mnemo_utils_sanitizer::redact_secrets;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

const CONSOLIDATION_MAX_OUTPUT_TOKENS: u32 = 32_000;

#[derive(Debug, Clone, Default)]
struct Claim {
    token: String,
    watermark: i64,
}

/// What a single phase-2 invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Phase2Outcome {
    /// Nothing new to consolidate, or the job is backing off.
    NotReady,
    /// Another worker holds a fresh lease.
    AlreadyClaimed,
    /// The claim attempt itself failed (store unavailable).
    ClaimFailed,
    /// No stage-1 output is left; consolidated artifacts were removed.
    SucceededNoInput { watermark: i64 },
    Succeeded {
        watermark: i64,
        inputs: usize,
        token_usage: TokenUsage,
    },
    Failed { reason: String },
}

/// Runs memory phase 2 (aka consolidation) in strict order. The method
/// represents the linear flow of the consolidation phase.
pub async fn run(ctx: &MemoryRunContext) -> Phase2Outcome {
    let db = ctx.state_db.as_ref();
    let root = ctx.memory_root.as_path();

    // 1. Claim the job.
    let claim = match job::claim(ctx).await {
        Ok(claim) => claim,
        Err(outcome) => return outcome,
    };

    // 2. Query the memories.
    let raw_memories = match db
        .list_stage1_outputs_for_global(ctx.config.max_raw_memories_for_global)
        .await
    {
        Ok(memories) => memories,
        Err(err) => {
            error!("failed to list stage1 outputs for global consolidation: {err}");
            return job::failed(ctx, &claim, &format!("failed to load stage-1 outputs: {err}"))
                .await;
        }
    };
    let new_watermark = completion_watermark(claim.watermark, &raw_memories);

    // 3. Sync the file system with the outputs loaded at step 2.
    // [`rollout_summaries/`]
    let rollout_summary_files = match sync_rollout_summaries(root, &raw_memories).await {
        Ok(files) => files,
        Err(err) => {
            error!("failed syncing rollout summaries for global consolidation: {err}");
            return job::failed(ctx, &claim, &format!("failed to sync rollout summaries: {err}"))
                .await;
        }
    };
    // [`raw_memories.md`]
    let raw_memories_md = match rebuild_raw_memories_file(root, &raw_memories).await {
        Ok(body) => body,
        Err(err) => {
            error!("failed rebuilding raw memories for global consolidation: {err}");
            return job::failed(ctx, &claim, &format!("failed to rebuild raw memories: {err}"))
                .await;
        }
    };

    // 4. Nothing to consolidate: drop stale artifacts and finish without a
    //    model call. We check only after the file system sync.
    if raw_memories.is_empty() {
        if let Err(err) = prune_consolidated_artifacts(root).await {
            error!("failed pruning consolidated memory artifacts: {err}");
            return job::failed(
                ctx,
                &claim,
                &format!("failed to prune consolidated artifacts: {err}"),
            )
            .await;
        }
        return job::succeed(
            ctx,
            &claim,
            new_watermark,
            Phase2Outcome::SucceededNoInput {
                watermark: new_watermark,
            },
        )
        .await;
    }

    // 5. Keep the lease alive while the consolidator runs.
    let heartbeat = Heartbeat::start(ctx, &claim);

    // 6. Consolidate.
    let consolidated = consolidate(ctx, &rollout_summary_files, &raw_memories_md).await;
    if heartbeat.stop().await {
        return job::failed(ctx, &claim, &MemoryError::OwnershipLost.to_string()).await;
    }
    let (output, token_usage) = match consolidated {
        Ok(consolidated) => consolidated,
        Err(err) => {
            warn!("memory phase-2 consolidation failed: {err}");
            return job::failed(ctx, &claim, &err.to_string()).await;
        }
    };

    // 7. Write the artifacts and commit.
    if let Err(err) = apply_consolidation(root, &output).await {
        error!("failed writing consolidated memory artifacts: {err}");
        return job::failed(ctx, &claim, &MemoryError::Io(err).to_string()).await;
    }
    info!(
        "memory phase-2 consolidation complete: {} input(s), {} skill(s), watermark {}, {} total tokens",
        raw_memories.len(),
        output.skills.len(),
        new_watermark,
        token_usage.total_tokens
    );
    job::succeed(
        ctx,
        &claim,
        new_watermark,
        Phase2Outcome::Succeeded {
            watermark: new_watermark,
            inputs: raw_memories.len(),
            token_usage,
        },
    )
    .await
}

async fn consolidate(
    ctx: &MemoryRunContext,
    rollout_summary_files: &[String],
    raw_memories_md: &str,
) -> crate::error::Result<(ConsolidationOutput, TokenUsage)> {
    let existing_memory_md = read_memory_registry(&ctx.memory_root).await;
    let request = ModelRequest {
        model: ctx.phase_2_model.slug.clone(),
        system_prompt: CONSOLIDATION_SYSTEM_PROMPT.to_string(),
        user_prompt: build_consolidation_input_message(
            &ctx.phase_2_model,
            &ctx.config,
            &ctx.memory_root,
            existing_memory_md.as_deref(),
            rollout_summary_files,
            raw_memories_md,
        ),
        max_output_tokens: Some(CONSOLIDATION_MAX_OUTPUT_TOKENS),
        temperature: None,
        output_schema: Some(consolidation_output_schema()),
    };
    let response = ctx
        .model_client
        .complete(request)
        .await
        .map_err(MemoryError::ModelRequest)?;
    let text = response_text(&response)?;
    let output = redact_consolidation_output(parse_consolidation_output(&text)?);
    Ok((output, response.usage))
}

fn redact_consolidation_output(output: ConsolidationOutput) -> ConsolidationOutput {
    let redact_files = |files: Vec<SkillFile>| {
        files
            .into_iter()
            .map(|file| SkillFile {
                path: file.path,
                content: redact_secrets(file.content),
            })
            .collect::<Vec<_>>()
    };
    ConsolidationOutput {
        memory_md: redact_secrets(output.memory_md),
        memory_summary: redact_secrets(output.memory_summary),
        skills: output
            .skills
            .into_iter()
            .map(|mut skill| {
                skill.content = skill.content.map(redact_secrets);
                skill.scripts = redact_files(skill.scripts);
                skill.templates = redact_files(skill.templates);
                skill.examples = redact_files(skill.examples);
                skill
            })
            .collect(),
    }
}

/// Watermark a successful run commits: the newest folded output, never below
/// the input watermark observed at claim time.
pub(crate) fn completion_watermark(
    claimed_watermark: i64,
    latest_memories: &[Stage1Output],
) -> i64 {
    latest_memories
        .iter()
        .map(|memory| memory.source_updated_at.timestamp())
        .max()
        .unwrap_or(claimed_watermark)
        .max(claimed_watermark)
}

mod job {
    use super::*;

    pub(super) async fn claim(ctx: &MemoryRunContext) -> Result<Claim, Phase2Outcome> {
        let claim = ctx
            .state_db
            .try_claim_global_phase2_job(
                &ctx.worker_id,
                ctx.config.phase2_lease_seconds,
                ctx.now(),
            )
            .await
            .map_err(|err| {
                error!("failed to claim global memory consolidation job: {err}");
                Phase2Outcome::ClaimFailed
            })?;
        match claim {
            Phase2JobClaimOutcome::Claimed {
                ownership_token,
                input_watermark,
            } => Ok(Claim {
                token: ownership_token,
                watermark: input_watermark,
            }),
            Phase2JobClaimOutcome::NotReady => {
                debug!("memory phase-2 skipped: nothing to consolidate or backing off");
                Err(Phase2Outcome::NotReady)
            }
            Phase2JobClaimOutcome::AlreadyClaimed => {
                debug!("memory phase-2 skipped: another worker holds the consolidation lease");
                Err(Phase2Outcome::AlreadyClaimed)
            }
        }
    }

    /// Records a failure with retry backoff. Falls back to the unowned
    /// variant when the strict, token-matched update finds nothing.
    pub(super) async fn failed(
        ctx: &MemoryRunContext,
        claim: &Claim,
        reason: &str,
    ) -> Phase2Outcome {
        let db: &StateRuntime = ctx.state_db.as_ref();
        let retry_delay = ctx.config.phase2_retry_delay_seconds;
        match db
            .mark_global_phase2_job_failed(&claim.token, retry_delay, reason, ctx.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                match db
                    .mark_global_phase2_job_failed_unowned(
                        &claim.token,
                        retry_delay,
                        reason,
                        ctx.now(),
                    )
                    .await
                {
                    Ok(true) => debug!("recorded memory phase-2 failure without ownership"),
                    Ok(false) => {
                        debug!("memory phase-2 failure not recorded: job owned by another worker")
                    }
                    Err(err) => warn!("failed to record unowned memory phase-2 failure: {err}"),
                }
            }
            Err(err) => warn!("failed to record memory phase-2 failure: {err}"),
        }
        Phase2Outcome::Failed {
            reason: reason.to_string(),
        }
    }

    /// Commits a successful run. A rejected commit means the lease was lost
    /// and goes through the failure path instead.
    pub(super) async fn succeed(
        ctx: &MemoryRunContext,
        claim: &Claim,
        completion_watermark: i64,
        outcome: Phase2Outcome,
    ) -> Phase2Outcome {
        match ctx
            .state_db
            .mark_global_phase2_job_succeeded(&claim.token, completion_watermark, ctx.now())
            .await
        {
            Ok(true) => outcome,
            Ok(false) => {
                warn!("memory phase-2 lost ownership before marking success");
                failed(ctx, claim, &MemoryError::OwnershipLost.to_string()).await
            }
            Err(err) => {
                error!("failed to mark memory phase-2 success: {err}");
                failed(ctx, claim, &MemoryError::State(err).to_string()).await
            }
        }
    }
}

/// Background lease renewal for a claimed phase-2 job.
struct Heartbeat {
    cancel: CancellationToken,
    ownership_lost: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(ctx: &MemoryRunContext, claim: &Claim) -> Self {
        let cancel = CancellationToken::new();
        let ownership_lost = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(heartbeat_loop(
            Arc::clone(&ctx.state_db),
            claim.token.clone(),
            ctx.config.phase2_lease_seconds,
            ctx.phase2_heartbeat_interval,
            cancel.clone(),
            Arc::clone(&ownership_lost),
        ));
        Self {
            cancel,
            ownership_lost,
            handle,
        }
    }

    /// Stops renewing and reports whether ownership was lost meanwhile. A
    /// heartbeat that died cannot vouch for the lease, so it counts as lost.
    async fn stop(self) -> bool {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!("memory phase-2 heartbeat task failed: {err}");
            return true;
        }
        self.ownership_lost.load(Ordering::SeqCst)
    }
}

async fn heartbeat_loop(
    db: Arc<StateRuntime>,
    token: String,
    lease_seconds: i64,
    period: Duration,
    cancel: CancellationToken,
    ownership_lost: Arc<AtomicBool>,
) {
    let mut heartbeat_interval = tokio::time::interval(period);
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; the claim itself set the lease.
    heartbeat_interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat_interval.tick() => {
                let now = chrono::Utc::now().timestamp();
                match db.heartbeat_global_phase2_job(&token, lease_seconds, now).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("lost global phase-2 ownership during heartbeat");
                        ownership_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                    Err(err) => {
                        warn!("phase-2 heartbeat update failed: {err}");
                        ownership_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }
}
