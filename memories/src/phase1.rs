use crate::context::MemoryRunContext;
use crate::error::MemoryError;
use crate::model::ModelRequest;
use crate::model::TokenUsage;
use crate::model::response_text;
use crate::prompts::STAGE_ONE_SYSTEM_PROMPT;
use crate::prompts::build_stage_one_input_message;
use crate::rollout::load_rollout_items;
use crate::rollout::serialize_filtered_rollout_items;
use crate::schema::StageOneOutput;
use crate::schema::parse_stage_one_output;
use crate::schema::stage_one_output_schema;
use futures::StreamExt;
use mnemo_state::Stage1ClaimParams;
use mnemo_state::Stage1JobClaim;
use mnemo_utils_sanitizer::redact_secrets;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::warn;

const STAGE_ONE_MAX_OUTPUT_TOKENS: u32 = 8_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PhaseOneJobOutcome {
    SucceededWithOutput,
    SucceededNoOutput,
    Failed,
    /// Another worker took the claim; the local result was discarded.
    OwnershipLost,
}

/// Aggregate result of one phase-1 pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Phase1Summary {
    pub claimed: usize,
    pub succeeded_with_output: usize,
    pub succeeded_no_output: usize,
    pub failed: usize,
    pub ownership_lost: usize,
    pub token_usage: TokenUsage,
}

/// Runs memory phase 1 in strict step order:
/// 1) claim eligible rollout jobs
/// 2) run stage-1 extraction jobs in parallel
/// 3) log the aggregate outcome
pub async fn run(ctx: &MemoryRunContext) -> Phase1Summary {
    // 1. Claim startup jobs.
    let Some(claimed_candidates) = claim_startup_jobs(ctx).await else {
        return Phase1Summary::default();
    };
    if claimed_candidates.is_empty() {
        debug!("memory stage-1 extraction skipped: no eligible rollouts");
        return Phase1Summary::default();
    }

    // 2. Run the parallel sampling.
    let claimed = claimed_candidates.len();
    let outcomes = run_jobs(ctx, claimed_candidates).await;

    // 3. Logs.
    let summary = summarize(claimed, outcomes);
    info!(
        "memory stage-1 extraction complete: {} job(s) claimed, {} succeeded ({} with output, {} no output), {} failed, {} ownership lost, {} total tokens",
        summary.claimed,
        summary.succeeded_with_output + summary.succeeded_no_output,
        summary.succeeded_with_output,
        summary.succeeded_no_output,
        summary.failed,
        summary.ownership_lost,
        summary.token_usage.total_tokens
    );
    summary
}

async fn claim_startup_jobs(ctx: &MemoryRunContext) -> Option<Vec<Stage1JobClaim>> {
    let config = &ctx.config;
    match ctx
        .state_db
        .claim_stage1_jobs(Stage1ClaimParams {
            now: ctx.now(),
            scan_limit: config.thread_scan_limit,
            max_claims: config.max_rollouts_per_startup,
            max_age_days: config.max_rollout_age_days,
            min_idle_hours: config.min_rollout_idle_hours,
            lease_seconds: config.stage1_lease_seconds,
            running_cap: config.max_rollouts_per_startup,
            worker_id: &ctx.worker_id,
            exclude_thread_ids: &ctx.exclude_thread_ids,
        })
        .await
    {
        Ok(claims) => Some(claims),
        Err(err) => {
            warn!("state db claim_stage1_jobs failed during memories startup: {err}");
            None
        }
    }
}

async fn run_jobs(
    ctx: &MemoryRunContext,
    claimed_candidates: Vec<Stage1JobClaim>,
) -> Vec<(PhaseOneJobOutcome, TokenUsage)> {
    futures::stream::iter(claimed_candidates)
        .map(|claim| job::run(ctx, claim))
        .buffer_unordered(ctx.config.stage1_concurrency.max(1))
        .collect::<Vec<_>>()
        .await
}

fn summarize(claimed: usize, outcomes: Vec<(PhaseOneJobOutcome, TokenUsage)>) -> Phase1Summary {
    let mut summary = Phase1Summary {
        claimed,
        ..Phase1Summary::default()
    };
    for (outcome, usage) in outcomes {
        summary.token_usage.add_assign(&usage);
        match outcome {
            PhaseOneJobOutcome::SucceededWithOutput => summary.succeeded_with_output += 1,
            PhaseOneJobOutcome::SucceededNoOutput => summary.succeeded_no_output += 1,
            PhaseOneJobOutcome::Failed => summary.failed += 1,
            PhaseOneJobOutcome::OwnershipLost => summary.ownership_lost += 1,
        }
    }
    summary
}

mod job {
    use super::*;

    pub(super) async fn run(
        ctx: &MemoryRunContext,
        claim: Stage1JobClaim,
    ) -> (PhaseOneJobOutcome, TokenUsage) {
        // The job may not outlive its lease: past that point another worker
        // can legitimately take it over.
        let lease_seconds = ctx.config.stage1_lease_seconds;
        let deadline = Duration::from_secs(u64::try_from(lease_seconds).unwrap_or(0).max(1));
        let sampled = tokio::time::timeout(deadline, sample(ctx, &claim))
            .await
            .unwrap_or(Err(MemoryError::Deadline(lease_seconds)));

        let (stage_one_output, usage) = match sampled {
            Ok(sampled) => sampled,
            Err(reason) => {
                return (
                    result::failed(ctx, &claim, &reason.to_string()).await,
                    TokenUsage::default(),
                );
            }
        };

        let outcome = if stage_one_output.raw_memory.trim().is_empty()
            || stage_one_output.rollout_summary.trim().is_empty()
        {
            result::no_output(ctx, &claim).await
        } else {
            result::success(ctx, &claim, &stage_one_output).await
        };
        (outcome, usage)
    }

    /// Extract the rollout and perform the actual sampling.
    async fn sample(
        ctx: &MemoryRunContext,
        claim: &Stage1JobClaim,
    ) -> crate::error::Result<(StageOneOutput, TokenUsage)> {
        let thread = &claim.thread;
        let rollout = load_rollout_items(&thread.rollout_path).await?;
        let rollout_contents = serialize_filtered_rollout_items(&rollout.items)?;

        let request = ModelRequest {
            model: ctx.phase_1_model.slug.clone(),
            system_prompt: STAGE_ONE_SYSTEM_PROMPT.to_string(),
            user_prompt: build_stage_one_input_message(
                &ctx.phase_1_model,
                &ctx.config,
                &thread.rollout_path,
                &thread.cwd,
                &rollout_contents,
            ),
            max_output_tokens: Some(STAGE_ONE_MAX_OUTPUT_TOKENS),
            temperature: None,
            output_schema: Some(stage_one_output_schema()),
        };
        let response = ctx
            .model_client
            .complete(request)
            .await
            .map_err(MemoryError::ModelRequest)?;
        let text = response_text(&response)?;

        let mut output = parse_stage_one_output(&text)?;
        output.raw_memory = redact_secrets(output.raw_memory);
        output.rollout_summary = redact_secrets(output.rollout_summary);
        output.rollout_slug = output
            .rollout_slug
            .map(|slug| redact_secrets(slug.trim().to_string()))
            .filter(|slug| !slug.is_empty());

        Ok((output, response.usage))
    }

    mod result {
        use super::*;

        pub(in crate::phase1) async fn failed(
            ctx: &MemoryRunContext,
            claim: &Stage1JobClaim,
            reason: &str,
        ) -> PhaseOneJobOutcome {
            let thread_id = &claim.thread.id;
            warn!("memory stage-1 job failed for thread {thread_id}: {reason}");
            match ctx
                .state_db
                .mark_stage1_job_failed(
                    thread_id,
                    &claim.ownership_token,
                    ctx.config.stage1_retry_delay_seconds,
                    reason,
                    ctx.now(),
                )
                .await
            {
                Ok(true) => PhaseOneJobOutcome::Failed,
                Ok(false) => ownership_lost(claim),
                Err(err) => {
                    warn!("failed to record stage-1 failure for thread {thread_id}: {err}");
                    PhaseOneJobOutcome::Failed
                }
            }
        }

        pub(in crate::phase1) async fn no_output(
            ctx: &MemoryRunContext,
            claim: &Stage1JobClaim,
        ) -> PhaseOneJobOutcome {
            match ctx
                .state_db
                .mark_stage1_job_succeeded_no_output(
                    &claim.thread.id,
                    &claim.ownership_token,
                    ctx.now(),
                )
                .await
            {
                Ok(true) => PhaseOneJobOutcome::SucceededNoOutput,
                Ok(false) => ownership_lost(claim),
                Err(err) => {
                    warn!(
                        "failed to record stage-1 no-output result for thread {}: {err}",
                        claim.thread.id
                    );
                    PhaseOneJobOutcome::Failed
                }
            }
        }

        pub(in crate::phase1) async fn success(
            ctx: &MemoryRunContext,
            claim: &Stage1JobClaim,
            output: &StageOneOutput,
        ) -> PhaseOneJobOutcome {
            match ctx
                .state_db
                .mark_stage1_job_succeeded(
                    &claim.thread.id,
                    &claim.ownership_token,
                    claim.source_updated_at,
                    &output.raw_memory,
                    &output.rollout_summary,
                    output.rollout_slug.as_deref(),
                    ctx.now(),
                )
                .await
            {
                Ok(true) => PhaseOneJobOutcome::SucceededWithOutput,
                Ok(false) => ownership_lost(claim),
                Err(err) => {
                    warn!(
                        "failed to record stage-1 output for thread {}: {err}",
                        claim.thread.id
                    );
                    PhaseOneJobOutcome::Failed
                }
            }
        }

        fn ownership_lost(claim: &Stage1JobClaim) -> PhaseOneJobOutcome {
            warn!(
                "memory stage-1 job for thread {} lost ownership; discarding local result",
                claim.thread.id
            );
            PhaseOneJobOutcome::OwnershipLost
        }
    }
}
