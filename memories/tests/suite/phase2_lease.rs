use crate::suite::harness::CONSOLIDATE_MODEL;
use crate::suite::harness::ScriptedModel;
use crate::suite::harness::TestEnv;
use crate::suite::harness::consolidation_json;
use crate::suite::harness::rollout_about;
use crate::suite::harness::stage_one_json;
use crate::suite::harness::text_response;
use anyhow::Result;
use mnemo_memories::Phase2Outcome;
use mnemo_memories::phase1;
use mnemo_memories::phase2;
use mnemo_state::Phase2JobStatus;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_detects_a_stolen_lease() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = Arc::new(
        ScriptedModel::new(
            |_| Ok(text_response(stage_one_json("memo", "summary", None))),
            |_| {
                Ok(text_response(consolidation_json(
                    "# stale",
                    "stale",
                    json!([]),
                )))
            },
        )
        .with_lease_thief(Arc::clone(&env.state_db)),
    );
    let ctx = env
        .context(Arc::clone(&model))
        .with_phase2_heartbeat_interval(Duration::from_millis(20));

    assert_eq!(phase1::run(&ctx).await.succeeded_with_output, 1);
    let outcome = phase2::run(&ctx).await;

    assert_eq!(
        outcome,
        Phase2Outcome::Failed {
            reason: "lease ownership lost before completion".to_string(),
        }
    );
    assert_eq!(model.requests_for(CONSOLIDATE_MODEL).len(), 1);
    assert_eq!(env.state_db.get_memory_watermark().await?, 0);
    assert!(!env.memory_root.join("MEMORY.md").exists());

    // The thief's claim is untouched by the loser's failure report.
    let job = env.state_db.get_global_phase2_job().await?;
    assert_eq!(job.status, Phase2JobStatus::Claimed);
    assert_eq!(job.worker_id.as_deref(), Some("thief"));
    assert_eq!(job.last_error, None);
    Ok(())
}

#[tokio::test]
async fn fresh_lease_blocks_a_second_worker() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| Ok(text_response(stage_one_json("memo", "summary", None))),
        |_| anyhow::bail!("consolidation must not run"),
    ));
    let ctx = env.context(Arc::clone(&model));
    assert_eq!(phase1::run(&ctx).await.succeeded_with_output, 1);

    let now = chrono::Utc::now().timestamp();
    env.state_db
        .try_claim_global_phase2_job("other-worker", 600, now)
        .await?;

    assert_eq!(phase2::run(&ctx).await, Phase2Outcome::AlreadyClaimed);
    assert_eq!(model.requests_for(CONSOLIDATE_MODEL).len(), 0);
    Ok(())
}

#[tokio::test]
async fn expired_lease_is_taken_over() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| Ok(text_response(stage_one_json("memo", "summary", None))),
        |_| {
            Ok(text_response(consolidation_json(
                "# memory",
                "summary",
                json!([]),
            )))
        },
    ));
    let ctx = env.context(Arc::clone(&model));
    assert_eq!(phase1::run(&ctx).await.succeeded_with_output, 1);

    // A crashed worker claimed long ago and never came back.
    let long_ago = chrono::Utc::now().timestamp() - 3_600;
    env.state_db
        .try_claim_global_phase2_job("crashed-worker", 60, long_ago)
        .await?;

    let outcome = phase2::run(&ctx).await;

    assert!(
        matches!(outcome, Phase2Outcome::Succeeded { inputs: 1, .. }),
        "{outcome:?}"
    );
    let job = env.state_db.get_global_phase2_job().await?;
    assert_eq!(job.status, Phase2JobStatus::Idle);
    Ok(())
}

#[tokio::test]
async fn zero_heartbeat_interval_still_consolidates() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| Ok(text_response(stage_one_json("memo", "summary", None))),
        |_| {
            Ok(text_response(consolidation_json(
                "# memory",
                "summary",
                json!([]),
            )))
        },
    ));
    let ctx = env
        .context(Arc::clone(&model))
        .with_phase2_heartbeat_interval(Duration::ZERO);
    assert!(ctx.phase2_heartbeat_interval > Duration::ZERO);

    assert_eq!(phase1::run(&ctx).await.succeeded_with_output, 1);
    let outcome = phase2::run(&ctx).await;

    assert!(
        matches!(outcome, Phase2Outcome::Succeeded { inputs: 1, .. }),
        "{outcome:?}"
    );
    assert!(env.memory_root.join("MEMORY.md").is_file());
    Ok(())
}
