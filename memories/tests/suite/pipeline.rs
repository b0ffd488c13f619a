use crate::suite::harness::CONSOLIDATE_MODEL;
use crate::suite::harness::EXTRACT_MODEL;
use crate::suite::harness::FAKE_SECRET;
use crate::suite::harness::ScriptedModel;
use crate::suite::harness::TestEnv;
use crate::suite::harness::consolidation_json;
use crate::suite::harness::rollout_about;
use crate::suite::harness::stage_one_json;
use crate::suite::harness::text_response;
use anyhow::Result;
use mnemo_memories::ModelResponse;
use mnemo_memories::Phase1Summary;
use mnemo_memories::Phase2Outcome;
use mnemo_memories::StopReason;
use mnemo_memories::TokenUsage;
use mnemo_memories::phase1;
use mnemo_memories::phase2;
use mnemo_memories::run_memories_startup_pipeline;
use mnemo_state::Stage1JobStatus;
use mnemo_state::ThreadId;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

fn standard_consolidation() -> String {
    consolidation_json(
        "# Project memory\n\n- deploys go through `make release`",
        "Deploys use make release.",
        json!([{
            "name": "Release Flow",
            "content": "# Release flow\n\nRun the release script.",
            "scripts": [{"path": "scripts/release.sh", "content": "make release"}],
        }]),
    )
}

#[tokio::test]
async fn startup_pipeline_extracts_and_consolidates() -> Result<()> {
    let env = TestEnv::new().await?;
    let older = env.add_thread("thread-a", 48, &rollout_about("deploy the api")).await?;
    let newer = env.add_thread("thread-b", 24, &rollout_about("fix the tests")).await?;

    let model = Arc::new(ScriptedModel::new(
        |request| {
            let topic = if request.user_prompt.contains("deploy the api") {
                "deploy"
            } else {
                "tests"
            };
            Ok(text_response(stage_one_json(
                &format!("learned about {topic}; key {FAKE_SECRET}"),
                &format!("session about {topic}"),
                Some(&format!("{topic} notes")),
            )))
        },
        |_| Ok(text_response(standard_consolidation())),
    ));
    let ctx = env.context(Arc::clone(&model));

    let report = run_memories_startup_pipeline(&ctx).await;

    assert_eq!(
        report.phase1,
        Phase1Summary {
            claimed: 2,
            succeeded_with_output: 2,
            succeeded_no_output: 0,
            failed: 0,
            ownership_lost: 0,
            token_usage: TokenUsage {
                input_tokens: 200,
                output_tokens: 40,
                total_tokens: 240,
            },
        }
    );
    assert_eq!(
        report.phase2,
        Phase2Outcome::Succeeded {
            watermark: newer.updated_at.timestamp(),
            inputs: 2,
            token_usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 20,
                total_tokens: 120,
            },
        }
    );

    // Stage-1 prompts carry the filtered rollout only.
    let extract_requests = model.requests_for(EXTRACT_MODEL);
    assert_eq!(extract_requests.len(), 2);
    for request in &extract_requests {
        assert!(request.user_prompt.contains("ran "), "{}", request.user_prompt);
        assert!(!request.user_prompt.contains("SEARCH_NOISE"));
        assert!(request.output_schema.is_some());
    }

    let root = &env.memory_root;
    let raw_memories = tokio::fs::read_to_string(root.join("raw_memories.md")).await?;
    assert!(raw_memories.starts_with("# Raw Memories\n\n"));
    assert!(!raw_memories.contains(FAKE_SECRET));
    let newer_pos = raw_memories.find("## Thread `thread-b`").expect("newer thread");
    let older_pos = raw_memories.find("## Thread `thread-a`").expect("older thread");
    assert!(newer_pos < older_pos, "latest first: {raw_memories}");

    let consolidation_requests = model.requests_for(CONSOLIDATE_MODEL);
    assert_eq!(consolidation_requests.len(), 1);
    let prompt = &consolidation_requests[0].user_prompt;
    assert!(prompt.contains("learned about deploy"));
    assert!(prompt.contains("thread-a-deploy-notes.md"));
    assert!(prompt.contains("thread-b-tests-notes.md"));

    let mut summary_files = Vec::new();
    let mut dir = tokio::fs::read_dir(root.join("rollout_summaries")).await?;
    while let Some(entry) = dir.next_entry().await? {
        summary_files.push(entry.file_name().to_string_lossy().to_string());
    }
    summary_files.sort();
    assert_eq!(
        summary_files,
        vec![
            "thread-a-deploy-notes.md".to_string(),
            "thread-b-tests-notes.md".to_string(),
        ]
    );
    let summary_a =
        tokio::fs::read_to_string(root.join("rollout_summaries/thread-a-deploy-notes.md")).await?;
    assert!(summary_a.starts_with(&format!(
        "thread_id: thread-a\nupdated_at: {}\n",
        older.updated_at.to_rfc3339()
    )));

    assert_eq!(
        tokio::fs::read_to_string(root.join("MEMORY.md")).await?,
        "# Project memory\n\n- deploys go through `make release`\n"
    );
    assert_eq!(
        tokio::fs::read_to_string(root.join("memory_summary.md")).await?,
        "Deploys use make release.\n"
    );
    assert_eq!(
        tokio::fs::read_to_string(root.join("skills/release-flow/scripts/release.sh")).await?,
        "make release"
    );
    assert!(root.join("skills/release-flow/SKILL.md").is_file());

    assert_eq!(
        env.state_db.get_memory_watermark().await?,
        newer.updated_at.timestamp()
    );

    // A second startup finds nothing new.
    let rerun = run_memories_startup_pipeline(&ctx).await;
    assert_eq!(rerun.phase1, Phase1Summary::default());
    assert_eq!(rerun.phase2, Phase2Outcome::NotReady);
    assert_eq!(model.requests_for(EXTRACT_MODEL).len(), 2);
    assert_eq!(model.requests_for(CONSOLIDATE_MODEL).len(), 1);
    Ok(())
}

#[tokio::test]
async fn invalid_stage_one_output_fails_with_backoff() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| Ok(text_response(r#"{"raw_memory":"only half"}"#)),
        |_| anyhow::bail!("consolidation must not run"),
    ));
    let ctx = env.context(Arc::clone(&model));

    let report = run_memories_startup_pipeline(&ctx).await;

    assert_eq!(report.phase1.failed, 1);
    assert_eq!(report.phase2, Phase2Outcome::NotReady);
    let job = env
        .state_db
        .get_stage1_job(&ThreadId::from("thread-a"))
        .await?
        .expect("job row");
    assert_eq!(job.status, Stage1JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    let now = chrono::Utc::now().timestamp();
    assert!(job.retry_after.is_some_and(|retry_after| retry_after > now));
    assert_eq!(
        job.last_error.as_deref(),
        Some("invalid model output: output is missing required key `rollout_summary`")
    );

    // Backoff keeps the job out of the next pass.
    assert_eq!(phase1::run(&ctx).await, Phase1Summary::default());
    assert_eq!(model.requests_for(EXTRACT_MODEL).len(), 1);
    Ok(())
}

#[tokio::test]
async fn provider_error_is_recorded_on_the_job() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| {
            Ok(ModelResponse {
                stop_reason: StopReason::Error,
                error_message: Some("rate limited".to_string()),
                content: Vec::new(),
                usage: TokenUsage::default(),
            })
        },
        |_| anyhow::bail!("consolidation must not run"),
    ));
    let ctx = env.context(model);

    let summary = phase1::run(&ctx).await;

    assert_eq!(summary.failed, 1);
    let job = env
        .state_db
        .get_stage1_job(&ThreadId::from("thread-a"))
        .await?
        .expect("job row");
    assert_eq!(
        job.last_error.as_deref(),
        Some("model returned an error: rate limited")
    );
    Ok(())
}

#[tokio::test]
async fn missing_rollout_file_fails_the_job() -> Result<()> {
    let env = TestEnv::new().await?;
    let thread = env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    tokio::fs::remove_file(&thread.rollout_path).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| anyhow::bail!("extraction must not be sampled"),
        |_| anyhow::bail!("consolidation must not run"),
    ));
    let ctx = env.context(Arc::clone(&model));

    let summary = phase1::run(&ctx).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(model.requests_for(EXTRACT_MODEL).len(), 0);
    let job = env
        .state_db
        .get_stage1_job(&thread.id)
        .await?
        .expect("job row");
    assert!(
        job.last_error
            .as_deref()
            .is_some_and(|error| error.starts_with("failed to read rollout")),
        "{job:?}"
    );
    Ok(())
}

#[tokio::test]
async fn blank_extraction_counts_as_no_output() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("say hello")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| Ok(text_response(stage_one_json("", "", None))),
        |_| anyhow::bail!("consolidation must not run"),
    ));
    let ctx = env.context(Arc::clone(&model));

    let report = run_memories_startup_pipeline(&ctx).await;

    assert_eq!(report.phase1.succeeded_no_output, 1);
    assert_eq!(report.phase2, Phase2Outcome::NotReady);
    let status = env.state_db.memory_status().await?;
    assert_eq!(status.stage1_jobs.succeeded_no_output, 1);
    assert_eq!(status.stage1_outputs, 0);
    assert_eq!(model.requests_for(CONSOLIDATE_MODEL).len(), 0);
    Ok(())
}

#[tokio::test]
async fn losing_the_last_output_removes_consolidated_artifacts() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 48, &rollout_about("deploy")).await?;
    let extractions = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&extractions);
    let model = Arc::new(ScriptedModel::new(
        move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(text_response(stage_one_json("deploy memo", "deploy summary", None)))
            } else {
                Ok(text_response(stage_one_json(" ", " ", None)))
            }
        },
        |_| Ok(text_response(standard_consolidation())),
    ));
    let ctx = env.context(Arc::clone(&model));

    let first = run_memories_startup_pipeline(&ctx).await;
    assert!(matches!(first.phase2, Phase2Outcome::Succeeded { inputs: 1, .. }));
    assert!(env.memory_root.join("MEMORY.md").is_file());
    let first_watermark = env.state_db.get_memory_watermark().await?;

    // The session continued, and the re-extraction has nothing to keep.
    let refreshed = env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let second = run_memories_startup_pipeline(&ctx).await;

    assert_eq!(second.phase1.succeeded_no_output, 1);
    assert_eq!(
        second.phase2,
        Phase2Outcome::SucceededNoInput {
            watermark: refreshed.updated_at.timestamp(),
        }
    );
    assert!(refreshed.updated_at.timestamp() > first_watermark);
    let root = &env.memory_root;
    assert!(!root.join("MEMORY.md").exists());
    assert!(!root.join("memory_summary.md").exists());
    assert!(!root.join("skills").exists());
    assert_eq!(
        tokio::fs::read_to_string(root.join("raw_memories.md")).await?,
        "# Raw Memories\n\nNo raw memories yet.\n"
    );
    assert_eq!(model.requests_for(CONSOLIDATE_MODEL).len(), 1);
    Ok(())
}

#[tokio::test]
async fn current_session_is_never_extracted() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("live", 24, &rollout_about("work")).await?;
    env.add_thread("finished", 24, &rollout_about("ship")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| Ok(text_response(stage_one_json("memo", "summary", None))),
        |_| Ok(text_response(standard_consolidation())),
    ));
    let ctx = env
        .context(Arc::clone(&model))
        .with_exclude_thread_ids(vec![ThreadId::from("live")]);

    let summary = phase1::run(&ctx).await;

    assert_eq!(summary.claimed, 1);
    assert_eq!(
        env.state_db
            .get_stage1_job(&ThreadId::from("live"))
            .await?
            .map(|job| job.status),
        Some(Stage1JobStatus::Pending)
    );
    Ok(())
}

#[tokio::test]
async fn recently_active_threads_wait_for_idle_time() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("fresh", 1, &rollout_about("work")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| anyhow::bail!("fresh rollouts must not be sampled"),
        |_| anyhow::bail!("consolidation must not run"),
    ));
    let ctx = env.context(Arc::clone(&model));

    let report = run_memories_startup_pipeline(&ctx).await;

    assert_eq!(report.phase1, Phase1Summary::default());
    assert_eq!(report.phase2, Phase2Outcome::NotReady);
    Ok(())
}

#[tokio::test]
async fn failed_consolidation_backs_off_and_keeps_the_watermark() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = Arc::new(ScriptedModel::new(
        |_| Ok(text_response(stage_one_json("memo", "summary", None))),
        |_| Ok(text_response(r#"{"memory_md":"x","memory_summary":"y"}"#)),
    ));
    let ctx = env.context(Arc::clone(&model));

    let report = run_memories_startup_pipeline(&ctx).await;

    assert_eq!(
        report.phase2,
        Phase2Outcome::Failed {
            reason: "invalid model output: output is missing required key `skills`".to_string(),
        }
    );
    assert_eq!(env.state_db.get_memory_watermark().await?, 0);
    let job = env.state_db.get_global_phase2_job().await?;
    assert!(job.retry_after.is_some());
    assert!(!env.memory_root.join("MEMORY.md").exists());
    // Inputs were still materialized before the model call.
    assert!(env.memory_root.join("raw_memories.md").is_file());

    assert_eq!(phase2::run(&ctx).await, Phase2Outcome::NotReady);
    assert_eq!(model.requests_for(CONSOLIDATE_MODEL).len(), 1);
    Ok(())
}
