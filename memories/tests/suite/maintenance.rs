use crate::suite::harness::CONSOLIDATE_MODEL;
use crate::suite::harness::EXTRACT_MODEL;
use crate::suite::harness::ScriptedModel;
use crate::suite::harness::TestEnv;
use crate::suite::harness::consolidation_json;
use crate::suite::harness::rollout_about;
use crate::suite::harness::stage_one_json;
use crate::suite::harness::test_config;
use crate::suite::harness::text_response;
use anyhow::Result;
use mnemo_memories::MemoryModelClient;
use mnemo_memories::MemoryStartupParams;
use mnemo_memories::ModelInfo;
use mnemo_memories::Phase2Outcome;
use mnemo_memories::SessionSource;
use mnemo_memories::build_memory_tool_developer_instructions;
use mnemo_memories::clear_memory_data;
use mnemo_memories::enqueue_memory_consolidation;
use mnemo_memories::memory_home_for_cwd;
use mnemo_memories::memory_root;
use mnemo_memories::phase2;
use mnemo_memories::run_memories_startup_pipeline;
use mnemo_memories::start_memories_startup_task;
use mnemo_state::StateRuntime;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

fn numbered_consolidation_model() -> Arc<ScriptedModel> {
    let runs = Arc::new(AtomicUsize::new(0));
    Arc::new(ScriptedModel::new(
        |_| Ok(text_response(stage_one_json("memo", "summary", None))),
        move |_| {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(text_response(consolidation_json(
                &format!("# memory v{run}"),
                &format!("summary v{run}"),
                json!([]),
            )))
        },
    ))
}

#[tokio::test]
async fn forced_consolidation_reruns_without_new_input() -> Result<()> {
    let env = TestEnv::new().await?;
    let thread = env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = numbered_consolidation_model();
    let ctx = env.context(Arc::clone(&model));

    run_memories_startup_pipeline(&ctx).await;
    assert_eq!(phase2::run(&ctx).await, Phase2Outcome::NotReady);

    enqueue_memory_consolidation(&env.state_db).await?;
    let outcome = phase2::run(&ctx).await;

    assert!(
        matches!(
            outcome,
            Phase2Outcome::Succeeded { watermark, inputs: 1, .. }
                if watermark == thread.updated_at.timestamp()
        ),
        "{outcome:?}"
    );
    let requests = model.requests_for(CONSOLIDATE_MODEL);
    assert_eq!(requests.len(), 2);
    // The second run sees what the first one wrote.
    assert!(requests[1].user_prompt.contains("# memory v1"));
    assert_eq!(
        tokio::fs::read_to_string(env.memory_root.join("MEMORY.md")).await?,
        "# memory v2\n"
    );

    // The request was consumed.
    assert_eq!(phase2::run(&ctx).await, Phase2Outcome::NotReady);
    Ok(())
}

#[tokio::test]
async fn clearing_memories_allows_a_fresh_extraction() -> Result<()> {
    let env = TestEnv::new().await?;
    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = numbered_consolidation_model();
    let ctx = env.context(Arc::clone(&model));
    run_memories_startup_pipeline(&ctx).await;
    assert!(env.memory_root.join("MEMORY.md").is_file());

    clear_memory_data(&env.state_db, &env.memory_root).await?;

    assert!(!env.memory_root.exists());
    let status = env.state_db.memory_status().await?;
    assert_eq!(status.threads, 1);
    assert_eq!(status.stage1_outputs, 0);
    assert_eq!(status.watermark, 0);

    // Clearing twice is harmless.
    clear_memory_data(&env.state_db, &env.memory_root).await?;

    let report = run_memories_startup_pipeline(&ctx).await;
    assert_eq!(report.phase1.succeeded_with_output, 1);
    assert!(matches!(report.phase2, Phase2Outcome::Succeeded { .. }));
    assert_eq!(model.requests_for(EXTRACT_MODEL).len(), 2);
    Ok(())
}

#[tokio::test]
async fn developer_instructions_follow_the_latest_summary() -> Result<()> {
    let env = TestEnv::new().await?;
    let config = test_config();
    assert_eq!(
        build_memory_tool_developer_instructions(&env.memory_root, &config).await,
        None
    );

    env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let ctx = env.context(numbered_consolidation_model());
    run_memories_startup_pipeline(&ctx).await;

    let instructions = build_memory_tool_developer_instructions(&env.memory_root, &config)
        .await
        .expect("instructions after consolidation");
    assert!(instructions.contains("summary v1"));
    assert!(instructions.contains(&env.memory_root.display().to_string()));
    Ok(())
}

#[tokio::test]
async fn startup_task_runs_in_the_project_memory_home() -> Result<()> {
    let env = TestEnv::new().await?;
    let home = env.home.path().join("app-home");
    let cwd = env.home.path().to_path_buf();
    let thread = env.add_thread("thread-a", 24, &rollout_about("deploy")).await?;
    let model = numbered_consolidation_model();
    let model_client: Arc<dyn MemoryModelClient> = model;

    let handle = start_memories_startup_task(MemoryStartupParams {
        home: home.clone(),
        cwd: cwd.clone(),
        config: test_config(),
        ephemeral: false,
        source: SessionSource::Cli,
        task_depth: 0,
        current_thread_id: None,
        threads: vec![thread],
        model_client,
        phase_1_model: ModelInfo::new(EXTRACT_MODEL, Some(200_000)),
        phase_2_model: ModelInfo::new(CONSOLIDATE_MODEL, Some(200_000)),
    })
    .expect("eligible session");
    let report = handle.await?.expect("store available");

    assert_eq!(report.phase1.claimed, 1);
    assert_eq!(report.phase1.succeeded_with_output, 1);
    assert!(matches!(report.phase2, Phase2Outcome::Succeeded { .. }));

    let memory_home = memory_home_for_cwd(&home, &cwd);
    assert!(memory_home.starts_with(home.join("memories")));
    assert!(memory_root(&memory_home).join("MEMORY.md").is_file());
    let project_db = StateRuntime::init(memory_home).await?;
    assert_eq!(project_db.memory_status().await?.stage1_outputs, 1);
    Ok(())
}
