// tests/resume.rs

use std::error::Error;
use std::path::PathBuf;

use batchdag::dag::ready_set;
use batchdag::errors::BatchdagError;
use batchdag::fs::FileSystem;
use batchdag::status::Status;
use batchdag::store::ExecutionStore;
use batchdag::types::FailurePolicy;
use batchdag::config::WorkflowFile;
use batchdag_test_utils::{
    Harness, Outcome, StageBuilder, TaskBuilder, WorkflowBuilder, fast_settings, init_tracing,
    start_options, with_timeout,
};

type TestResult = Result<(), Box<dyn Error>>;

fn two_tasks() -> WorkflowFile {
    WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("good", "true"))
                .task(TaskBuilder::new("bad", "false")),
        )
        .build()
}

#[tokio::test]
async fn retry_resets_failed_tasks_and_reruns_only_them() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.exit("bad", 1);

    let wf = two_tasks();
    let started = h.orch.start(&wf, start_options("retry")).await?;
    assert_eq!(
        with_timeout(h.orch.run(&started.handle)).await?,
        Status::FailedButContinued
    );
    assert!(started.handle.snapshot().await.task_by_name("bad").unwrap().usage.is_some());

    // The fix landed; the next attempt succeeds.
    h.adapter.exit("bad", 0);
    let (handle, plan) = h.orch.resume("retry", None, true).await?;
    assert_eq!(plan.retried, vec!["bad".to_string()]);
    assert_eq!(plan.skipped_successful, vec!["good".to_string()]);
    assert!(plan.still_failed.is_empty());
    assert_eq!(plan.resubmitted(), 1);

    {
        let state = handle.lock().await;
        assert_eq!(state.execution.status, Status::Running);
        assert!(state.execution.info.contains_key("last_resumed"));
        let bad = state.task_by_name("bad").unwrap();
        assert_eq!(bad.status, Status::Waiting);
        assert!(bad.usage.is_none());
        assert!(bad.failure.is_none());
        assert!(bad.exit_code.is_none());
        assert!(bad.job_handle.is_none());
        assert_eq!(ready_set(&state), vec![bad.id]);
    }

    assert_eq!(with_timeout(h.orch.run(&handle)).await?, Status::Successful);
    assert_eq!(h.adapter.submission_count("good"), 1);
    assert_eq!(h.adapter.submission_count("bad"), 2);
    Ok(())
}

#[tokio::test]
async fn resume_without_retry_keeps_failures() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.exit("bad", 1);

    let started = h.orch.start(&two_tasks(), start_options("keep")).await?;
    with_timeout(h.orch.run(&started.handle)).await?;

    let (handle, plan) = h.orch.resume("keep", None, false).await?;
    assert_eq!(plan.still_failed, vec!["bad".to_string()]);
    assert_eq!(plan.resubmitted(), 0);

    assert_eq!(
        with_timeout(h.orch.run(&handle)).await?,
        Status::FailedButContinued
    );
    assert_eq!(h.adapter.submission_count("bad"), 1);
    assert_eq!(h.adapter.submission_count("good"), 1);
    Ok(())
}

#[tokio::test]
async fn in_flight_tasks_reattach_or_reset() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter
        .script("long", Outcome::Hang, 0)
        .script("quick", Outcome::Succeed, 1);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .task(TaskBuilder::new("long", "sleep 1000"))
                .task(TaskBuilder::new("quick", "true")),
        )
        .build();
    let started = h.orch.start(&wf, start_options("crash")).await?;
    let dispatcher = h.dispatcher();
    dispatcher.prepare(&started.handle).await?;
    dispatcher.step(&started.handle).await?;
    // The orchestrator process goes away here; only the store remains.
    drop(started);

    let (handle, plan) = h.orch.resume("crash", None, false).await?;
    assert_eq!(plan.reattached, vec!["long".to_string(), "quick".to_string()]);
    assert!(plan.reset.is_empty());
    {
        let state = handle.lock().await;
        assert_eq!(state.task_by_name("long").unwrap().status, Status::Running);
        // Still running at the time of the first poll.
        assert_eq!(state.task_by_name("quick").unwrap().status, Status::Running);
    }
    assert_eq!(h.adapter.submission_count("long"), 1);
    Ok(())
}

#[tokio::test]
async fn lost_jobs_are_reset_and_resubmitted() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.script("t", Outcome::Succeed, 5);

    let wf = WorkflowBuilder::new()
        .stage(StageBuilder::new("s").task(TaskBuilder::new("t", "true")))
        .build();
    let started = h.orch.start(&wf, start_options("lost")).await?;
    let dispatcher = h.dispatcher();
    dispatcher.prepare(&started.handle).await?;
    dispatcher.step(&started.handle).await?;

    h.adapter.forget_jobs();
    let (handle, plan) = h.orch.resume("lost", None, false).await?;
    assert_eq!(plan.reset, vec!["t".to_string()]);
    {
        let state = handle.lock().await;
        let t = state.task_by_name("t").unwrap();
        assert_eq!(t.status, Status::Waiting);
        assert!(t.job_handle.is_none());
        assert!(t.submitted_at.is_none());
    }

    assert_eq!(with_timeout(h.orch.run(&handle)).await?, Status::Successful);
    assert_eq!(h.adapter.submission_count("t"), 2);
    Ok(())
}

#[tokio::test]
async fn killed_executions_resume_their_killed_tasks() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.script("slow", Outcome::Hang, 0);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .task(TaskBuilder::new("done", "true"))
                .task(TaskBuilder::new("slow", "sleep 1000")),
        )
        .build();
    let started = h.orch.start(&wf, start_options("revive")).await?;
    let dispatcher = h.dispatcher();
    dispatcher.prepare(&started.handle).await?;
    dispatcher.step(&started.handle).await?;
    dispatcher.step(&started.handle).await?;
    h.orch.kill(&started.handle).await?;
    assert_eq!(started.handle.snapshot().await.execution.status, Status::Killed);

    h.adapter.script("slow", Outcome::Succeed, 0);
    let (handle, plan) = h.orch.resume("revive", None, false).await?;
    assert_eq!(plan.reset, vec!["slow".to_string()]);
    assert_eq!(plan.skipped_successful, vec!["done".to_string()]);

    assert_eq!(with_timeout(h.orch.run(&handle)).await?, Status::Successful);
    assert_eq!(h.adapter.submission_count("done"), 1);
    Ok(())
}

#[tokio::test]
async fn start_with_an_existing_name_resumes_and_extends() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.exit("bad", 1);

    let first = h.orch.start(&two_tasks(), start_options("grow")).await?;
    assert!(first.plan.is_none());
    with_timeout(h.orch.run(&first.handle)).await?;

    let extended = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("good", "true"))
                .task(TaskBuilder::new("bad", "false --fixed")),
        )
        .stage(
            StageBuilder::new("report")
                .after_stage("s")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("summary", "report")),
        )
        .build();

    let mut opts = start_options("grow");
    opts.retry_failed = true;
    opts.command_line = Some("batchdag run --name grow".to_string());
    h.adapter.exit("bad", 0);
    let second = h.orch.start(&extended, opts).await?;
    let plan = second.plan.clone().expect("existing execution is resumed");
    assert_eq!(plan.retried, vec!["bad".to_string()]);

    {
        let state = second.handle.lock().await;
        assert_eq!(state.stages().len(), 2);
        assert_eq!(state.task_by_name("bad").unwrap().command, "false --fixed");
        assert_eq!(state.task_by_name("summary").unwrap().parents.len(), 2);
        assert_eq!(
            state.execution.info.get("last_cmd_executed"),
            Some(&serde_json::json!("batchdag run --name grow"))
        );
    }

    assert_eq!(with_timeout(h.orch.run(&second.handle)).await?, Status::Successful);
    assert_eq!(h.adapter.submission_count("good"), 1);
    assert_eq!(h.adapter.submission_count("summary"), 1);
    Ok(())
}

#[tokio::test]
async fn resuming_into_another_output_dir_is_refused() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.orch.start(&two_tasks(), start_options("pinned")).await?;

    let mut opts = start_options("pinned");
    opts.output_dir = PathBuf::from("/elsewhere");
    let err = h.orch.start(&two_tasks(), opts).await.unwrap_err();
    assert!(matches!(err, BatchdagError::ConfigError(_)));
    Ok(())
}

#[tokio::test]
async fn restart_wipes_previous_execution() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    let started = h.orch.start(&two_tasks(), start_options("fresh")).await?;
    with_timeout(h.orch.run(&started.handle)).await?;
    h.fs.add_file("/out/fresh/s/good/leftover.txt", "old");

    let mut opts = start_options("fresh");
    opts.restart = true;
    let again = h.orch.start(&two_tasks(), opts).await?;
    assert!(again.plan.is_none());
    assert!(!h.fs.exists(&PathBuf::from("/out/fresh/s/good/leftover.txt")));

    let state = again.handle.snapshot().await;
    assert!(state.tasks().all(|t| t.status == Status::NoAttempt));
    Ok(())
}

#[tokio::test]
async fn deleted_executions_need_a_restart() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.orch.start(&two_tasks(), start_options("gone")).await?;
    h.store.soft_delete("gone")?;

    assert!(matches!(
        h.orch.open("gone"),
        Err(BatchdagError::ExecutionNotFound(_))
    ));
    assert!(h.orch.resume("gone", None, false).await.is_err());
    assert!(h.orch.start(&two_tasks(), start_options("gone")).await.is_err());

    let mut opts = start_options("gone");
    opts.restart = true;
    assert!(h.orch.start(&two_tasks(), opts).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn invalid_names_are_rejected_before_anything_is_stored() -> TestResult {
    let h = Harness::new(fast_settings());
    let err = h.orch.start(&two_tasks(), start_options("no-dashes")).await.unwrap_err();
    assert!(matches!(err, BatchdagError::ConfigError(_)));
    assert!(h.store.list()?.is_empty());
    Ok(())
}
