// tests/dispatch_loop.rs

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use batchdag::engine::{DispatchSettings, Iteration, Orchestrator};
use batchdag::errors::BatchdagError;
use batchdag::fs::{FileSystem, MockFileSystem};
use batchdag::model::{KillReason, ResourceUsage, TaskFailure};
use batchdag::adapter::DryAdapter;
use batchdag::query;
use batchdag::status::Status;
use batchdag::store::{ExecutionStore, MemoryStore};
use batchdag::types::FailurePolicy;
use batchdag_test_utils::{
    Harness, Outcome, StageBuilder, TaskBuilder, WorkflowBuilder, fast_settings, init_tracing,
    start_options, with_timeout,
};

type TestResult = Result<(), Box<dyn Error>>;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn abort_stage_failure_kills_downstream_without_submitting() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.exit("A2", 1);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("A")
                .task(TaskBuilder::new("A1", "true"))
                .task(TaskBuilder::new("A2", "false")),
        )
        .stage(
            StageBuilder::new("B")
                .after_stage("A")
                .task(TaskBuilder::new("B1", "true")),
        )
        .build();

    let started = h.orch.start(&wf, start_options("fail_fast")).await?;
    let status = with_timeout(h.orch.run(&started.handle)).await?;
    assert_eq!(status, Status::Failed);

    let state = started.handle.snapshot().await;
    assert_eq!(state.task_by_name("A1").unwrap().status, Status::Successful);
    let a2 = state.task_by_name("A2").unwrap();
    assert_eq!(a2.status, Status::Failed);
    assert_eq!(a2.exit_code, Some(1));
    assert_eq!(a2.failure, Some(TaskFailure::ExitCode { code: 1 }));

    let b1 = state.task_by_name("B1").unwrap();
    assert_eq!(b1.status, Status::Killed);
    assert_eq!(b1.kill_reason, Some(KillReason::ExecutionFailed));
    assert_eq!(h.adapter.submission_count("B1"), 0);

    let stored = h.orch.store().load_by_name("fail_fast")?.unwrap();
    assert_eq!(stored.execution.status, Status::Failed);
    assert!(stored.execution.finished_on.is_some());
    Ok(())
}

#[tokio::test]
async fn fail_fast_cancels_in_flight_siblings() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.exit("bad", 2).script("slow", Outcome::Hang, 0);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("only")
                .task(TaskBuilder::new("bad", "exit 2"))
                .task(TaskBuilder::new("slow", "sleep 100")),
        )
        .build();

    let started = h.orch.start(&wf, start_options("cancel_siblings")).await?;
    assert_eq!(with_timeout(h.orch.run(&started.handle)).await?, Status::Failed);

    let state = started.handle.snapshot().await;
    let slow = state.task_by_name("slow").unwrap();
    assert_eq!(slow.status, Status::Killed);
    assert_eq!(slow.kill_reason, Some(KillReason::ExecutionFailed));
    assert!(!slow.awaiting_report);
    assert!(slow.usage.is_some());
    assert_eq!(h.adapter.cancelled(), vec!["slow".to_string()]);
    Ok(())
}

#[tokio::test]
async fn declared_outputs_are_verified() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.script("liar", Outcome::SucceedWithoutOutputs, 0);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("build")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("honest", "make").output("a.out"))
                .task(TaskBuilder::new("liar", "make").output("b.out")),
        )
        .build();

    let started = h.orch.start(&wf, start_options("outputs")).await?;
    let status = with_timeout(h.orch.run(&started.handle)).await?;
    assert_eq!(status, Status::FailedButContinued);

    let state = started.handle.snapshot().await;
    assert_eq!(state.task_by_name("honest").unwrap().status, Status::Successful);
    assert!(h.fs.exists(&PathBuf::from("/out/outputs/build/honest/a.out")));

    let liar = state.task_by_name("liar").unwrap();
    assert_eq!(liar.status, Status::Failed);
    assert_eq!(liar.exit_code, Some(0));
    assert_eq!(
        liar.failure,
        Some(TaskFailure::MissingOutput {
            paths: vec![PathBuf::from("/out/outputs/build/liar/b.out")]
        })
    );
    let err = liar.failure.as_ref().unwrap().to_error(&liar.name);
    assert!(matches!(err, BatchdagError::MissingOutputError { .. }));
    Ok(())
}

#[tokio::test]
async fn continue_policy_reports_progress_then_failed_but_continued() -> TestResult {
    init_tracing();
    let settings = DispatchSettings {
        max_concurrent: 10,
        ..fast_settings()
    };
    let h = Harness::new(settings);
    h.adapter.exit("t6", 1).exit("t7", 1);
    h.adapter
        .script("t8", Outcome::Succeed, 3)
        .script("t9", Outcome::Succeed, 3);

    let mut stage = StageBuilder::new("many").policy(FailurePolicy::Continue);
    for i in 0..10 {
        stage = stage.task(TaskBuilder::new(&format!("t{i}"), "work"));
    }
    let wf = WorkflowBuilder::new().stage(stage).build();

    let started = h.orch.start(&wf, start_options("progress")).await?;
    let dispatcher = h.dispatcher();
    dispatcher.prepare(&started.handle).await?;
    assert!(matches!(
        dispatcher.step(&started.handle).await?,
        Iteration::Continue { .. }
    ));
    dispatcher.step(&started.handle).await?;

    let summary = query::summarize(&started.handle.snapshot().await);
    assert_eq!(summary.counts.successful, 6);
    assert_eq!(summary.counts.failed, 2);
    assert_eq!(summary.counts.running, 2);
    assert!(close(summary.percent.successful, 60.0));
    assert!(close(summary.percent.failed, 20.0));
    assert!(close(summary.percent.running, 20.0));
    assert_eq!(summary.stages[0].status, Status::Running);
    assert_eq!(summary.status, Status::Running);

    let status = with_timeout(h.orch.run(&started.handle)).await?;
    assert_eq!(status, Status::FailedButContinued);
    let summary = query::summarize(&started.handle.snapshot().await);
    assert!(close(summary.percent.successful, 80.0));
    assert_eq!(summary.stages[0].status, Status::FailedButContinued);
    Ok(())
}

#[tokio::test]
async fn continue_policy_skips_dependents_of_failed_tasks() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.exit("parent", 1);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("parent", "false"))
                .task(TaskBuilder::new("child", "true").after("parent"))
                .task(TaskBuilder::new("grandchild", "true").after("child"))
                .task(TaskBuilder::new("bystander", "true")),
        )
        .build();

    let started = h.orch.start(&wf, start_options("skip")).await?;
    assert_eq!(
        with_timeout(h.orch.run(&started.handle)).await?,
        Status::FailedButContinued
    );

    let state = started.handle.snapshot().await;
    for name in ["child", "grandchild"] {
        let task = state.task_by_name(name).unwrap();
        assert_eq!(task.status, Status::Killed, "{name}");
        assert_eq!(task.kill_reason, Some(KillReason::UpstreamFailed), "{name}");
        assert_eq!(h.adapter.submission_count(name), 0, "{name}");
    }
    assert_eq!(state.task_by_name("bystander").unwrap().status, Status::Successful);
    Ok(())
}

#[tokio::test]
async fn release_policy_lets_dependents_run() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.exit("flaky", 3);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("optional")
                .policy(FailurePolicy::Release)
                .task(TaskBuilder::new("flaky", "maybe")),
        )
        .stage(
            StageBuilder::new("report")
                .after_stage("optional")
                .task(TaskBuilder::new("summary", "report")),
        )
        .build();

    let started = h.orch.start(&wf, start_options("release")).await?;
    assert_eq!(
        with_timeout(h.orch.run(&started.handle)).await?,
        Status::FailedButContinued
    );
    let state = started.handle.snapshot().await;
    assert_eq!(state.task_by_name("summary").unwrap().status, Status::Successful);
    Ok(())
}

#[tokio::test]
async fn concurrency_ceiling_is_respected() -> TestResult {
    init_tracing();
    let settings = DispatchSettings {
        max_concurrent: 2,
        ..fast_settings()
    };
    let h = Harness::new(settings);

    let mut stage = StageBuilder::new("wide");
    for i in 0..6 {
        let name = format!("job{i}");
        h.adapter.script(&name, Outcome::Succeed, 2);
        stage = stage.task(TaskBuilder::new(&name, "work"));
    }
    let wf = WorkflowBuilder::new().stage(stage).build();

    let started = h.orch.start(&wf, start_options("ceiling")).await?;
    assert_eq!(with_timeout(h.orch.run(&started.handle)).await?, Status::Successful);
    assert_eq!(h.adapter.peak_in_flight(), 2);
    assert_eq!(h.adapter.submitted().len(), 6);
    // Priority is insertion order.
    assert_eq!(&h.adapter.submitted()[..2], &["job0".to_string(), "job1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn cpu_ceiling_runs_oversized_task_alone() -> TestResult {
    init_tracing();
    let settings = DispatchSettings {
        max_cpus: Some(4),
        ..fast_settings()
    };
    let h = Harness::new(settings);
    h.adapter
        .script("big", Outcome::Succeed, 2)
        .script("small1", Outcome::Succeed, 2)
        .script("small2", Outcome::Succeed, 2);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .task(TaskBuilder::new("big", "work").cpus(8))
                .task(TaskBuilder::new("small1", "work").cpus(2))
                .task(TaskBuilder::new("small2", "work").cpus(2)),
        )
        .build();

    let started = h.orch.start(&wf, start_options("cpus")).await?;
    assert_eq!(with_timeout(h.orch.run(&started.handle)).await?, Status::Successful);
    assert_eq!(h.adapter.submitted(), ["big", "small1", "small2"]);
    assert_eq!(h.adapter.peak_in_flight(), 2);
    Ok(())
}

#[tokio::test]
async fn transient_submit_errors_are_retried() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.fail_submissions("t", 3).fail_polls("t", 2);

    let wf = WorkflowBuilder::new()
        .stage(StageBuilder::new("s").task(TaskBuilder::new("t", "true")))
        .build();
    let started = h.orch.start(&wf, start_options("transient")).await?;
    assert_eq!(with_timeout(h.orch.run(&started.handle)).await?, Status::Successful);

    assert_eq!(h.adapter.submission_count("t"), 1);
    let state = started.handle.snapshot().await;
    assert_eq!(state.task_by_name("t").unwrap().adapter_errors, 0);
    Ok(())
}

#[tokio::test]
async fn submit_errors_past_the_bound_fail_the_task() -> TestResult {
    init_tracing();
    let settings = DispatchSettings {
        adapter_retry_limit: 1,
        ..fast_settings()
    };
    let h = Harness::new(settings);
    h.adapter.fail_submissions("t", 10);

    let wf = WorkflowBuilder::new()
        .stage(StageBuilder::new("s").task(TaskBuilder::new("t", "true")))
        .build();
    let started = h.orch.start(&wf, start_options("unavailable")).await?;
    assert_eq!(with_timeout(h.orch.run(&started.handle)).await?, Status::Failed);

    let state = started.handle.snapshot().await;
    let t = state.task_by_name("t").unwrap();
    assert_eq!(t.status, Status::Failed);
    assert!(matches!(t.failure, Some(TaskFailure::AdapterUnavailable { .. })));
    assert_eq!(h.adapter.submission_count("t"), 0);
    Ok(())
}

#[tokio::test]
async fn poll_errors_past_the_bound_fail_the_task() -> TestResult {
    init_tracing();
    let settings = DispatchSettings {
        adapter_retry_limit: 2,
        ..fast_settings()
    };
    let h = Harness::new(settings);
    h.adapter.fail_polls("t", 10);

    let wf = WorkflowBuilder::new()
        .stage(StageBuilder::new("s").task(TaskBuilder::new("t", "true")))
        .build();
    let started = h.orch.start(&wf, start_options("poll_down")).await?;
    assert_eq!(with_timeout(h.orch.run(&started.handle)).await?, Status::Failed);

    let state = started.handle.snapshot().await;
    let t = state.task_by_name("t").unwrap();
    assert!(matches!(t.failure, Some(TaskFailure::AdapterUnavailable { .. })));
    assert_eq!(t.adapter_errors, 3);
    Ok(())
}

#[tokio::test]
async fn backend_outcomes_map_to_task_states() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter
        .script("crashed", Outcome::Abnormal, 0)
        .script("vanished", Outcome::Lost, 0)
        .script("preempted", Outcome::KilledByBackend, 1);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("crashed", "x"))
                .task(TaskBuilder::new("vanished", "x"))
                .task(TaskBuilder::new("preempted", "x")),
        )
        .build();
    let started = h.orch.start(&wf, start_options("outcomes")).await?;
    assert_eq!(
        with_timeout(h.orch.run(&started.handle)).await?,
        Status::FailedButContinued
    );

    let state = started.handle.snapshot().await;
    let crashed = state.task_by_name("crashed").unwrap();
    assert!(matches!(crashed.failure, Some(TaskFailure::Abnormal { .. })));
    assert_eq!(crashed.exit_code, None);
    assert!(crashed.started_at.is_some());

    let vanished = state.task_by_name("vanished").unwrap();
    assert_eq!(vanished.status, Status::Failed);
    assert!(matches!(vanished.failure, Some(TaskFailure::Abnormal { .. })));

    let preempted = state.task_by_name("preempted").unwrap();
    assert_eq!(preempted.status, Status::Killed);
    assert_eq!(preempted.kill_reason, Some(KillReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn usage_is_collected_and_merged_with_requests() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.usage(
        "measured",
        ResourceUsage {
            wall_time_secs: Some(12.5),
            peak_rss_kib: Some(4096),
            ..ResourceUsage::default()
        },
    );
    h.adapter.exit("broken", 1);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("measured", "x").cpus(2).memory_mb(512))
                .task(TaskBuilder::new("broken", "x")),
        )
        .build();
    let started = h.orch.start(&wf, start_options("usage")).await?;
    with_timeout(h.orch.run(&started.handle)).await?;

    let state = started.handle.snapshot().await;
    let usage = state.task_by_name("measured").unwrap().usage.unwrap();
    assert_eq!(usage.wall_time_secs, Some(12.5));
    assert_eq!(usage.peak_rss_kib, Some(4096));
    assert_eq!(usage.requested_cpus, Some(2));
    assert_eq!(usage.requested_memory_mb, Some(512));
    assert_eq!(usage.cpu_time_secs, None);

    // Failed tasks get a record too.
    assert!(state.task_by_name("broken").unwrap().usage.is_some());

    let stage = query::stage_summary(&state, "s")?;
    assert_eq!(stage.usage.tasks_with_usage, 2);
    assert_eq!(stage.usage.wall_time_secs.samples, 1);
    Ok(())
}

#[tokio::test]
async fn time_limit_kills_and_cancels_the_job() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    h.adapter.script("forever", Outcome::Hang, 0);

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .policy(FailurePolicy::Continue)
                .task(TaskBuilder::new("forever", "sleep 1000").time_limit_secs(1)),
        )
        .build();
    let started = h.orch.start(&wf, start_options("timeout")).await?;
    let status = with_timeout(h.orch.run(&started.handle)).await?;
    assert_eq!(status, Status::Killed);

    let state = started.handle.snapshot().await;
    let task = state.task_by_name("forever").unwrap();
    assert_eq!(task.kill_reason, Some(KillReason::Timeout));
    assert_eq!(h.adapter.cancelled(), vec!["forever".to_string()]);
    assert!(!task.awaiting_report);
    assert!(task.usage.is_some());
    Ok(())
}

#[tokio::test]
async fn stepping_without_prepare_reports_a_stall() -> TestResult {
    init_tracing();
    let h = Harness::new(fast_settings());
    let wf = WorkflowBuilder::new()
        .stage(StageBuilder::new("s").task(TaskBuilder::new("t", "true")))
        .build();
    let started = h.orch.start(&wf, start_options("stall")).await?;

    match h.dispatcher().step(&started.handle).await {
        Err(BatchdagError::StalledExecutionError { execution, tasks }) => {
            assert_eq!(execution, "stall");
            assert_eq!(tasks, vec!["t".to_string()]);
        }
        other => panic!("expected StalledExecutionError, got {other:?}"),
    }

    let state = started.handle.snapshot().await;
    assert_eq!(state.execution.status, Status::Failed);
    assert_eq!(
        state.execution.info.get("stalled_tasks"),
        Some(&serde_json::json!(["t"]))
    );
    Ok(())
}

#[tokio::test]
async fn dry_backend_skips_output_checks() -> TestResult {
    init_tracing();
    let fs = MockFileSystem::new();
    let dry = DryAdapter::new();
    let orch = Orchestrator::new(
        Arc::new(dry.clone()),
        Arc::new(MemoryStore::new()),
        Arc::new(fs.clone()),
        fast_settings(),
    );
    let wf = WorkflowBuilder::new()
        .stage(StageBuilder::new("s").task(TaskBuilder::new("t", "make").output("never.txt")))
        .build();

    let started = orch.start(&wf, start_options("dry")).await?;
    assert_eq!(with_timeout(orch.run(&started.handle)).await?, Status::Successful);
    assert!(fs.paths().is_empty());
    assert_eq!(dry.tracked_jobs()?, 0);
    Ok(())
}

#[tokio::test]
async fn jobs_stuck_in_the_queue_fail_after_the_heartbeat_bound() -> TestResult {
    init_tracing();
    let settings = DispatchSettings {
        heartbeat_timeout: Some(std::time::Duration::from_millis(50)),
        ..fast_settings()
    };
    let h = Harness::new(settings);
    h.adapter.script("stuck", Outcome::Queued, 0);

    let wf = WorkflowBuilder::new()
        .stage(StageBuilder::new("s").task(TaskBuilder::new("stuck", "true")))
        .build();
    let started = h.orch.start(&wf, start_options("queued")).await?;
    assert_eq!(with_timeout(h.orch.run(&started.handle)).await?, Status::Failed);

    let state = started.handle.snapshot().await;
    let task = state.task_by_name("stuck").unwrap();
    assert_eq!(task.status, Status::Failed);
    assert!(task.started_at.is_none());
    assert!(matches!(task.failure, Some(TaskFailure::HeartbeatTimeout { .. })));
    assert_eq!(h.adapter.cancelled(), vec!["stuck".to_string()]);
    Ok(())
}

#[tokio::test]
async fn memory_ceiling_holds_later_tasks_behind_one_that_does_not_fit() -> TestResult {
    init_tracing();
    let settings = DispatchSettings {
        max_memory_mb: Some(1000),
        ..fast_settings()
    };
    let h = Harness::new(settings);
    for name in ["m1", "m2", "m3"] {
        h.adapter.script(name, Outcome::Succeed, 2);
    }

    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("s")
                .task(TaskBuilder::new("m1", "big").memory_mb(600))
                .task(TaskBuilder::new("m2", "big").memory_mb(600))
                .task(TaskBuilder::new("m3", "small").memory_mb(300)),
        )
        .build();
    let started = h.orch.start(&wf, start_options("memory")).await?;
    let dispatcher = h.dispatcher();
    dispatcher.prepare(&started.handle).await?;
    dispatcher.step(&started.handle).await?;
    // m2 would exceed 1000 MB next to m1, and m3 waits behind it.
    assert_eq!(h.adapter.submitted(), ["m1"]);

    assert_eq!(with_timeout(dispatcher.run(&started.handle)).await?, Status::Successful);
    assert_eq!(h.adapter.submitted(), ["m1", "m2", "m3"]);
    assert_eq!(h.adapter.peak_in_flight(), 2);
    Ok(())
}
