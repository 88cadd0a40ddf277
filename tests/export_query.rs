// tests/export_query.rs

use std::error::Error;

use batchdag::errors::BatchdagError;
use batchdag::export::{stage_graph, task_graph};
use batchdag::model::ExecutionState;
use batchdag::query::{
    self, DEFAULT_NEIGHBOUR_LIMIT, graph_by_type, stage_summary, task_children, task_detail,
    task_parents,
};
use batchdag::status::Status;
use batchdag::types::GraphKind;
use batchdag_test_utils::{StageBuilder, TaskBuilder, WorkflowBuilder, rendered_state};

type TestResult = Result<(), Box<dyn Error>>;

fn three_stages() -> ExecutionState {
    let wf = WorkflowBuilder::new()
        .stage(
            StageBuilder::new("fetch")
                .task(TaskBuilder::new("f1", "get 1"))
                .task(TaskBuilder::new("f2", "get 2")),
        )
        .stage(
            StageBuilder::new("merge")
                .after_stage("fetch")
                .task(TaskBuilder::new("m", "cat")),
        )
        .stage(
            StageBuilder::new("report")
                .task(TaskBuilder::new("r", "render").after("m")),
        )
        .build();
    rendered_state("graphs", &wf)
}

#[test]
fn stage_graph_collapses_task_edges() -> TestResult {
    let mut state = three_stages();
    let f1 = state.task_id("f1").unwrap();
    state.transition(f1, Status::Submitted)?;

    let payload = stage_graph(&state);
    assert_eq!(payload.kind, GraphKind::Recipe);
    assert_eq!(payload.execution, "graphs");
    let names: Vec<&str> = payload.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["fetch", "merge", "report"]);
    assert_eq!(payload.nodes[0].task_count, Some(2));
    assert_eq!(payload.nodes[2].status, Status::Waiting);

    // f1 -> m and f2 -> m are one stage edge.
    let edges: Vec<(&str, &str)> = payload
        .edges
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str()))
        .collect();
    assert_eq!(edges, [("stage-1", "stage-2"), ("stage-2", "stage-3")]);

    let dot = payload.to_dot();
    assert!(dot.starts_with("digraph \"graphs\" {"));
    assert!(dot.contains("\"stage-1\" -> \"stage-2\";"));
    assert!(dot.contains("label=\"fetch (2)\""));
    assert!(dot.trim_end().ends_with('}'));
    Ok(())
}

#[test]
fn task_graph_lists_direct_edges() -> TestResult {
    let mut state = three_stages();
    let f1 = state.task_id("f1").unwrap();
    state.transition(f1, Status::Submitted)?;
    state.transition(f1, Status::Running)?;
    state.transition(f1, Status::Successful)?;

    let payload = task_graph(&state);
    assert_eq!(payload.nodes.len(), 4);
    assert_eq!(payload.nodes[0].stage, "fetch");
    assert_eq!(payload.nodes[0].status, Status::Successful);
    assert_eq!(payload.nodes[0].task_count, None);
    let edges: Vec<(&str, &str)> = payload
        .edges
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str()))
        .collect();
    assert_eq!(
        edges,
        [("task-1", "task-3"), ("task-2", "task-3"), ("task-3", "task-4")]
    );

    let dot = payload.to_dot();
    assert!(dot.contains("\"task-1\" [label=\"f1\", fillcolor=palegreen"));

    let json = serde_json::to_value(&payload)?;
    assert_eq!(json["kind"], "task");
    assert!(json["nodes"][0].get("task_count").is_none());
    Ok(())
}

#[test]
fn graph_type_is_parsed_from_text() -> TestResult {
    let state = three_stages();
    assert_eq!(graph_by_type(&state, " Recipe ")?.kind, GraphKind::Recipe);
    assert_eq!(graph_by_type(&state, "task")?.edges.len(), 3);
    assert!(matches!(
        graph_by_type(&state, "bogus"),
        Err(BatchdagError::ConfigError(_))
    ));
    Ok(())
}

fn fan_out(width: usize) -> ExecutionState {
    let mut stage = StageBuilder::new("s").task(TaskBuilder::new("root", "split"));
    for i in 0..width {
        stage = stage.task(TaskBuilder::new(&format!("leaf_{i}"), "work").after("root"));
    }
    let wf = WorkflowBuilder::new().stage(stage).build();
    rendered_state("fan", &wf)
}

#[test]
fn neighbours_are_paged_in_insertion_order() -> TestResult {
    let state = fan_out(25);

    let children = task_children(&state, "root", DEFAULT_NEIGHBOUR_LIMIT)?;
    assert_eq!(children.total, 25);
    assert_eq!(children.items.len(), 20);
    assert!(children.is_truncated());
    assert_eq!(children.items[0], "leaf_0");
    assert_eq!(children.items[19], "leaf_19");

    let parents = task_parents(&state, "leaf_7", 5)?;
    assert_eq!(parents.items, ["root"]);
    assert!(!parents.is_truncated());

    assert!(matches!(
        task_parents(&state, "ghost", 5),
        Err(BatchdagError::TaskNotFound(_))
    ));
    Ok(())
}

#[test]
fn task_detail_carries_paths_and_neighbours() -> TestResult {
    let state = fan_out(3);
    let detail = task_detail(&state, "root", 2)?;
    assert_eq!(detail.stage, "s");
    assert_eq!(detail.status, Status::Waiting);
    assert_eq!(detail.command, "split");
    assert_eq!(detail.stdout, state.task_by_name("root").unwrap().stdout_path());
    assert_eq!(detail.children.items, ["leaf_0", "leaf_1"]);
    assert_eq!(detail.children.total, 3);
    assert_eq!(detail.parents.total, 0);
    assert!(detail.usage.is_none());
    Ok(())
}

#[test]
fn summaries_fold_counts_per_stage() -> TestResult {
    let mut state = three_stages();
    for name in ["f1", "f2"] {
        let id = state.task_id(name).unwrap();
        state.transition(id, Status::Submitted)?;
        state.transition(id, Status::Running)?;
        state.transition(id, Status::Successful)?;
    }

    let fetch = stage_summary(&state, "fetch")?;
    assert_eq!(fetch.number, 1);
    assert_eq!(fetch.status, Status::Successful);
    assert_eq!(fetch.counts.total, 2);
    assert_eq!(fetch.percent.successful, 100.0);
    assert_eq!(fetch.usage.tasks_with_usage, 0);

    let summary = query::summarize(&state);
    assert_eq!(summary.name, "graphs");
    assert_eq!(summary.counts.total, 4);
    assert_eq!(summary.counts.successful, 2);
    assert_eq!(summary.percent.successful, 50.0);
    assert_eq!(summary.stages.len(), 3);
    assert_eq!(summary.stages[1].status, Status::Waiting);

    assert!(matches!(
        stage_summary(&state, "nope"),
        Err(BatchdagError::StageNotFound(_))
    ));
    Ok(())
}
