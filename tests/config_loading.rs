// tests/config_loading.rs

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;

use batchdag::config::{apply_workflow, load_and_validate, parse_str, WorkflowFile};
use batchdag::errors::BatchdagError;
use batchdag::model::{Execution, ExecutionState};
use batchdag::status::Status;
use batchdag::types::{AdapterKind, FailurePolicy};

type TestResult = Result<(), Box<dyn Error>>;

fn write_workflow(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

fn expect_config_error(contents: &str, needle: &str) {
    let file = write_workflow(contents);
    match load_and_validate(file.path()) {
        Err(BatchdagError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}");
        }
        Err(e) => panic!("expected ConfigError, got {e:?}"),
        Ok(_) => panic!("expected error, got Ok"),
    }
}

const PIPELINE: &str = r#"
[config]
adapter = "dry"
max_concurrent = 3
max_cpus = 8

[[stage]]
name = "align"
tags = { reference = "hg38" }

[[stage.task]]
name = "align_1"
cmd = "bwa mem r1.fq > align_1.sam"
outputs = ["align_1.sam"]
cpus = 4

[[stage.task]]
name = "align_2"
cmd = "bwa mem r2.fq > align_2.sam"
outputs = ["align_2.sam"]
cpus = 4
memory_mb = 2048

[[stage]]
name = "merge"
failure_policy = "continue"
after_stages = ["align"]

[[stage.task]]
name = "merge"
cmd = "samtools merge out.bam ../../align/*/*.sam"
time_limit_secs = 600
"#;

#[test]
fn pipeline_loads_with_settings_and_order() -> TestResult {
    let file = write_workflow(PIPELINE);
    let wf = load_and_validate(file.path())?;

    assert_eq!(wf.config.adapter, AdapterKind::Dry);
    assert_eq!(wf.config.max_concurrent, 3);
    assert_eq!(wf.config.max_cpus, Some(8));
    assert_eq!(wf.config.poll_interval_ms, 500);
    assert_eq!(wf.config.store_dir, PathBuf::from(".batchdag"));
    assert_eq!(wf.task_count(), 3);

    let names: Vec<&str> = wf.stage.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["align", "merge"]);
    assert_eq!(wf.stage[0].failure_policy, FailurePolicy::Abort);
    assert_eq!(wf.stage[1].failure_policy, FailurePolicy::Continue);
    assert_eq!(wf.stage[0].tags.get("reference").map(String::as_str), Some("hg38"));
    Ok(())
}

#[test]
fn rendering_creates_entities_and_stage_edges() -> TestResult {
    let file = write_workflow(PIPELINE);
    let wf = load_and_validate(file.path())?;
    let mut state = ExecutionState::new(Execution::new(1, "render", PathBuf::from("/data/run"))?);

    let summary = apply_workflow(&mut state, &wf)?;
    assert_eq!(summary.added_stages, 2);
    assert_eq!(summary.added_tasks, 3);

    let merge = state.task_by_name("merge").unwrap();
    let parents: Vec<&str> = merge
        .parents
        .iter()
        .map(|p| state.task(*p).unwrap().name.as_str())
        .collect();
    assert_eq!(parents, ["align_1", "align_2"]);
    assert_eq!(merge.requirements.time_limit_secs, Some(600));
    assert_eq!(merge.output_dir, PathBuf::from("/data/run/merge/merge"));
    assert_eq!(merge.log_dir, PathBuf::from("/data/run/log/merge/merge"));

    let align_1 = state.task_by_name("align_1").unwrap();
    assert_eq!(
        align_1.outputs,
        vec![PathBuf::from("/data/run/align/align_1/align_1.sam")]
    );
    assert_eq!(align_1.stdout_path(), PathBuf::from("/data/run/log/align/align_1/stdout.txt"));

    let numbers: Vec<u32> = state.stages().iter().map(|s| s.number).collect();
    assert_eq!(numbers, [1, 2]);
    assert_eq!(state.folded_status(), Status::NoAttempt);
    Ok(())
}

#[test]
fn rendering_twice_adds_nothing() -> TestResult {
    let wf = WorkflowFile::try_from(parse_str(PIPELINE)?)?;
    let mut state = ExecutionState::new(Execution::new(1, "again", PathBuf::from("/o"))?);
    apply_workflow(&mut state, &wf)?;

    let summary = apply_workflow(&mut state, &wf)?;
    assert_eq!(summary.added_stages, 0);
    assert_eq!(summary.added_tasks, 0);
    assert_eq!(summary.refreshed_tasks, 0);
    assert_eq!(state.task_by_name("merge").unwrap().parents.len(), 2);
    Ok(())
}

#[test]
fn rendering_again_refreshes_outputs_and_tags_of_unfinished_tasks() -> TestResult {
    let wf = WorkflowFile::try_from(parse_str(PIPELINE)?)?;
    let mut state = ExecutionState::new(Execution::new(1, "edited", PathBuf::from("/o"))?);
    apply_workflow(&mut state, &wf)?;

    let edited = PIPELINE.replace(
        "outputs = [\"align_2.sam\"]",
        "outputs = [\"align_2.bam\"]\ntags = { lane = \"2\" }",
    );
    let wf = WorkflowFile::try_from(parse_str(&edited)?)?;
    let summary = apply_workflow(&mut state, &wf)?;
    assert_eq!(summary.refreshed_tasks, 1);

    let align_2 = state.task_by_name("align_2").unwrap();
    assert_eq!(align_2.outputs, vec![PathBuf::from("/o/align/align_2/align_2.bam")]);
    assert_eq!(align_2.tags.get("lane").map(String::as_str), Some("2"));
    assert_eq!(
        state.task_by_name("align_1").unwrap().outputs,
        vec![PathBuf::from("/o/align/align_1/align_1.sam")]
    );
    Ok(())
}

#[test]
fn task_cycle_is_a_structured_error() {
    let file = write_workflow(
        r#"
[[stage]]
name = "s"

[[stage.task]]
name = "A"
cmd = "echo A"
after = ["B"]

[[stage.task]]
name = "B"
cmd = "echo B"
after = ["A"]
"#,
    );
    match load_and_validate(file.path()) {
        Err(BatchdagError::CycleError { parent, child }) => {
            let pair = [parent.as_str(), child.as_str()];
            assert!(pair.contains(&"A") && pair.contains(&"B"), "{pair:?}");
        }
        other => panic!("expected CycleError, got {other:?}"),
    }
}

#[test]
fn stage_level_cycle_is_detected() {
    let file = write_workflow(
        r#"
[[stage]]
name = "a"
after_stages = ["b"]
[[stage.task]]
name = "a1"
cmd = "true"

[[stage]]
name = "b"
after_stages = ["a"]
[[stage.task]]
name = "b1"
cmd = "true"
"#,
    );
    assert!(matches!(
        load_and_validate(file.path()),
        Err(BatchdagError::CycleError { .. })
    ));
}

#[test]
fn unknown_task_dependency() {
    expect_config_error(
        r#"
[[stage]]
name = "s"
[[stage.task]]
name = "A"
cmd = "true"
after = ["ghost"]
"#,
        "unknown dependency 'ghost'",
    );
}

#[test]
fn unknown_stage_dependency() {
    expect_config_error(
        r#"
[[stage]]
name = "s"
after_stages = ["nowhere"]
[[stage.task]]
name = "A"
cmd = "true"
"#,
        "unknown stage 'nowhere'",
    );
}

#[test]
fn duplicate_task_names_across_stages() {
    expect_config_error(
        r#"
[[stage]]
name = "one"
[[stage.task]]
name = "A"
cmd = "true"

[[stage]]
name = "two"
[[stage.task]]
name = "A"
cmd = "true"
"#,
        "duplicate task name 'A'",
    );
}

#[test]
fn reserved_and_unsafe_names() {
    expect_config_error(
        r#"
[[stage]]
name = "log"
[[stage.task]]
name = "A"
cmd = "true"
"#,
        "reserved",
    );
    expect_config_error(
        r#"
[[stage]]
name = "s"
[[stage.task]]
name = "../escape"
cmd = "true"
"#,
        "invalid task name",
    );
}

#[test]
fn settings_are_range_checked() {
    expect_config_error(
        r#"
[config]
max_concurrent = 0
[[stage]]
name = "s"
[[stage.task]]
name = "A"
cmd = "true"
"#,
        "max_concurrent",
    );
}

#[test]
fn empty_workflow_is_rejected() {
    expect_config_error("[config]\nadapter = \"local\"\n", "at least one");
}

#[test]
fn bad_enum_values_fail_deserialization() {
    let file = write_workflow(
        r#"
[[stage]]
name = "s"
failure_policy = "sometimes"
[[stage.task]]
name = "A"
cmd = "true"
"#,
    );
    assert!(matches!(
        load_and_validate(file.path()),
        Err(BatchdagError::TomlError(_))
    ));
}

#[test]
fn missing_file_is_an_io_error() {
    assert!(matches!(
        load_and_validate("/definitely/not/here/Workflow.toml"),
        Err(BatchdagError::IoError(_))
    ));
}
