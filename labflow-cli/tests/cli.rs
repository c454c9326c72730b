use assert_cmd::Command;
use std::path::Path;
use tempfile::TempDir;

fn write_pipeline(dir: &Path, content: &str) {
    std::fs::write(dir.join("pipeline.yaml"), content).unwrap();
}

fn labflow(workdir: &Path, args: &[&str]) -> std::process::Output {
    Command::cargo_bin("labflow")
        .expect("binary present")
        .current_dir(workdir)
        .args(args)
        .output()
        .expect("labflow invocation")
}

fn stdout_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

const SIMPLE: &str = r#"
name: simple
params:
  - name: label
    default: weights
stages:
  - name: finetune
    command: "printf %s {params.label} > {outputs.ckpt}"
    outputs:
      ckpt: ckpt.bin
"#;

#[test]
fn run_executes_and_publishes() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);

    let output = labflow(dir.path(), &["run", "pipeline.yaml"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert!(stdout_of(&output).contains("Run succeeded"));

    let artifacts = dir.path().join(".labflow/artifacts");
    let published: Vec<_> = std::fs::read_dir(&artifacts).unwrap().collect();
    assert_eq!(published.len(), 1);
}

#[test]
fn rerun_is_up_to_date() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);

    assert!(labflow(dir.path(), &["run", "pipeline.yaml"]).status.success());

    let second = labflow(dir.path(), &["run", "pipeline.yaml"]);
    assert!(second.status.success());
    assert!(stdout_of(&second).contains("0 executed, 1 up to date"));
}

#[test]
fn unknown_override_rejected_before_any_stage() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);

    let output = labflow(dir.path(), &["run", "pipeline.yaml", "--steps", "500"]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("unknown parameter"));

    // Rejected during resolution: the store was never created.
    assert!(!dir.path().join(".labflow/artifacts").exists());
}

#[test]
fn override_changes_parameter() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);

    let output = labflow(dir.path(), &["run", "pipeline.yaml", "--label", "other"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));

    let artifacts = dir.path().join(".labflow/artifacts");
    let entry = std::fs::read_dir(&artifacts)
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    let content = std::fs::read_to_string(entry.path().join("ckpt.bin")).unwrap();
    assert_eq!(content, "other");
}

#[test]
fn failing_stage_enumerated_in_exit() {
    let dir = TempDir::new().unwrap();
    write_pipeline(
        dir.path(),
        r#"
name: failing
stages:
  - name: broken
    command: "exit 1"
  - name: independent
    command: "printf ok > {outputs.out}"
    outputs:
      out: ok.txt
"#,
    );

    let output = labflow(dir.path(), &["run", "pipeline.yaml"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("failed stages: broken"));
}

#[test]
fn validate_reports_cycles() {
    let dir = TempDir::new().unwrap();
    write_pipeline(
        dir.path(),
        r#"
name: cyclic
stages:
  - name: a
    command: "true"
    inputs:
      x: b.out
    outputs:
      y: a.out
  - name: b
    command: "true"
    inputs:
      x: a.out
    outputs:
      y: b.out
"#,
    );

    let output = labflow(dir.path(), &["validate", "pipeline.yaml"]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("cycle detected"));
}

#[test]
fn validate_prints_execution_order() {
    let dir = TempDir::new().unwrap();
    write_pipeline(
        dir.path(),
        r#"
name: chain
stages:
  - name: extract
    command: "cat {inputs.ckpt} > {outputs.reps}"
    inputs:
      ckpt: ckpt.bin
    outputs:
      reps: reps.txt
  - name: finetune
    command: "printf w > {outputs.ckpt}"
    outputs:
      ckpt: ckpt.bin
"#,
    );

    let output = labflow(dir.path(), &["validate", "pipeline.yaml"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));

    let stdout = stdout_of(&output);
    let finetune = stdout.find("- finetune").unwrap();
    let extract = stdout.find("- extract").unwrap();
    assert!(finetune < extract);
}

#[test]
fn params_lists_declarations() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);

    let output = labflow(dir.path(), &["params", "pipeline.yaml"]);
    assert!(output.status.success());

    let stdout = stdout_of(&output);
    assert!(stdout.contains("--label"));
    assert!(stdout.contains("default: weights"));
}

#[test]
fn plan_tracks_cache_status() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);

    let before = labflow(dir.path(), &["plan", "pipeline.yaml"]);
    assert!(before.status.success());
    assert!(stdout_of(&before).contains("will run"));

    assert!(labflow(dir.path(), &["run", "pipeline.yaml"]).status.success());

    let after = labflow(dir.path(), &["plan", "pipeline.yaml"]);
    assert!(after.status.success());
    assert!(stdout_of(&after).contains("cached"));
}

#[test]
fn missing_producer_is_configuration_error() {
    let dir = TempDir::new().unwrap();
    write_pipeline(
        dir.path(),
        r#"
name: dangling
stages:
  - name: extract
    command: "cat {inputs.ckpt}"
    inputs:
      ckpt: never-produced.bin
"#,
    );

    let output = labflow(dir.path(), &["run", "pipeline.yaml"]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("no producing stage"));
}

#[test]
fn run_report_written_as_json() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);

    let output = labflow(
        dir.path(),
        &["run", "pipeline.yaml", "--report", "report.json"],
    );
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));

    let report = std::fs::read_to_string(dir.path().join("report.json")).unwrap();
    assert!(report.contains("\"pipeline\": \"simple\""));
    assert!(report.contains("finetune"));
}

#[test]
fn config_file_in_workdir_is_picked_up() {
    let dir = TempDir::new().unwrap();
    write_pipeline(dir.path(), SIMPLE);
    std::fs::write(dir.path().join("labflow.yaml"), "max_parallel: 1\n").unwrap();

    let output = labflow(dir.path(), &["run", "pipeline.yaml"]);
    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
}
