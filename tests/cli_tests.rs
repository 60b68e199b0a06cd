//! Integration tests for the slnet CLI.

use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn create_test_config(dir: &Path, content: &str) -> std::path::PathBuf {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("slnet").expect("Failed to find slnet binary");
    cmd.args(args);
    cmd.env("SLNET_FORCE_CPU", "1");
    cmd
}

/// Tiny synthetic run writing into `output_dir`.
fn synthetic_config_yaml(output_dir: &Path) -> String {
    format!(
        r#"
data:
  source: synthetic
  validation_split: 0.25
  depth_window: 2
  first_window: 1
  synthetic:
    volumes: 4
    views: 3
    depth: 10
    side: 6
training:
  batch_size: 2
  learning_rate: 0.001
  max_epochs: 1
  eval_every: 1
  checkpoint_every: 1
estimator:
  hidden_channels: 4
  num_layers: 2
output_dir: "{}"
prefix: "cli"
"#,
        output_dir.display()
    )
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), &synthetic_config_yaml(temp_dir.path()));

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Configuration is valid"))
        .stdout(predicates::str::contains("Rank budget: 3"));
}

#[test]
fn test_validate_command_invalid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(
        temp_dir.path(),
        "data:\n  source: synthetic\ndecomposition:\n  rank: 0\n",
    );

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_validate_command_malformed_yaml() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), "training: [not, a, map");

    run_cli(&["validate", config_path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_train_command_help() {
    run_cli(&["train", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Start or resume training"))
        .stdout(predicates::str::contains("--checkpoint"))
        .stdout(predicates::str::contains("--learning-rate"))
        .stdout(predicates::str::contains("--dark-current-sparse"));
}

#[test]
fn test_train_requires_config_or_preset() {
    run_cli(&["train"]).assert().failure();
}

#[test]
fn test_init_command_creates_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("generated.yaml");

    run_cli(&[
        "init",
        output_path.to_str().unwrap(),
        "--preset",
        "synthetic-small",
    ])
    .assert()
    .success();

    let content = fs::read_to_string(&output_path).expect("Failed to read generated config");
    assert!(content.contains("decomposition"));
    assert!(content.contains("synthetic"));

    run_cli(&["validate", output_path.to_str().unwrap()])
        .assert()
        .success();
}

#[test]
fn test_init_unknown_preset_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output_path = temp_dir.path().join("generated.yaml");

    run_cli(&["init", output_path.to_str().unwrap(), "--preset", "nope"])
        .assert()
        .failure();
    assert!(!output_path.exists());
}

#[test]
fn test_train_synthetic_run_writes_checkpoint() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = create_test_config(temp_dir.path(), &synthetic_config_yaml(temp_dir.path()));

    run_cli(&["train", "--config", config_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicates::str::contains("Run written to"));

    let run_dir = fs::read_dir(temp_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_dir() && p.to_string_lossy().ends_with("__cli"))
        .expect("run directory");
    assert!(run_dir.join("model_0").join("checkpoint.json").exists());
    assert!(run_dir.join("metrics.jsonl").exists());
}

#[test]
fn test_cli_help() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("sparse + low-rank"))
        .stdout(predicates::str::contains("validate"))
        .stdout(predicates::str::contains("train"))
        .stdout(predicates::str::contains("init"));
}
