//! CLI integration tests
//!
//! Tests the flowlink CLI using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

fn flowlink() -> Command {
    Command::cargo_bin("flowlink")
        .expect("Failed to locate flowlink binary - ensure it's built before running tests")
}

#[test]
fn test_cli_help() {
    flowlink()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("flowlink"))
        .stdout(predicate::str::contains("Remote flow execution client"));
}

#[test]
fn test_cli_version() {
    flowlink()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("flowlink"));
}

#[test]
fn test_cli_run_help() {
    flowlink()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("flow"));
}

#[test]
fn test_cli_jobs_help() {
    flowlink()
        .args(["jobs", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jobs"));
}

#[test]
fn test_cli_kill_help() {
    flowlink()
        .args(["kill", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Job id"));
}

#[test]
fn test_cli_config_show() {
    flowlink()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ssh_binary"));
}

#[test]
fn test_cli_config_path() {
    flowlink()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_cli_run_missing_flow_file() {
    flowlink()
        .args(["run", "/nonexistent/flow.flw"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read flow file"));
}

#[test]
fn test_cli_unknown_command() {
    flowlink()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_cli_end_missing_job() {
    flowlink().arg("end").assert().failure();
}
