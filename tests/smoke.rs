//! Smoke tests -- verify the binary runs and the controller commands work
//! against a scratch store.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn jobrelay(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("jobrelay").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("JOBRELAY_CONFIG")
        .arg("--db")
        .arg(dir.path().join("queue.db"));
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("jobrelay")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Durable request queue"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("jobrelay")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("jobrelay"));
}

#[test]
fn test_submit_test_subcommand_exists() {
    Command::cargo_bin("jobrelay")
        .unwrap()
        .args(["submit", "test", "--help"])
        .assert()
        .success();
}

#[test]
fn test_poller_subcommand_exists() {
    Command::cargo_bin("jobrelay")
        .unwrap()
        .args(["poller", "status", "--help"])
        .assert()
        .success();
}

#[test]
fn test_init_creates_store() {
    let dir = TempDir::new().unwrap();
    jobrelay(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicates::str::contains("Initialized request store"));
    assert!(dir.path().join("queue.db").exists());
}

#[test]
fn test_submit_then_list_pending() {
    let dir = TempDir::new().unwrap();
    jobrelay(&dir)
        .args(["submit", "test", "class", "PlayerTests", "--priority", "3"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Submitted request #1"));

    jobrelay(&dir)
        .args(["list", "--status", "pending"])
        .assert()
        .success()
        .stdout(predicates::str::contains("run-class").and(predicates::str::contains("PlayerTests")));
}

#[test]
fn test_submit_class_without_target_fails() {
    let dir = TempDir::new().unwrap();
    jobrelay(&dir)
        .args(["submit", "test", "class"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("needs at least one target"));
}

#[test]
fn test_cancel_pending_then_again() {
    let dir = TempDir::new().unwrap();
    jobrelay(&dir).args(["submit", "refresh"]).assert().success();

    jobrelay(&dir)
        .args(["cancel", "1"])
        .assert()
        .success()
        .stdout(predicates::str::contains("cancelled (was pending)"));

    jobrelay(&dir)
        .args(["cancel", "1"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("cannot be cancelled"));
}

#[test]
fn test_cancel_unknown_request_fails() {
    let dir = TempDir::new().unwrap();
    jobrelay(&dir)
        .args(["cancel", "42"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not found"));
}

#[test]
fn test_poller_setting_round_trips() {
    let dir = TempDir::new().unwrap();
    jobrelay(&dir)
        .args(["poller", "status"])
        .assert()
        .success()
        .stdout(predicates::str::contains("host default"));

    jobrelay(&dir).args(["poller", "disable"]).assert().success();

    jobrelay(&dir)
        .args(["poller", "status"])
        .assert()
        .success()
        .stdout(predicates::str::contains("disabled"));
}

#[test]
fn test_status_json_counts_pending() {
    let dir = TempDir::new().unwrap();
    jobrelay(&dir).args(["submit", "test", "all"]).assert().success();
    jobrelay(&dir)
        .args(["submit", "test", "category", "Smoke", "--mode", "play-mode"])
        .assert()
        .success();

    let output = jobrelay(&dir).args(["status", "--json"]).output().unwrap();
    assert!(output.status.success());
    let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(snapshot["pending"], 2);
    assert_eq!(snapshot["running"], 0);
}
