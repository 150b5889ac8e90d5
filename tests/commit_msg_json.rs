use assert_cmd::prelude::*;
use predicates::str::contains;
use std::fs;
use std::process::Command;

#[test]
fn commit_msg_from_diff_file_mock() {
    let temp = tempfile::tempdir().unwrap();
    let diff_path = temp.path().join("d.diff");
    fs::write(&diff_path, "--- a/foo\n+++ b/foo\n@@\n-line\n+line2\n").unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", temp.path()).args([
        "commit-msg",
        "--diff-file",
        diff_path.to_str().unwrap(),
        "--endpoint",
        "mock",
    ]);
    cmd.assert().success().stdout(contains("chore:"));
}

#[test]
fn commit_msg_honors_global_json() {
    let temp = tempfile::tempdir().unwrap();
    let diff_path = temp.path().join("d.diff");
    fs::write(&diff_path, "--- a/foo\n+++ b/foo\n@@\n-line\n+line2\n").unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", temp.path()).args([
        "--json",
        "commit-msg",
        "--diff-file",
        diff_path.to_str().unwrap(),
        "--endpoint",
        "mock",
    ]);
    cmd.assert()
        .success()
        .stdout(contains("\"type\""))
        .stdout(contains("\"message\""));
}

#[test]
fn commit_msg_missing_diff_file_errors() {
    let temp = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", temp.path()).args([
        "commit-msg",
        "--diff-file",
        "/no/such/file.diff",
        "--endpoint",
        "mock",
    ]);
    cmd.assert().failure().stderr(contains("not found"));
}

#[test]
fn commit_msg_rejects_unknown_type() {
    let temp = tempfile::tempdir().unwrap();
    let diff_path = temp.path().join("d.diff");
    fs::write(&diff_path, "--- a/foo\n+++ b/foo\n").unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", temp.path()).args([
        "commit-msg",
        "--diff-file",
        diff_path.to_str().unwrap(),
        "--endpoint",
        "mock",
        "--type",
        "banana",
    ]);
    cmd.assert().failure().stderr(contains("unknown commit type"));
}
