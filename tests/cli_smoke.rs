use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;

#[test]
fn prints_help() {
    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.arg("--help");
    cmd.assert().success().stdout(contains("RWKV assistant CLI"));
}

#[test]
fn complete_requires_cursor_args() {
    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.arg("complete");
    cmd.assert().failure().stderr(contains("Usage:"));
}

#[test]
fn ask_requires_prompt() {
    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.arg("ask");
    let assert = cmd.assert().failure();
    // clap should error about the missing argument
    assert.stderr(contains("Usage:"));
}

#[test]
fn ask_stub_works() {
    let temp = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_DATA_HOME", temp.path())
        .args(["ask", "--endpoint", "mock", "What", "is", "RWKV?"]);
    cmd.assert().success().stdout(contains("stub answer"));
}

#[test]
fn ask_json_mock() {
    let temp = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_DATA_HOME", temp.path())
        .args(["ask", "--endpoint", "mock", "hello", "--json"]);
    cmd.assert().success().stdout(contains("\"answer\""));
}
