use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;

#[test]
fn init_writes_config_to_xdg_config_home() {
    let temp = tempfile::tempdir().unwrap();
    let xdg_config_home = temp.path().join(".config");
    std::fs::create_dir_all(&xdg_config_home).unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home).args([
        "init",
        "--endpoint",
        "http://10.0.0.5:8000/v3/chat/completions",
        "--password",
        "TEST_SECRET",
    ]);
    cmd.assert().success().stdout(contains("config written:"));

    let cfg_path = xdg_config_home.join("rwkv-assistant").join("config.toml");
    let contents = std::fs::read_to_string(cfg_path).unwrap();
    assert!(contents.contains("[completion]"));
    assert!(contents.contains("10.0.0.5"));
    assert!(contents.contains("TEST_SECRET"));
    assert!(contents.contains("[chat]"));
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().unwrap();
    let xdg_config_home = temp.path().join(".config");
    std::fs::create_dir_all(&xdg_config_home).unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home).arg("init");
    cmd.assert().success();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home).arg("init");
    cmd.assert().failure().stderr(contains("already exists"));

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home)
        .args(["init", "--force"]);
    cmd.assert().success();
}

#[test]
fn config_show_set_roundtrip() {
    let temp = tempfile::tempdir().unwrap();
    let xdg_config_home = temp.path().join(".config");
    std::fs::create_dir_all(&xdg_config_home).unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home)
        .args(["config", "set", "completion.max_lines", "5"]);
    cmd.assert().success().stdout(contains("updated completion.max_lines"));

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home)
        .args(["config", "show"]);
    cmd.assert().success().stdout(contains("max_lines = 5"));
}

#[test]
fn config_set_unknown_key_fails() {
    let temp = tempfile::tempdir().unwrap();
    let xdg_config_home = temp.path().join(".config");
    std::fs::create_dir_all(&xdg_config_home).unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home)
        .args(["config", "set", "completion.bogus", "1"]);
    cmd.assert().failure().stderr(contains("unknown config key"));
}

#[test]
fn config_toggle_flips_enabled() {
    let temp = tempfile::tempdir().unwrap();
    let xdg_config_home = temp.path().join(".config");
    std::fs::create_dir_all(&xdg_config_home).unwrap();

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home)
        .args(["config", "toggle"]);
    cmd.assert().success().stdout(contains("completion disabled"));

    let mut cmd = Command::cargo_bin("rwkv").unwrap();
    cmd.env("XDG_CONFIG_HOME", &xdg_config_home)
        .args(["config", "toggle"]);
    cmd.assert().success().stdout(contains("completion enabled"));
}
