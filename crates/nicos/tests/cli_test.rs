//! Integration tests for the `nicos` CLI binary.
//!
//! Devices come from setup files in a temporary directory and run against
//! virtual hardware; cache commands talk to an in-process cache server.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use nicos_core::cache::{CacheServer, CacheStore};
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `nicos` binary with env isolation.
///
/// Clears all `NICOS_*` env vars and points config directories at a
/// nonexistent path so tests never touch the user's real configuration.
fn nicos_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("nicos");
    cmd.env("HOME", "/tmp/nicos-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/nicos-cli-test-nonexistent")
        .env_remove("NICOS_CONFIG")
        .env_remove("NICOS_CACHE")
        .env_remove("NICOS_OUTPUT")
        .env_remove("NICOS_LOG_DIR")
        .env_remove("NICOS_LOG_LEVEL")
        .env_remove("RUST_LOG");
    cmd
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

const MOTORS: &str = r#"
description = "sample stage"

[devices.m1]
class = "VirtualMotor"
unit = "mm"
abslimits = [-10, 10]

[devices.sw]
class = "Switcher"
moveable = "m1"
mapping = { in = 0.0, out = 5.0 }
precision = 0.01
"#;

const BROKEN: &str = "devices = 3\n";

fn setup_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "motors", MOTORS);
    dir
}

fn write(dir: &Path, name: &str, text: &str) {
    std::fs::write(dir.join(format!("{name}.toml")), text).unwrap();
}

/// `nicos` with the setup directory and no cache connection.
fn device_cmd(dir: &Path, args: &[&str]) -> assert_cmd::Command {
    let mut cmd = nicos_cmd();
    cmd.arg("--setup-dir")
        .arg(dir)
        .args(args)
        .args(["-s", "motors", "--no-cache"]);
    cmd
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = nicos_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_flag() {
    nicos_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("cache")
            .and(predicate::str::contains("poller"))
            .and(predicate::str::contains("move")),
    );
}

#[test]
fn test_version_flag() {
    nicos_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nicos"));
}

#[test]
fn test_invalid_subcommand() {
    nicos_cmd().arg("teleport").assert().failure().code(2);
}

#[test]
fn test_move_timeout_requires_wait() {
    let dir = setup_dir();
    device_cmd(dir.path(), &["move", "m1", "1", "--timeout", "5s"])
        .assert()
        .failure()
        .code(2);
}

// ── Shell completions ───────────────────────────────────────────────

#[test]
fn test_completions() {
    for shell in ["bash", "zsh", "fish"] {
        nicos_cmd()
            .args(["completions", shell])
            .assert()
            .success()
            .stdout(predicate::str::contains("nicos"));
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[test]
fn test_missing_config_file_is_an_error() {
    let output = nicos_cmd()
        .args(["--config", "/tmp/nicos-cli-test-nonexistent/nicos.toml"])
        .args(["setups", "list"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    assert!(combined_output(&output).contains("nicos.toml"));
}

#[test]
fn test_invalid_cache_address_is_rejected() {
    let output = nicos_cmd()
        .args(["--cache", "host:port:extra", "get", "m1/value"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3), "{}", combined_output(&output));
}

// ── Setups ──────────────────────────────────────────────────────────

#[test]
fn test_setups_list() {
    let dir = setup_dir();
    write(dir.path(), "broken", BROKEN);
    nicos_cmd()
        .arg("--setup-dir")
        .arg(dir.path())
        .args(["setups", "list", "-o", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::contains("motors"))
        .stdout(predicate::str::contains("broken").not());
}

#[test]
fn test_setups_show_json() {
    let dir = setup_dir();
    nicos_cmd()
        .arg("--setup-dir")
        .arg(dir.path())
        .args(["setups", "show", "motors", "-o", "json"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"VirtualMotor\"")
                .and(predicate::str::contains("\"sw\"")),
        );
}

#[test]
fn test_unknown_setup() {
    let dir = setup_dir();
    let output = nicos_cmd()
        .arg("--setup-dir")
        .arg(dir.path())
        .args(["setups", "show", "oven"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
    assert!(combined_output(&output).contains("setups list"));
}

// ── Devices ─────────────────────────────────────────────────────────

#[test]
fn test_read_devices() {
    let dir = setup_dir();
    device_cmd(dir.path(), &["read", "m1", "-o", "json"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"device\": \"m1\"")
                .and(predicate::str::contains("\"status\": \"ok\"")),
        );
}

#[test]
fn test_read_unknown_device() {
    let dir = setup_dir();
    let output = device_cmd(dir.path(), &["read", "m7"]).output().unwrap();
    assert_eq!(output.status.code(), Some(4), "{}", combined_output(&output));
}

#[test]
fn test_move_and_wait() {
    let dir = setup_dir();
    device_cmd(dir.path(), &["move", "m1", "3", "--wait", "-o", "plain"])
        .assert()
        .success()
        .stdout(predicate::str::contains("m1 = 3"));
}

#[test]
fn test_switcher_moves_by_name() {
    let dir = setup_dir();
    device_cmd(dir.path(), &["mv", "sw", "out", "-w", "-o", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("out"));
}

#[test]
fn test_move_beyond_limits() {
    let dir = setup_dir();
    let output = device_cmd(dir.path(), &["move", "m1", "50"]).output().unwrap();
    assert_eq!(output.status.code(), Some(5));
    assert!(combined_output(&output).contains("m1"));
}

// ── Cache keys ──────────────────────────────────────────────────────

#[test]
fn test_get_without_cache_server() {
    // Nothing listens on port 1.
    let output = nicos_cmd()
        .args(["--cache", "127.0.0.1:1", "get", "m1/value"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7));
    assert!(combined_output(&output).contains("127.0.0.1:1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_set_then_get_through_a_cache_server() {
    let server = CacheServer::bind("127.0.0.1:0", CacheStore::new("nicos"))
        .await
        .unwrap();
    let addr = server.local_addr().to_string();

    let run = |args: Vec<String>| {
        let addr = addr.clone();
        tokio::task::spawn_blocking(move || {
            nicos_cmd().args(["--cache", &addr]).args(args).output().unwrap()
        })
    };
    let args = |list: &[&str]| list.iter().map(|s| (*s).to_owned()).collect::<Vec<_>>();

    let set = run(args(&["set", "m1/value", "2.5"])).await.unwrap();
    assert!(set.status.success(), "{}", combined_output(&set));

    let get = run(args(&["get", "M1/value", "-o", "plain"])).await.unwrap();
    assert!(get.status.success(), "{}", combined_output(&get));
    assert_eq!(String::from_utf8_lossy(&get.stdout).trim(), "2.5");

    let all = run(args(&["get", "--all", "m1/", "-o", "json-compact"]))
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&all.stdout).contains("\"key\":\"nicos/m1/value\""));

    let missing = run(args(&["get", "m2/value"])).await.unwrap();
    assert_eq!(missing.status.code(), Some(4));

    let bad = run(args(&["set", "m1/value", "(1,"])).await.unwrap();
    assert_eq!(bad.status.code(), Some(2));

    server.shutdown();
    server.join().await;
}
