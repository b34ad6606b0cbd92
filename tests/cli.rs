use assert_cmd::prelude::*;
use std::{fs, process::Command};
use tempfile::TempDir;

fn write_env(dir: &TempDir) -> String {
    let env_path = dir.path().join("env");
    let content = format!(
        "DATABASE_URL=sqlite://{}/events.db\nBIND_WS=127.0.0.1:0\nBIND_HTTP=127.0.0.1:0\n",
        dir.path().display()
    );
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

#[test]
fn init_db_creates_the_database_file() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    Command::cargo_bin("nostrum")
        .unwrap()
        .args(["--env", &env_path, "init-db"])
        .assert()
        .success();
    assert!(dir.path().join("events.db").exists());
}

#[test]
fn wipe_succeeds_on_a_fresh_database() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    Command::cargo_bin("nostrum")
        .unwrap()
        .args(["--env", &env_path, "init-db"])
        .assert()
        .success();
    Command::cargo_bin("nostrum")
        .unwrap()
        .args(["--env", &env_path, "wipe"])
        .assert()
        .success();
    assert!(dir.path().join("events.db").exists());
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::cargo_bin("nostrum")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for cmd in ["init-db", "serve", "verify", "wipe"] {
        assert!(text.contains(cmd));
    }
}

#[test]
fn verify_succeeds_on_an_empty_database() {
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir);
    Command::cargo_bin("nostrum")
        .unwrap()
        .args(["--env", &env_path, "init-db"])
        .assert()
        .success();
    Command::cargo_bin("nostrum")
        .unwrap()
        .args(["--env", &env_path, "verify", "--sample", "10"])
        .assert()
        .success();
}

#[test]
fn unknown_subcommand_fails() {
    Command::cargo_bin("nostrum")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure();
}
