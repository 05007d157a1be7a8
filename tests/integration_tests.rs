mod common;

use assert_fs::prelude::*;
use predicates::prelude::*;
use std::process::{Command, Output};

use common::{assert_contains_all, TestEnvironment};

/// Integration tests for repovault CLI commands
/// These tests run the actual binary and verify its behavior

fn repovault(env: &TestEnvironment, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_repovault"))
        .args(args)
        .current_dir(env.path())
        .env("XDG_CONFIG_HOME", env.path().join("xdg"))
        .env_remove("RUST_LOG")
        .env_remove("GITHUB_TOKEN")
        .env_remove("BASE_DIR")
        .env_remove("ARCHIVE_OUTPUT_DIR")
        .env_remove("UPLOAD_BACKEND")
        .output()
        .expect("Failed to execute repovault")
}

#[test]
fn test_cli_help() {
    let env = TestEnvironment::new();
    let output = repovault(&env, &["--help"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains_all(
        &stdout,
        &["run", "list", "fetch", "archive", "upload", "init", "doctor"],
    );
}

#[test]
fn test_cli_version() {
    let env = TestEnvironment::new();
    let output = repovault(&env, &["--version"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("repovault"));
}

#[test]
fn test_init_writes_config_and_base_dir() {
    let env = TestEnvironment::new();
    let temp = assert_fs::TempDir::new().unwrap();
    let base_dir = temp.child("backups");
    let config_path = temp.child("repovault.yml");

    let output = repovault(
        &env,
        &[
            "init",
            "--base-dir",
            base_dir.path().to_str().unwrap(),
            "--config",
            config_path.path().to_str().unwrap(),
        ],
    );

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    base_dir.assert(predicate::path::is_dir());
    config_path.assert(predicate::str::contains("base_directory"));
    config_path.assert(predicate::str::contains("backups"));
}

#[test]
fn test_init_with_default_config_location() {
    let env = TestEnvironment::new();
    let base_dir = env.path().join("backups");

    let output = repovault(&env, &["init", "--base-dir", base_dir.to_str().unwrap()]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(base_dir.is_dir());

    let config_path = env.path().join("xdg").join("repovault").join("config.yml");
    let saved = std::fs::read_to_string(config_path).unwrap();
    assert!(saved.contains(base_dir.to_str().unwrap()));
    assert!(String::from_utf8_lossy(&output.stdout).contains("initialized"));
}

#[test]
fn test_archive_command_creates_archive() {
    let env = TestEnvironment::new();
    let config_path = env.create_minimal_config();
    std::fs::create_dir_all(env.base_dir().join("alice").join("tools")).unwrap();
    std::fs::write(env.base_dir().join("alice/tools/README.md"), "# tools").unwrap();

    let output = repovault(&env, &["--config", config_path.to_str().unwrap(), "archive"]);

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(env.output_dir().join("repos.tar.gz").exists());
    assert!(String::from_utf8_lossy(&output.stdout).contains("repos.tar.gz"));
}

#[test]
fn test_archive_failure_exits_non_zero() {
    let env = TestEnvironment::new();
    let config_path = env.create_minimal_config();

    // base directory was never created
    let output = repovault(&env, &["--config", config_path.to_str().unwrap(), "archive"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}

#[test]
fn test_upload_without_archive_fails() {
    let env = TestEnvironment::new();
    let config_path = env.create_minimal_config();

    let output = repovault(&env, &["--config", config_path.to_str().unwrap(), "upload"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("No archive named"));
}

#[test]
fn test_run_rejects_invalid_upload_config() {
    let env = TestEnvironment::new();
    let config_path = env.create_test_config(&format!(
        r#"
base_directory: "{}"
upload:
  backend: s3
"#,
        env.base_dir().display()
    ));

    let output = Command::new(env!("CARGO_BIN_EXE_repovault"))
        .args(["--config", config_path.to_str().unwrap(), "run"])
        .current_dir(env.path())
        .env_remove("S3_BUCKET")
        .env_remove("UPLOAD_BACKEND")
        .output()
        .expect("Failed to execute repovault");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("bucket"));
}

#[test]
fn test_missing_config_file_fails() {
    let env = TestEnvironment::new();
    let output = repovault(&env, &["--config", "/nonexistent/repovault.yml", "archive"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read config file"));
}

#[test]
fn test_doctor_reports_failures() {
    let env = TestEnvironment::new();
    let config_path = env.create_minimal_config();

    let output = repovault(&env, &["--config", config_path.to_str().unwrap(), "doctor"]);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_contains_all(
        &stdout,
        &["System Diagnostics", "Git Installation", "Base Directory", "Upload Backend"],
    );
    // base directory is missing and no GitHub token is available
    assert_eq!(output.status.code(), Some(1));
}
