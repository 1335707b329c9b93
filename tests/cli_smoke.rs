//! CLI smoke tests for commands that need no bot tokens or network.
//!
//! Each run gets an empty `HOME` so no real config is read.

use std::path::Path;
use std::process::Command;

use base64::Engine;

/// Run adcaster with `args` under `home`; returns (exit_code, stdout, stderr).
fn run_cli(home: &Path, args: &[&str]) -> (i32, String, String) {
    let bin = env!("CARGO_BIN_EXE_adcaster");
    let output = Command::new(bin)
        .args(args)
        .current_dir(home)
        .env("HOME", home)
        .env("RUST_LOG", "")
        .env_remove("ADCASTER_BOT_TOKEN")
        .env_remove("ADCASTER_LOGGER_BOT_TOKEN")
        .output()
        .expect("failed to execute adcaster binary");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

// ============================================================================
// Help & Version
// ============================================================================

#[test]
fn cli_no_args_shows_help() {
    let home = tempfile::tempdir().unwrap();
    let (code, stdout, _stderr) = run_cli(home.path(), &[]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("adcaster"));
}

#[test]
fn cli_help_lists_commands() {
    let home = tempfile::tempdir().unwrap();
    let (code, stdout, _stderr) = run_cli(home.path(), &["--help"]);
    assert_eq!(code, 0);
    for command in ["run", "dashboard", "keygen", "config", "status"] {
        assert!(stdout.contains(command), "missing {} in help", command);
    }
}

#[test]
fn cli_version_command() {
    let home = tempfile::tempdir().unwrap();
    let (code, stdout, _stderr) = run_cli(home.path(), &["version"]);
    assert_eq!(code, 0);
    assert!(stdout.starts_with("adcaster "));
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

// ============================================================================
// Config
// ============================================================================

#[test]
fn cli_config_path_is_under_home() {
    let home = tempfile::tempdir().unwrap();
    let (code, stdout, _stderr) = run_cli(home.path(), &["config", "path"]);
    assert_eq!(code, 0);
    assert!(stdout.trim().ends_with(".adcaster/config.json"));
}

#[test]
fn cli_config_check_reports_missing_tokens() {
    let home = tempfile::tempdir().unwrap();
    let (code, stdout, _stderr) = run_cli(home.path(), &["config", "check"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("[ERROR] bot.token"));
    assert!(stdout.contains("[ERROR] logger_bot.token"));
}

#[test]
fn cli_config_check_flags_invalid_json() {
    let home = tempfile::tempdir().unwrap();
    let dir = home.path().join(".adcaster");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.json"), "{ not json").unwrap();
    let (_code, stdout, _stderr) = run_cli(home.path(), &["config", "check"]);
    assert!(stdout.contains("Invalid JSON"));
}

#[test]
fn cli_run_refuses_without_tokens() {
    let home = tempfile::tempdir().unwrap();
    let (code, _stdout, stderr) = run_cli(home.path(), &["run"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("bot.token"));
}

// ============================================================================
// Keygen & Status
// ============================================================================

#[test]
fn cli_keygen_prints_a_32_byte_key() {
    let home = tempfile::tempdir().unwrap();
    let (code, stdout, _stderr) = run_cli(home.path(), &["keygen"]);
    assert_eq!(code, 0);
    let key = base64::engine::general_purpose::STANDARD
        .decode(stdout.trim())
        .unwrap();
    assert_eq!(key.len(), 32);
}

#[test]
fn cli_keygen_write_refuses_to_overwrite() {
    let home = tempfile::tempdir().unwrap();
    let (code, _stdout, _stderr) = run_cli(home.path(), &["keygen", "--write"]);
    assert_eq!(code, 0);
    let (code, _stdout, stderr) = run_cli(home.path(), &["keygen", "--write"]);
    assert_ne!(code, 0);
    assert!(stderr.contains("already exists"));
}

#[test]
fn cli_status_without_store() {
    let home = tempfile::tempdir().unwrap();
    let (code, stdout, _stderr) = run_cli(home.path(), &["status"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("No store"));
}
