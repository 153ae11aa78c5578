//! CLI integration tests

use std::process::{Command, Output};

fn syncctl(args: &[&str]) -> Output {
    let home = tempfile::tempdir().expect("Failed to create temp home");
    Command::new(env!("CARGO_BIN_EXE_syncctl"))
        .args(args)
        .env("HOME", home.path())
        .env_remove("SYNCCTL_AGENT_URL")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = syncctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("offline sync agent"), "Should show app description");
    assert!(stdout.contains("queue"), "Should show queue command");
    assert!(stdout.contains("dead-letter"), "Should show dead-letter command");
    assert!(stdout.contains("cache"), "Should show cache command");
    assert!(stdout.contains("session"), "Should show session command");
    assert!(stdout.contains("rate-limit"), "Should show rate-limit command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = syncctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("syncctl"), "Should show binary name");
}

#[test]
fn test_queue_help() {
    let output = syncctl(&["queue", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("list"), "Should show list subcommand");
    assert!(stdout.contains("stats"), "Should show stats subcommand");
    assert!(stdout.contains("drain"), "Should show drain subcommand");
}

#[test]
fn test_queue_drain_help() {
    let output = syncctl(&["queue", "drain", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--trigger"), "Should show trigger option");
}

#[test]
fn test_dead_letter_help() {
    let output = syncctl(&["dead-letter", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("resubmit"), "Should show resubmit subcommand");
    assert!(stdout.contains("purge"), "Should show purge subcommand");
}

#[test]
fn test_purge_requires_confirmation() {
    // Without --yes no request is made, so no agent is needed
    let output = syncctl(&[
        "--agent-url",
        "http://127.0.0.1:9",
        "dead-letter",
        "purge",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--yes"), "Should ask for confirmation");
}

#[test]
fn test_rate_limit_show_help() {
    let output = syncctl(&["rate-limit", "show", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--user"), "Should show user option");
    assert!(stdout.contains("<ACTION>"), "Should show action argument");
}

#[test]
fn test_rate_limit_without_user_fails() {
    let output = syncctl(&["rate-limit", "show", "booking"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("No user given"));
}

#[test]
fn test_format_option() {
    let output = syncctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
}

#[test]
fn test_agent_url_option() {
    let output = syncctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--agent-url"), "Should show agent-url option");
    assert!(stdout.contains("SYNCCTL_AGENT_URL"), "Should mention env var");
}

#[test]
fn test_unreachable_agent_reports_error() {
    let output = syncctl(&["--agent-url", "http://127.0.0.1:9", "queue", "stats"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("Failed to reach the sync agent"));
}

#[test]
fn test_invalid_command() {
    let output = syncctl(&["invalid-command"]);

    assert!(!output.status.success(), "Invalid command should fail");
}

#[test]
fn test_missing_argument() {
    let output = syncctl(&["dead-letter", "resubmit"]);

    assert!(
        !output.status.success(),
        "Missing required argument should fail"
    );
}
