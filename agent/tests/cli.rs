//! CLI tests for `agent check`, `agent package` and `agent run` startup failures.
//!
//! Spawns the agent binary with a scrubbed environment and verifies exit codes.

use std::process::Command;

use agent::exit_codes;

fn agent(dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_agent"));
    cmd.current_dir(dir)
        .env_clear()
        .env("PATH", "/usr/local/bin:/usr/bin:/bin");
    cmd
}

#[test]
fn check_without_credentials_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = agent(temp.path()).arg("check").output().expect("agent check");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("GROQ_API_KEY (missing)"));
}

#[test]
fn check_reports_present_credentials_without_leaking_them() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = agent(temp.path())
        .arg("check")
        .env("OPENAI_API_KEY", "sk-test-secret")
        .output()
        .expect("agent check");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("OPENAI_API_KEY (present)"));
    assert!(!stdout.contains("sk-test-secret"));
}

#[test]
fn check_rejects_out_of_range_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("agent.toml"), "command_timeout_secs = 1\n").expect("config");
    let output = agent(temp.path()).arg("check").output().expect("agent check");
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("command_timeout_secs"));
}

#[test]
fn run_without_credentials_aborts_with_status_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ws = temp.path().join("ws");
    let status = agent(temp.path())
        .args(["run", "--workspace"])
        .arg(&ws)
        .status()
        .expect("agent run");
    assert_eq!(status.code(), Some(exit_codes::INVALID));
    let contents = std::fs::read_to_string(ws.join("status.txt")).expect("status file");
    assert!(contents.starts_with("status=Failed\n"));
    // The default task is seeded, but nothing is packaged.
    assert!(ws.join("task.txt").is_file());
    assert!(!ws.join("output.tar.gz").exists());
}

#[test]
fn package_writes_archive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ws = temp.path().join("ws");
    std::fs::create_dir_all(&ws).expect("mkdir");
    std::fs::write(ws.join("main.py"), "print('hi')\n").expect("write");
    let output = agent(temp.path())
        .args(["package", "--workspace"])
        .arg(&ws)
        .output()
        .expect("agent package");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(ws.join("output.tar.gz").is_file());
    assert!(String::from_utf8_lossy(&output.stdout).contains("packaged 1 files"));
}
