use std::process::Command;

use crate::common::init_test_logging;

#[test]
fn test_chaosd_help_includes_usage() {
    init_test_logging();
    crate::test_log!("TEST START: test_chaosd_help_includes_usage");

    let output = Command::new(env!("CARGO_BIN_EXE_chaosd"))
        .arg("--help")
        .output()
        .expect("Failed to run chaosd --help");

    assert!(output.status.success(), "chaosd --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("chaosd"), "Expected help to mention chaosd, got: {stdout}");
    assert!(stdout.contains("--set"), "Expected help to list --set, got: {stdout}");

    crate::test_log!("TEST PASS: test_chaosd_help_includes_usage");
}

#[test]
fn test_chaosd_runs_iteration_budget() {
    init_test_logging();
    crate::test_log!("TEST START: test_chaosd_runs_iteration_budget");

    let dir = tempfile::tempdir().expect("tempdir");
    let state_file = dir.path().join("state.json");
    let events_file = dir.path().join("events.jsonl");

    let output = Command::new(env!("CARGO_BIN_EXE_chaosd"))
        .args(["--nodes", "3", "--partitions", "1", "--recovery", "0s"])
        .args(["--max-iterations", "1", "--seed", "11"])
        .args(["--set", "WaitTimeBetweenFaultsInSeconds=0"])
        .args(["--set", "WaitTimeBetweenIterationsInSeconds=0"])
        .arg("--state-file")
        .arg(&state_file)
        .arg("--events-file")
        .arg(&events_file)
        .output()
        .expect("Failed to run chaosd");

    assert!(
        output.status.success(),
        "chaosd failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let events = std::fs::read_to_string(&events_file).expect("events file");
    let kinds: Vec<String> = events
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("event json");
            value["event"]["kind"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("started"));
    assert_eq!(kinds.last().map(String::as_str), Some("stopped"));
    assert_eq!(kinds.iter().filter(|k| *k == "stopped").count(), 1);

    let state: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_file).expect("state file"))
            .expect("state json");
    assert_eq!(state["status"], "stopped");
    assert_eq!(state["iteration"], 1);

    crate::test_log!("TEST PASS: test_chaosd_runs_iteration_budget");
}

#[test]
fn test_chaosd_rejects_unknown_override() {
    init_test_logging();

    let output = Command::new(env!("CARGO_BIN_EXE_chaosd"))
        .args(["--set", "NoSuchParameter=1"])
        .output()
        .expect("Failed to run chaosd");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("NoSuchParameter"), "stderr: {stderr}");
}
