#![cfg(any(target_os = "linux", target_os = "macos"))]

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;

fn scan_json(extra: &[&str]) -> (Option<i32>, Value) {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("--log-level")
        .arg("error")
        .arg("scan")
        .arg("--interval")
        .arg("100ms")
        .args(extra);

    let output = cmd.output().expect("scan should run");
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let parsed: Value = serde_json::from_str(&stdout).expect("stdout should be valid json");
    (output.status.code(), parsed)
}

#[test]
fn scan_json_uses_process_table_envelope() {
    let (code, parsed) = scan_json(&[]);
    assert_eq!(code, Some(0));

    let schema_id = parsed
        .get("schema_id")
        .and_then(Value::as_str)
        .expect("schema_id should be present");
    assert!(
        schema_id.contains("process-table.schema.json"),
        "unexpected schema_id: {schema_id}"
    );
    assert_eq!(parsed["cycle"].as_u64(), Some(2));

    let processes = parsed["processes"]
        .as_array()
        .expect("processes should be an array");
    assert!(!processes.is_empty());
    assert_eq!(
        parsed["total_tasks"].as_u64(),
        Some(processes.len() as u64),
        "every listed row was seen in the last cycle"
    );
}

#[test]
fn scan_pid_filter_returns_parent_process() {
    // The test harness is the parent of the spawned binary and outlives it.
    let pid = std::process::id();
    let (code, parsed) = scan_json(&["--cycles", "1", "--pid", &pid.to_string()]);
    assert_eq!(code, Some(0));

    let processes = parsed["processes"].as_array().unwrap();
    assert_eq!(processes.len(), 1, "expected exactly one process for --pid");
    assert_eq!(processes[0]["pid"].as_u64(), Some(pid as u64));
    assert!(processes[0]["user"].as_str().is_some());
}

#[test]
fn scan_missing_pid_emits_empty_envelope_and_fails() {
    let (code, parsed) = scan_json(&["--cycles", "1", "--pid", "1000000000"]);
    assert_eq!(code, Some(1));
    assert!(parsed["schema_id"].as_str().is_some());
    assert!(parsed["processes"].as_array().unwrap().is_empty());
}

#[test]
fn scan_top_limits_rows() {
    let (code, parsed) = scan_json(&["--cycles", "1", "--top", "1", "--sort", "pid"]);
    assert_eq!(code, Some(0));
    assert_eq!(parsed["processes"].as_array().unwrap().len(), 1);
}

#[test]
fn scan_table_output() {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("--log-level")
        .arg("error")
        .arg("scan")
        .arg("--cycles")
        .arg("1")
        .arg("--table");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("PID"))
        .stdout(predicate::str::contains("Tasks:"));
}

#[test]
fn scan_cycles_from_environment() {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.env("PROCMON_CYCLES", "1")
        .arg("--log-level")
        .arg("error")
        .arg("scan");

    let output = cmd.output().unwrap();
    assert!(output.status.success());
    let parsed: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["cycle"].as_u64(), Some(1));
}

#[test]
fn scan_rejects_bad_interval() {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("scan").arg("--interval").arg("soon");

    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("invalid duration"));
}
