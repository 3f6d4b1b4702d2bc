use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
#[cfg(all(target_os = "linux", not(feature = "hwloc")))]
use serde_json::Value;

#[cfg(all(target_os = "linux", not(feature = "hwloc")))]
#[test]
fn affinity_get_json_reports_own_binding() {
    let pid = std::process::id();
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("--log-level")
        .arg("error")
        .arg("affinity")
        .arg("get")
        .arg(pid.to_string())
        .arg("--json");

    let output = cmd.output().expect("affinity get should run");
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let parsed: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(parsed["schema_id"]
        .as_str()
        .unwrap()
        .contains("affinity.schema.json"));
    assert_eq!(parsed["pid"].as_u64(), Some(pid as u64));
    assert_eq!(parsed["kind"], "native_mask");
    assert_eq!(parsed["backend"], "sched_affinity");

    let cpus: Vec<u64> = parsed["cpus"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert!(!cpus.is_empty());
    assert!(cpus.windows(2).all(|w| w[0] < w[1]), "ids must ascend");
}

#[cfg(all(target_os = "linux", not(feature = "hwloc")))]
#[test]
fn affinity_set_to_current_binding_succeeds() {
    let pid = std::process::id();
    let mut get = cargo_bin_cmd!("procmon");
    get.arg("--log-level")
        .arg("error")
        .arg("affinity")
        .arg("get")
        .arg(pid.to_string());
    let output = get.output().unwrap();
    assert!(output.status.success());

    // "pid N: 0-3,6"
    let stdout = String::from_utf8(output.stdout).unwrap();
    let list = stdout
        .trim()
        .split_once(": ")
        .map(|(_, list)| list.to_string())
        .expect("text output should be 'pid N: LIST'");

    let mut set = cargo_bin_cmd!("procmon");
    set.arg("--log-level")
        .arg("error")
        .arg("affinity")
        .arg("set")
        .arg(pid.to_string())
        .arg(&list);
    set.assert()
        .success()
        .stdout(predicate::str::contains(list.as_str()));
}

#[cfg(all(target_os = "linux", not(feature = "hwloc")))]
#[test]
fn affinity_get_missing_pid_fails() {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("--log-level")
        .arg("error")
        .arg("affinity")
        .arg("get")
        .arg("999999999");

    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("unable to read CPU affinity"));
}

#[test]
fn affinity_set_rejects_malformed_list() {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("--log-level")
        .arg("error")
        .arg("affinity")
        .arg("set")
        .arg(std::process::id().to_string())
        .arg("3-1");

    cmd.assert().code(1).stderr(predicate::str::contains("Error:"));
}

#[cfg(any(feature = "hwloc", target_os = "linux"))]
#[test]
fn affinity_set_rejects_unbounded_range_quickly() {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("--log-level")
        .arg("error")
        .arg("affinity")
        .arg("set")
        .arg(std::process::id().to_string())
        .arg("0-4294967295")
        .timeout(std::time::Duration::from_secs(10));

    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("exceeds maximum"));
}

#[cfg(not(any(feature = "hwloc", target_os = "linux")))]
#[test]
fn affinity_reports_not_supported() {
    let mut cmd = cargo_bin_cmd!("procmon");
    cmd.arg("affinity").arg("get").arg("1");

    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("not supported"));
}
