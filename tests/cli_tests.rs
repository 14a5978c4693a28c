use assert_cmd::Command;
use predicates::prelude::*;
use std::process::Stdio;
use taskhive::coordination::{CoordinationProtocol, ProtocolOptions};
use tempfile::TempDir;

fn taskhive(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("taskhive").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("TASKHIVE_BASE_PATH")
        .env_remove("TASKHIVE_AGENT_ID")
        .env_remove("TASKHIVE_TASK_ID")
        .env_remove("TASKHIVE_TASK_TYPE")
        .arg("--base-path")
        .arg(dir.path().join("hive"));
    cmd
}

fn submit(dir: &TempDir, task_type: &str, description: &str, extra: &[&str]) -> String {
    let output = taskhive(dir)
        .args(["submit", task_type, description])
        .args(extra)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

#[test]
fn test_help_lists_administrative_commands() {
    let mut cmd = Command::cargo_bin("taskhive").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("monitor"))
        .stdout(predicate::str::contains("repair"))
        .stdout(predicate::str::contains("agent"));
}

#[test]
fn test_repair_help_shows_modes() {
    let mut cmd = Command::cargo_bin("taskhive").unwrap();
    cmd.args(["repair", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--diagnose"))
        .stdout(predicate::str::contains("--repair-all"))
        .stdout(predicate::str::contains("--validate"))
        .stdout(predicate::str::contains("--emergency"));
}

#[test]
fn test_init_then_validate_succeeds() {
    let dir = TempDir::new().unwrap();
    taskhive(&dir)
        .args(["start", "--init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Coordination directory ready"));
    assert!(dir.path().join("taskhive.toml").exists());
    assert!(dir.path().join("hive").join("event-log.jsonl").exists());

    taskhive(&dir)
        .args(["repair", "--validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("TASKHIVE REPAIR - Validation"))
        .stdout(predicate::str::contains("❌ Failed").not());
}

#[test]
fn test_validate_fails_on_missing_structure() {
    let dir = TempDir::new().unwrap();
    taskhive(&dir)
        .args(["repair", "--validate", "--format", "json"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"failed\""));
}

#[test]
fn test_repair_all_recovers_deleted_projection() {
    let dir = TempDir::new().unwrap();
    let id = submit(&dir, "search", "find things", &[]);
    std::fs::remove_file(dir.path().join("hive").join("task-queue.json")).unwrap();

    taskhive(&dir)
        .args(["repair", "--repair-all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("REPAIR ACTIONS"));

    let queue = std::fs::read_to_string(dir.path().join("hive").join("task-queue.json")).unwrap();
    assert!(queue.contains(&id));
}

#[test]
fn test_emergency_reset_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    submit(&dir, "search", "doomed", &[]);

    taskhive(&dir)
        .args(["repair", "--emergency"])
        .write_stdin("no\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("aborted"));

    taskhive(&dir)
        .args(["repair", "--emergency", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Backup:"));

    let backups: Vec<_> = std::fs::read_dir(dir.path().join("hive").join("backups"))
        .unwrap()
        .collect();
    assert_eq!(backups.len(), 1);
    let log = std::fs::read_to_string(dir.path().join("hive").join("event-log.jsonl")).unwrap();
    assert!(log.is_empty());
}

#[test]
fn test_submit_monitor_and_cancel() {
    let dir = TempDir::new().unwrap();
    let id = submit(&dir, "search", "find things", &["--priority", "2", "--context", "docs"]);

    let output = taskhive(&dir).args(["monitor", "--json"]).output().unwrap();
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["tasks_by_status"]["pending"], 1);
    assert_eq!(status["recent_events"][0]["type"], "task_created");
    assert_eq!(status["recent_events"][0]["payload"]["task_id"], id.as_str());

    taskhive(&dir)
        .args(["cancel", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("cancelled"));

    taskhive(&dir)
        .args(["cancel", &id])
        .assert()
        .failure();
}

#[test]
fn test_agent_workflow_through_cli() {
    let dir = TempDir::new().unwrap();
    let parent = submit(&dir, "search", "parent", &[]);

    taskhive(&dir)
        .args(["agent", "register", "--agent-id", "search-agent-cafe0001", "--agent-type", "search"])
        .assert()
        .success();

    let output = taskhive(&dir)
        .env("TASKHIVE_AGENT_ID", "search-agent-cafe0001")
        .env("TASKHIVE_TASK_TYPE", "search")
        .args(["agent", "claim"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let claimed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(claimed["id"], parent.as_str());
    assert_eq!(claimed["status"], "assigned");

    taskhive(&dir)
        .env("TASKHIVE_AGENT_ID", "search-agent-cafe0001")
        .env("TASKHIVE_TASK_ID", &parent)
        .args(["agent", "start"])
        .assert()
        .success()
        .stdout(predicate::str::contains("in_progress"));

    let output = taskhive(&dir)
        .env("TASKHIVE_AGENT_ID", "search-agent-cafe0001")
        .args([
            "agent",
            "complete",
            &parent,
            "--result",
            r#"{"found": 2, "next_tasks": [{"type": "review", "description": "check"}]}"#,
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let completion: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(completion["task"]["status"], "completed");
    assert_eq!(completion["follow_ups"].as_array().unwrap().len(), 1);

    taskhive(&dir)
        .args(["agent", "dependency", &parent])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"found\": 2"));
}

#[test]
fn test_heartbeat_loop_stops_once_agent_is_reaped() {
    let dir = TempDir::new().unwrap();
    taskhive(&dir)
        .args(["agent", "register", "--agent-id", "search-agent-dead0001", "--agent-type", "search"])
        .assert()
        .success();

    let protocol = CoordinationProtocol::new(dir.path().join("hive"), ProtocolOptions::default());
    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(protocol.reap_agent(
            "search-agent-dead0001",
            chrono::Utc::now() + chrono::Duration::hours(1),
        ))
        .unwrap()
        .unwrap();

    taskhive(&dir)
        .args(["agent", "heartbeat", "--agent-id", "search-agent-dead0001", "--every", "20"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"dead\""));
}

#[test]
fn test_agent_commands_need_an_identity() {
    let dir = TempDir::new().unwrap();
    taskhive(&dir)
        .args(["agent", "poll"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("TASKHIVE_AGENT_ID"));
}

#[test]
fn test_claims_from_separate_processes_have_one_winner() {
    let dir = TempDir::new().unwrap();
    let id = submit(&dir, "search", "contested", &[]);
    let binary = assert_cmd::cargo::cargo_bin("taskhive");

    let children: Vec<_> = (0..6)
        .map(|i| {
            std::process::Command::new(&binary)
                .current_dir(dir.path())
                .env_remove("TASKHIVE_BASE_PATH")
                .arg("--base-path")
                .arg(dir.path().join("hive"))
                .args(["agent", "claim", "--agent-type", "search", "--agent-id"])
                .arg(format!("search-agent-{i:08x}"))
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .unwrap()
        })
        .collect();

    let mut winners = 0;
    for child in children {
        let output = child.wait_with_output().unwrap();
        assert!(output.status.success());
        let claimed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        if claimed["id"] == id.as_str() {
            winners += 1;
        } else {
            assert!(claimed.is_null());
        }
    }
    assert_eq!(winners, 1);
}
