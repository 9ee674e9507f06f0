use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn tap(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_viewsync-tap"))
        .env("HOME", home)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("Failed to run viewsync-tap")
}

fn write(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("Failed to write fixture");
    path.to_string_lossy().into_owned()
}

#[test]
fn replay_prints_reconciled_page() {
    let home = TempDir::new().expect("home");
    let seed = write(
        &home,
        "rows.json",
        r#"[
            {"id": "r2", "status": "active", "name": "Desk"},
            {"id": "r1", "status": "active", "name": "Lamp"},
            {"id": "r0", "status": "inactive", "name": "Chair"}
        ]"#,
    );
    let events = write(
        &home,
        "events.ndjson",
        concat!(
            "{\"event\":\"resource:remove\",\"payload\":{\"resourceType\":\"products\",\"id\":\"r2\"}}\n",
            "{\"event\":\"resource:upsert\",\"payload\":{\"resourceType\":\"products\",\"row\":{\"id\":\"r9\",\"status\":\"active\"}}}\n",
            "{\"event\":\"notification:new\",\"payload\":{\"id\":\"n1\",\"recipientId\":\"local\",\"createdAt\":\"2024-05-01T10:00:00Z\"}}\n",
            "garbage\n",
        ),
    );

    let output = tap(
        home.path(),
        &[
            "replay", "--resource", "products", "--page-size", "2", "--seed", &seed, "--events",
            &events,
        ],
    );
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let summary: Value = serde_json::from_slice(&output.stdout).expect("summary JSON");
    let ids: Vec<&str> = summary["page"]["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|row| row["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["r9", "r1"]);
    assert_eq!(summary["page"]["total"], 2);
    assert_eq!(summary["page"]["totalPages"], 1);
    assert_eq!(summary["events"]["applied"], 3);
    assert_eq!(summary["events"]["dropped"], 1);
    assert_eq!(summary["notifications"]["unread"], 1);
    assert_eq!(summary["viewKey"], "status=active&page=1&size=2");
}

#[test]
fn check_exit_code_reflects_decision() {
    let home = TempDir::new().expect("home");

    let allowed = tap(
        home.path(),
        &["check", "--require", "products.update", "--permission", "products.update"],
    );
    assert!(allowed.status.success());
    assert_eq!(String::from_utf8_lossy(&allowed.stdout).trim(), "allowed");

    let denied = tap(
        home.path(),
        &[
            "check",
            "--require",
            "products.update",
            "--require",
            "products.delete",
            "--permission",
            "products.update",
        ],
    );
    assert_eq!(denied.status.code(), Some(1));
    assert_eq!(String::from_utf8_lossy(&denied.stdout).trim(), "denied");

    let admin = tap(
        home.path(),
        &["check", "--any", "--require", "x.y", "--role", "super_admin"],
    );
    assert!(admin.status.success());
}

#[test]
fn invalid_view_arguments_fail_cleanly() {
    let home = TempDir::new().expect("home");
    let output = tap(home.path(), &["replay", "--resource", "products", "--page", "0"]);
    assert_eq!(output.status.code(), Some(2));
}
