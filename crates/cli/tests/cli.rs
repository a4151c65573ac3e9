use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn kgrag() -> Command {
    let mut cmd = Command::cargo_bin("kgrag").unwrap();
    cmd.env("TEI_URL", "http://127.0.0.1:9")
        .env("TGI_URL", "http://127.0.0.1:9");
    cmd
}

#[test]
fn test_stats_on_empty_memory_workspace() {
    kgrag()
        .args(["--memory", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workspace Statistics:"))
        .stdout(predicate::str::contains("Documents: 0"));
}

#[test]
fn test_stats_json() {
    kgrag()
        .args(["--memory", "stats", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"entities\": 0"));
}

#[test]
fn test_communities_on_fresh_working_dir() {
    let dir = TempDir::new().unwrap();
    kgrag()
        .arg("--working-dir")
        .arg(dir.path())
        .arg("communities")
        .assert()
        .success()
        .stdout(predicate::str::contains("No communities yet"));
}

#[test]
fn test_reset_removes_working_dir() {
    let dir = TempDir::new().unwrap();
    let working = dir.path().join("ws");
    std::fs::create_dir_all(&working).unwrap();
    kgrag()
        .arg("--working-dir")
        .arg(&working)
        .arg("reset")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed working directory"));
    assert!(!working.exists());
}

#[test]
fn test_rejects_unknown_query_mode() {
    kgrag()
        .args(["--memory", "query", "who?", "--mode", "hybrid"])
        .assert()
        .failure();
}

#[test]
fn test_insert_fails_fast_without_services() {
    kgrag()
        .args(["--memory", "insert", "--text", "Alice works at Acme."])
        .assert()
        .failure()
        .stderr(predicate::str::contains("service is not reachable"));
}
