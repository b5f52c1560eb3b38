//! CLI integration tests for all subcommands.
//!
//! Uses `assert_cmd` to spawn the `tracecheck` binary against log folders
//! built in temporary directories, and checks exit codes, stdout and stderr.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn tracecheck() -> Command {
    let mut cmd = cargo_bin_cmd!("tracecheck");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn span(trace_id: u64, span_id: u64, parent_id: u64, rid: Option<&str>) -> Value {
    let mut meta = serde_json::Map::new();
    if let Some(rid) = rid {
        meta.insert(
            "http.useragent".to_string(),
            json!(format!("tracecheck rid/{}", rid)),
        );
    }
    json!({
        "trace_id": trace_id, "span_id": span_id, "parent_id": parent_id,
        "name": "web.request", "service": "weblog", "resource": "GET /",
        "start": 1_700_000_000_000_000_000i64, "duration": 1000, "error": 0,
        "meta": meta, "metrics": {}
    })
}

fn trace_envelope(traces: Value) -> String {
    let envelope = json!({
        "path": "/v0.4/traces",
        "request": {"method": "PUT", "headers": [], "content": traces},
        "response": {"status_code": 200, "headers": [], "content": {}}
    });
    format!("{}\n", envelope)
}

fn interface_dir(root: &Path, source: &str) -> PathBuf {
    let dir = root.join("interfaces").join(source);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// A clean run: two library payloads, one trace each, root plus child.
fn clean_run() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let dir = interface_dir(tmp.path(), "library");
    fs::write(
        dir.join("00001.log"),
        trace_envelope(json!([[span(1, 10, 0, Some("RID1")), span(1, 11, 10, None)]])),
    )
    .unwrap();
    fs::write(
        dir.join("00002.log"),
        trace_envelope(json!([[span(2, 20, 0, Some("RID2"))]])),
    )
    .unwrap();
    interface_dir(tmp.path(), "agent");
    tmp
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    tracecheck()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Conformance harness"));
}

#[test]
fn version_exits_0() {
    tracecheck()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tracecheck"));
}

// ──────────────────────────────────────────────
// 2. Replay
// ──────────────────────────────────────────────

#[test]
fn replay_clean_run_prints_tap_and_exits_0() {
    let run = clean_run();
    tracecheck()
        .arg("replay")
        .arg(run.path())
        .assert()
        .success()
        .stdout(predicate::str::starts_with("TAP version 14"))
        .stdout(predicate::str::contains("ok 1 - session: [library] schema conformance"))
        .stdout(predicate::str::contains("[library] trace id uniqueness"))
        .stdout(predicate::str::contains("# fail  0"));
}

#[test]
fn replay_with_corrupt_entry_exits_1() {
    let run = clean_run();
    let dir = run.path().join("interfaces").join("library");
    fs::write(dir.join("00003.log"), "{\"path\": \"/v0.4/traces\", \"req\n").unwrap();

    tracecheck()
        .arg("replay")
        .arg(run.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("not ok"))
        .stdout(predicate::str::contains("deserialization: [library] 1 corrupt log entries"))
        .stdout(predicate::str::contains("00003.log"));
}

#[test]
fn replay_reports_duplicated_trace_ids() {
    let run = clean_run();
    let dir = run.path().join("interfaces").join("library");
    fs::write(
        dir.join("00003.log"),
        trace_envelope(json!([[span(2, 30, 0, Some("RID3"))]])),
    )
    .unwrap();

    tracecheck()
        .arg("replay")
        .arg(run.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("not ok"))
        .stdout(predicate::str::contains("shared by several traces: 2"));
}

#[test]
fn replay_schema_error_can_be_allowed() {
    let run = clean_run();
    let dir = run.path().join("interfaces").join("library");
    let mut bad = span(3, 30, 0, None);
    bad["meta"]["http.status_code"] = json!(200);
    fs::write(dir.join("00003.log"), trace_envelope(json!([[bad]]))).unwrap();

    tracecheck()
        .arg("replay")
        .arg(run.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("schema violation"));

    tracecheck()
        .arg("replay")
        .arg(run.path())
        .args(["--allow-error", "/v0.4/traces#/*/*/meta/http.status_code"])
        .assert()
        .success()
        .stdout(predicate::str::contains("tolerated: /v0.4/traces#/*/*/meta/http.status_code"));
}

#[test]
fn replay_json_output_is_deterministic() {
    let run = clean_run();
    let digest = || {
        let out = tracecheck()
            .args(["--output", "json", "replay"])
            .arg(run.path())
            .output()
            .unwrap();
        assert!(out.status.success());
        let report: Value = serde_json::from_slice(&out.stdout).unwrap();
        assert_eq!(report["mode"], "replay");
        assert_eq!(report["failed"], 0);
        report["digest"].as_str().unwrap().to_string()
    };
    let first = digest();
    assert_eq!(first.len(), 64);
    assert_eq!(first, digest());
}

#[test]
fn replay_missing_folder_exits_1() {
    tracecheck()
        .args(["replay", "/nonexistent/logs_default"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("log folder not found"));
}

#[test]
fn replay_rejects_unknown_config_keys() {
    let run = clean_run();
    let config = run.path().join("tracecheck.toml");
    fs::write(&config, "[engine]\npoll_every = 3\n").unwrap();

    tracecheck()
        .arg("replay")
        .arg(run.path())
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn replay_telemetry_checks_follow_the_scenario_features() {
    let run = clean_run();
    let config = run.path().join("tracecheck.toml");
    fs::write(
        &config,
        "[scenario]\nlibrary = \"java\"\nfeatures = [\"telemetry\"]\n",
    )
    .unwrap();

    // No telemetry was captured: the telemetry checks find nothing to check.
    tracecheck()
        .arg("replay")
        .arg(run.path())
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("no skipped telemetry seq_id"))
        .stdout(predicate::str::contains("no matching data"));
}

// ──────────────────────────────────────────────
// 3. Watch
// ──────────────────────────────────────────────

#[test]
fn watch_collects_live_data_until_the_timeout() {
    let run = clean_run();
    tracecheck()
        .args(["--output", "json", "--quiet", "watch"])
        .arg(run.path())
        .args(["--timeout", "1", "--poll-interval-ms", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"live\""))
        .stdout(predicate::str::contains("\"library\""));
}

// ──────────────────────────────────────────────
// 4. Validate, inspect, spans
// ──────────────────────────────────────────────

#[test]
fn validate_reports_violations_with_their_key() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("00001.log");
    let mut bad = span(1, 10, 0, None);
    bad["meta"]["http.status_code"] = json!(200);
    fs::write(&file, trace_envelope(json!([[bad]]))).unwrap();

    tracecheck()
        .arg("validate")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 violation(s)"))
        .stdout(predicate::str::contains("key: /v0.4/traces#/*/*/meta/http.status_code"));
}

#[test]
fn validate_clean_file_exits_0() {
    let run = clean_run();
    let file = run.path().join("interfaces/library/00001.log");
    tracecheck()
        .args(["--output", "json", "validate"])
        .arg(&file)
        .args(["--source", "library"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"valid\": true"));
}

#[test]
fn validate_rejects_unknown_source() {
    let run = clean_run();
    let file = run.path().join("interfaces/library/00001.log");
    tracecheck()
        .arg("validate")
        .arg(&file)
        .args(["--source", "proxy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown source"));
}

#[test]
fn inspect_lists_interfaces_and_endpoints() {
    let run = clean_run();
    tracecheck()
        .arg("inspect")
        .arg(run.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "library: 2 request(s), 2 response(s), 0 request id(s), 0 error(s)",
        ))
        .stdout(predicate::str::contains("/v0.4/traces"))
        .stdout(predicate::str::contains("agent: 0 request(s)"));
}

#[test]
fn spans_dumps_the_matched_trace() {
    let run = clean_run();
    let out = tracecheck()
        .args(["--output", "json", "spans"])
        .arg(run.path())
        .args(["--rid", "RID1", "--full-trace"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let spans: Value = serde_json::from_slice(&out.stdout).unwrap();
    let ids: Vec<u64> = spans
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["span_id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, vec![10, 11]);

    tracecheck()
        .arg("spans")
        .arg(run.path())
        .args(["--rid", "RID1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("web.request"))
        .stdout(predicate::str::contains("record #0"));
}

#[test]
fn spans_for_an_unknown_request_exit_1() {
    let run = clean_run();
    tracecheck()
        .arg("spans")
        .arg(run.path())
        .args(["--rid", "NOPE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No spans for request id NOPE"));
}
