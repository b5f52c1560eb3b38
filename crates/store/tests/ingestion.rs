//! Ingestion properties of the record store, exercised against real files.

use std::fs;
use std::path::Path;

use tempfile::TempDir;
use tracecheck_store::{RecordKind, RecordStore, Source};

fn write_envelope(dir: &Path, name: &str, marker: usize) {
    let line = serde_json::json!({
        "path": "/v0.4/traces",
        "request": {
            "headers": [["x-test-request-id", format!("RID{}", marker)]],
            "content": []
        }
    });
    fs::write(dir.join(name), format!("{}\n", line)).unwrap();
}

fn library_dir(tmp: &TempDir) -> std::path::PathBuf {
    let dir = tmp.path().join("interfaces").join("library");
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn arrival_order_matches_file_sequence() {
    let tmp = TempDir::new().unwrap();
    let dir = library_dir(&tmp);

    // Written out of order on purpose: only the name decides the order.
    for i in [3usize, 1, 12, 7, 2, 10] {
        write_envelope(&dir, &format!("{:05}__v0.4_traces.json", i), i);
    }

    let mut store = RecordStore::for_log_folder(tmp.path(), Source::Library);
    store.load_data_from_logs().unwrap();
    assert_eq!(store.staged_len(), 6);
    let records = store.drain();
    assert_eq!(store.staged_len(), 0);

    let markers: Vec<String> = records
        .iter()
        .map(|r| r.request_id.clone().unwrap())
        .collect();
    assert_eq!(markers, vec!["RID1", "RID2", "RID3", "RID7", "RID10", "RID12"]);

    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (0..6).collect::<Vec<u64>>());
}

#[test]
fn polling_across_writes_keeps_sequence_monotonic() {
    let tmp = TempDir::new().unwrap();
    let dir = library_dir(&tmp);
    let mut store = RecordStore::for_log_folder(tmp.path(), Source::Library);

    let mut all = Vec::new();
    for i in 0..20usize {
        write_envelope(&dir, &format!("{:05}.log", i), i);
        if i % 3 == 0 {
            store.poll().unwrap();
            all.extend(store.drain());
        }
    }
    store.poll().unwrap();
    store.flush().unwrap();
    all.extend(store.drain());

    assert_eq!(all.len(), 20);
    for (i, record) in all.iter().enumerate() {
        assert_eq!(record.seq, i as u64);
        assert_eq!(record.request_id.as_deref(), Some(format!("RID{}", i).as_str()));
    }
}

#[test]
fn one_corrupt_entry_among_valid_ones() {
    let tmp = TempDir::new().unwrap();
    let dir = library_dir(&tmp);
    let valid = |i: usize| {
        serde_json::json!({
            "path": "/v0.4/traces",
            "request": {"headers": [["x-test-request-id", format!("R{}", i)]], "content": []}
        })
        .to_string()
    };
    let content = format!(
        "{}\n{}\n{{\"path\": \"/v0.4/traces\", \"request\": \n{}\n{}\n",
        valid(0),
        valid(1),
        valid(2),
        valid(3)
    );
    fs::write(dir.join("00001.log"), content).unwrap();

    let mut store = RecordStore::for_log_folder(tmp.path(), Source::Library);
    let staged = store.load_data_from_logs().unwrap();
    assert_eq!(staged, 4);
    assert_eq!(store.errors().len(), 1);
    assert_eq!(store.errors()[0].line, Some(3));

    let rids: Vec<_> = store
        .drain()
        .into_iter()
        .map(|r| r.request_id.unwrap())
        .collect();
    assert_eq!(rids, vec!["R0", "R1", "R2", "R3"]);
}

#[test]
fn exchanges_pair_requests_with_responses() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("interfaces").join("agent");
    fs::create_dir_all(&dir).unwrap();
    let line = serde_json::json!({
        "path": "/api/v2/apmtelemetry",
        "request": {"content": {"api_version": "v2", "request_type": "app-started"}},
        "response": {"status_code": 202}
    });
    fs::write(dir.join("00001.log"), format!("{}\n{}\n", line, line)).unwrap();

    let mut store = RecordStore::for_log_folder(tmp.path(), Source::Agent);
    store.load_data_from_logs().unwrap();
    let records = store.drain();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].kind, RecordKind::Request);
    assert_eq!(records[1].kind, RecordKind::Response);
    assert_eq!(records[0].exchange, records[1].exchange);
    assert_ne!(records[1].exchange, records[2].exchange);
    assert!(records.iter().all(|r| r.source == Source::Agent));
}
