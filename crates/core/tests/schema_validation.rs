//! Validates the fixture payloads under tests/fixtures/ against the embedded
//! wire-format schemas: everything in valid/ must pass, everything in
//! invalid/ must be reported.

use std::path::{Path, PathBuf};

use tracecheck_core::{Record, SchemaValidator, Source};

fn load_fixture(path: &Path) -> Record {
    let src = std::fs::read_to_string(path).unwrap();
    let fixture: serde_json::Value = serde_json::from_str(&src).unwrap();
    let source: Source = fixture["source"].as_str().unwrap().parse().unwrap();
    let route = fixture["path"].as_str().unwrap();
    Record::request(source, route, fixture["payload"].clone())
}

fn collect_fixtures(dir: &str) -> Vec<PathBuf> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(dir);
    let mut paths: Vec<_> = std::fs::read_dir(&dir)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", dir.display(), e))
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |e| e == "json"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn valid_fixtures_match_their_schemas() {
    let validator = SchemaValidator::new().unwrap();
    let mut tested = 0usize;
    let mut failures = Vec::new();

    for path in collect_fixtures("valid") {
        let record = load_fixture(&path);
        match validator.validate_record(&record) {
            None => failures.push(format!("{}: no schema selected", path.display())),
            Some(violations) => {
                for v in violations {
                    failures.push(format!("{}: {} at '{}'", path.display(), v.message, v.pointer));
                }
            }
        }
        tested += 1;
    }

    assert!(tested >= 9, "expected at least 9 valid fixtures, found {}", tested);
    if !failures.is_empty() {
        panic!(
            "{} schema failure(s) in valid fixtures:\n{}",
            failures.len(),
            failures.join("\n")
        );
    }
}

#[test]
fn invalid_fixtures_are_reported() {
    let validator = SchemaValidator::new().unwrap();
    let mut tested = 0usize;
    let mut accepted = Vec::new();

    for path in collect_fixtures("invalid") {
        let record = load_fixture(&path);
        let violations = validator.validate_record(&record).unwrap_or_default();
        if violations.is_empty() {
            accepted.push(path.display().to_string());
        }
        tested += 1;
    }

    assert!(tested >= 8, "expected at least 8 invalid fixtures, found {}", tested);
    assert!(
        accepted.is_empty(),
        "invalid fixtures accepted:\n{}",
        accepted.join("\n")
    );
}

#[test]
fn unknown_versions_are_violations_not_skips() {
    let validator = SchemaValidator::new().unwrap();
    for name in ["library_unknown_trace_version.json", "telemetry_unknown_version.json"] {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures/invalid")
            .join(name);
        let violations = validator.validate_record(&load_fixture(&path)).unwrap();
        assert_eq!(violations.len(), 1, "{}", name);
        assert_eq!(violations[0].schema, "unsupported");
    }
}

#[test]
fn allow_list_tolerates_known_keys_only() {
    let validator = SchemaValidator::new().unwrap();
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/invalid/library_v04_string_status.json");
    let records = vec![load_fixture(&path)];

    let strict = validator.validate(&records, &[]);
    assert_eq!(strict.checked, 1);
    assert_eq!(strict.violations.len(), 1);
    let key = strict.violations[0].key.clone();
    assert_eq!(key, "/v0.4/traces#/*/*/meta/http.status_code");

    let lenient = validator.validate(&records, &[key]);
    assert!(lenient.violations.is_empty());
    assert_eq!(lenient.tolerated.len(), 1);

    let unrelated = validator.validate(&records, &["/v0.4/traces#/*/*/meta/other".to_string()]);
    assert_eq!(unrelated.violations.len(), 1);
}
