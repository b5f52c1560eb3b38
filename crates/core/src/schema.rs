//! Wire-format schema checks.
//!
//! The schema applied to a record is chosen from what the record says about
//! itself: its endpoint, and for telemetry its declared `api_version`. A
//! payload that claims a format no schema exists for is a violation, never a
//! silent skip.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

use tracecheck_store::{Decoded, Record, Source};
use tracecheck_wire::TraceFormat;
use tracing::{debug, warn};

use crate::error::EngineError;

const SCHEMAS: &[(&str, &str)] = &[
    (
        "library/v0.4-traces",
        include_str!("../schemas/library/v0.4-traces.json"),
    ),
    (
        "library/v0.5-traces",
        include_str!("../schemas/library/v0.5-traces.json"),
    ),
    (
        "library/v0.1-pipeline-stats",
        include_str!("../schemas/library/v0.1-pipeline-stats.json"),
    ),
    (
        "agent/v0.2-traces",
        include_str!("../schemas/agent/v0.2-traces.json"),
    ),
    ("telemetry/v1", include_str!("../schemas/telemetry/v1.json")),
    ("telemetry/v2", include_str!("../schemas/telemetry/v2.json")),
];

/// Telemetry endpoint on the library side (proxied by the agent).
pub const LIBRARY_TELEMETRY_PATH: &str = "/telemetry/proxy/api/v2/apmtelemetry";
/// Telemetry endpoint on the agent side (forwarded to the backend).
pub const AGENT_TELEMETRY_PATH: &str = "/api/v2/apmtelemetry";

const PIPELINE_STATS_PATH: &str = "/v0.1/pipeline_stats";
const TELEMETRY_VERSIONS: &[&str] = &["v1", "v2"];

/// Which schema, if any, governs a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Schema(&'static str),
    /// The record claims a format no schema covers.
    Unsupported(String),
    /// Not a schema-governed message.
    Skip,
}

/// One payload that did not match its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    pub source: Source,
    pub path: String,
    pub seq: u64,
    /// Schema name, or `"unsupported"` when none applied.
    pub schema: String,
    /// JSON pointer into the payload.
    pub pointer: String,
    pub message: String,
    /// `<path>#<pointer>` with array indices replaced by `*`, stable across
    /// runs; the allow-list matches on it.
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Violations split by whether the allow-list tolerates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaReport {
    pub checked: usize,
    pub violations: Vec<SchemaViolation>,
    pub tolerated: Vec<SchemaViolation>,
}

/// Compiled schemas for every supported wire format.
pub struct SchemaValidator {
    compiled: HashMap<&'static str, jsonschema::Validator>,
}

impl SchemaValidator {
    pub fn new() -> Result<Self, EngineError> {
        let mut compiled = HashMap::new();
        for (name, text) in SCHEMAS {
            let schema: serde_json::Value =
                serde_json::from_str(text).map_err(|e| EngineError::Schema {
                    name: name.to_string(),
                    message: e.to_string(),
                })?;
            let validator = jsonschema::validator_for(&schema).map_err(|e| EngineError::Schema {
                name: name.to_string(),
                message: e.to_string(),
            })?;
            compiled.insert(*name, validator);
        }
        Ok(SchemaValidator { compiled })
    }

    pub fn schema_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.compiled.keys().copied().collect();
        names.sort();
        names
    }

    /// Check every request record; `allowed_errors` holds violation keys to
    /// tolerate.
    pub fn validate(&self, records: &[Record], allowed_errors: &[String]) -> SchemaReport {
        let mut report = SchemaReport::default();
        for record in records.iter().filter(|r| r.is_request()) {
            let Some(found) = self.validate_record(record) else {
                continue;
            };
            report.checked += 1;
            for violation in found {
                if allowed_errors.iter().any(|k| *k == violation.key) {
                    debug!(key = %violation.key, seq = violation.seq, "tolerated schema error");
                    report.tolerated.push(violation);
                } else {
                    warn!(
                        source = %violation.source,
                        key = %violation.key,
                        message = %violation.message,
                        "schema violation"
                    );
                    report.violations.push(violation);
                }
            }
        }
        report
    }

    /// `None` when no schema governs the record.
    pub fn validate_record(&self, record: &Record) -> Option<Vec<SchemaViolation>> {
        let payload = match &record.payload.decoded {
            Decoded::Json(value) => Some(value),
            _ => None,
        };
        let selection = select(record.source, &record.path, payload);
        let name = match selection {
            Selection::Skip => return None,
            Selection::Unsupported(message) => {
                return Some(vec![violation(record, "unsupported", "", message)]);
            }
            Selection::Schema(name) => name,
        };

        let Some(payload) = payload else {
            let message = match record.payload.decoded {
                Decoded::Empty => "payload is empty".to_string(),
                _ => "payload could not be decoded".to_string(),
            };
            return Some(vec![violation(record, name, "", message)]);
        };
        let Some(validator) = self.compiled.get(name) else {
            return Some(vec![violation(
                record,
                name,
                "",
                format!("schema '{}' is not compiled", name),
            )]);
        };

        Some(
            validator
                .iter_errors(payload)
                .map(|e| violation(record, name, &e.instance_path().to_string(), e.to_string()))
                .collect(),
        )
    }
}

fn violation(record: &Record, schema: &str, pointer: &str, message: String) -> SchemaViolation {
    SchemaViolation {
        source: record.source,
        path: record.path.clone(),
        seq: record.seq,
        schema: schema.to_string(),
        pointer: pointer.to_string(),
        message,
        key: error_key(&record.path, pointer),
        log_file: record.log_file.clone(),
    }
}

/// `/v0.4/traces` + `/0/3/meta/x` -> `/v0.4/traces#/*/*/meta/x`
pub fn error_key(path: &str, pointer: &str) -> String {
    let generalized: Vec<&str> = pointer
        .split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                "*"
            } else {
                segment
            }
        })
        .collect();
    format!("{}#{}", path, generalized.join("/"))
}

/// Pick the schema for a message from its source, endpoint and content.
pub fn select(source: Source, path: &str, payload: Option<&serde_json::Value>) -> Selection {
    match source {
        Source::Library | Source::Buddy(_) => select_library(path, payload),
        Source::Agent => select_agent(path, payload),
        Source::Backend | Source::OpenTelemetry => Selection::Skip,
    }
}

fn select_library(path: &str, payload: Option<&serde_json::Value>) -> Selection {
    match TraceFormat::for_endpoint(path) {
        Some(TraceFormat::LibraryV04) => return Selection::Schema("library/v0.4-traces"),
        Some(TraceFormat::LibraryV05) => return Selection::Schema("library/v0.5-traces"),
        _ => {}
    }
    if let Some(version) = trace_endpoint_version(path) {
        return Selection::Unsupported(format!(
            "trace payload version '{}' has no schema",
            version
        ));
    }
    if path == PIPELINE_STATS_PATH {
        return Selection::Schema("library/v0.1-pipeline-stats");
    }
    if path == LIBRARY_TELEMETRY_PATH {
        return select_telemetry(payload);
    }
    Selection::Skip
}

fn select_agent(path: &str, payload: Option<&serde_json::Value>) -> Selection {
    if TraceFormat::for_endpoint(path) == Some(TraceFormat::AgentV02) {
        return Selection::Schema("agent/v0.2-traces");
    }
    if path == AGENT_TELEMETRY_PATH {
        return select_telemetry(payload);
    }
    Selection::Skip
}

fn select_telemetry(payload: Option<&serde_json::Value>) -> Selection {
    let Some(payload) = payload else {
        // Undecodable: the schema step reports it.
        return Selection::Schema("telemetry/v2");
    };
    match payload.get("api_version").and_then(|v| v.as_str()) {
        Some("v1") => Selection::Schema("telemetry/v1"),
        Some("v2") => Selection::Schema("telemetry/v2"),
        Some(other) => Selection::Unsupported(format!(
            "telemetry api_version '{}' is not one of {:?}",
            other, TELEMETRY_VERSIONS
        )),
        None => Selection::Unsupported("telemetry message declares no api_version".to_string()),
    }
}

/// `/v0.7/traces` -> `v0.7`
fn trace_endpoint_version(path: &str) -> Option<&str> {
    let version = path.strip_prefix('/')?.strip_suffix("/traces")?;
    let numbers = version.strip_prefix('v')?;
    let (major, minor) = numbers.split_once('.')?;
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if numeric(major) && numeric(minor) {
        Some(version)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_generalize_array_indices() {
        assert_eq!(
            error_key("/v0.4/traces", "/0/12/meta/http.status_code"),
            "/v0.4/traces#/*/*/meta/http.status_code"
        );
        assert_eq!(error_key("/v0.4/traces", ""), "/v0.4/traces#");
    }

    #[test]
    fn selection_follows_endpoint_and_declared_version() {
        assert_eq!(
            select(Source::Library, "/v0.4/traces", None),
            Selection::Schema("library/v0.4-traces")
        );
        assert!(matches!(
            select(Source::Library, "/v0.7/traces", None),
            Selection::Unsupported(_)
        ));
        assert_eq!(
            select(Source::Agent, "/api/v0.2/traces", None),
            Selection::Schema("agent/v0.2-traces")
        );
        let v1 = json!({"api_version": "v1"});
        assert_eq!(
            select(Source::Library, LIBRARY_TELEMETRY_PATH, Some(&v1)),
            Selection::Schema("telemetry/v1")
        );
        let v3 = json!({"api_version": "v3"});
        assert!(matches!(
            select(Source::Agent, AGENT_TELEMETRY_PATH, Some(&v3)),
            Selection::Unsupported(_)
        ));
        assert_eq!(select(Source::Library, "/info", None), Selection::Skip);
        assert_eq!(select(Source::Backend, "/v0.4/traces", None), Selection::Skip);
    }

    #[test]
    fn every_embedded_schema_compiles() {
        let validator = SchemaValidator::new().unwrap();
        assert_eq!(validator.schema_names().len(), SCHEMAS.len());
    }

    #[test]
    fn raw_payload_on_a_governed_endpoint_is_a_violation() {
        let validator = SchemaValidator::new().unwrap();
        let mut record = Record::request(Source::Library, "/v0.4/traces", json!(null));
        record.payload = tracecheck_store::Payload::raw(vec![0x91]);
        let found = validator.validate_record(&record).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].message.contains("could not be decoded"));
    }

    #[test]
    fn responses_and_ungoverned_paths_are_not_checked() {
        let validator = SchemaValidator::new().unwrap();
        let records = vec![
            Record::response(Source::Library, "/v0.4/traces", 200, json!({"rate_by_service": {}})),
            Record::request(Source::Library, "/info", json!({})),
        ];
        let report = validator.validate(&records, &[]);
        assert_eq!(report.checked, 0);
        assert!(report.violations.is_empty());
    }
}
