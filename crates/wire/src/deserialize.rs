//! Decoding of structured payloads into typed spans and telemetry headers.
//!
//! The main entry point is [`decode_spans`], which takes the payload of a
//! trace endpoint and the [`TraceFormat`] it speaks.

use crate::types::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Errors while decoding a wire payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A container that must be an array was something else.
    NotAnArray { context: String },
    /// A required field is absent or has the wrong type.
    MissingField { context: String, field: String },
    /// A span could not be decoded.
    InvalidSpan { index: usize, message: String },
    /// A v0.5 string-table index points outside the table.
    StringIndex { index: u64, table_len: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::NotAnArray { context } => write!(f, "{} should be an array", context),
            WireError::MissingField { context, field } => {
                write!(f, "{}: missing or invalid '{}'", context, field)
            }
            WireError::InvalidSpan { index, message } => {
                write!(f, "span #{}: {}", index, message)
            }
            WireError::StringIndex { index, table_len } => write!(
                f,
                "string index {} out of range for table of {} entries",
                index, table_len
            ),
        }
    }
}

impl std::error::Error for WireError {}

/// Decode every span of a trace payload, in payload order.
pub fn decode_spans(format: TraceFormat, payload: &Value) -> Result<Vec<Span>, WireError> {
    match format {
        TraceFormat::LibraryV04 => decode_v04(payload),
        TraceFormat::LibraryV05 => decode_v05(payload),
        TraceFormat::AgentV02 => decode_agent_v02(payload),
    }
}

/// Reinterpret a signed 64-bit id as unsigned.
///
/// Languages without unsigned integers send ids above `i64::MAX` as negative
/// numbers; the agent reads the same bits as unsigned.
pub fn normalize_id(value: i64) -> u64 {
    value as u64
}

/// Extract a request id from a `User-Agent` value (`... rid/<ID> ...`).
///
/// The marker must start a token, and the id is a run of upper-case letters
/// and digits ending at a non-alphanumeric character or the end of the
/// value. Occurrences that do not fit (`hybrid/2.0`) are skipped.
pub fn rid_from_user_agent(user_agent: &str) -> Option<&str> {
    user_agent
        .match_indices(USER_AGENT_RID_PREFIX)
        .find_map(|(at, marker)| {
            let starts_token = user_agent[..at]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_ascii_alphanumeric());
            if !starts_token {
                return None;
            }
            let rest = &user_agent[at + marker.len()..];
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(rest.len());
            let id = &rest[..end];
            let well_formed = !id.is_empty()
                && id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
            well_formed.then_some(id)
        })
}

/// Request id carried by a span: the explicit header tag wins, then any
/// user-agent style tag.
pub fn rid_from_span(span: &Span) -> Option<&str> {
    let header_key = format!("http.request.headers.{}", REQUEST_ID_HEADER);
    if let Some(rid) = span.meta.get(&header_key) {
        if !rid.is_empty() {
            return Some(rid.as_str());
        }
    }
    RID_META_KEYS
        .iter()
        .filter_map(|key| span.meta.get(*key))
        .find_map(|ua| rid_from_user_agent(ua))
}

/// Read the shared envelope of a telemetry message.
pub fn telemetry_header(payload: &Value) -> Result<TelemetryHeader, WireError> {
    let context = "telemetry message".to_string();
    let api_version = payload
        .get("api_version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WireError::MissingField {
            context: context.clone(),
            field: "api_version".to_string(),
        })?
        .to_string();
    let request_type = payload
        .get("request_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WireError::MissingField {
            context,
            field: "request_type".to_string(),
        })?
        .to_string();

    Ok(TelemetryHeader {
        api_version,
        request_type,
        seq_id: payload.get("seq_id").and_then(as_u64_lenient),
        runtime_id: payload
            .get("runtime_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        tracer_time: payload.get("tracer_time").and_then(as_i64_lenient),
    })
}

// ── v0.4 ────────────────────────────────────────────────────────────

fn decode_v04(payload: &Value) -> Result<Vec<Span>, WireError> {
    let traces = payload.as_array().ok_or_else(|| WireError::NotAnArray {
        context: "traces".to_string(),
    })?;

    let mut spans = Vec::new();
    for trace in traces {
        let trace_spans = trace.as_array().ok_or_else(|| WireError::NotAnArray {
            context: "trace".to_string(),
        })?;
        for obj in trace_spans {
            let index = spans.len();
            spans.push(parse_span_object(obj, index, &SNAKE_KEYS)?);
        }
    }
    Ok(spans)
}

// ── v0.5 ────────────────────────────────────────────────────────────

fn decode_v05(payload: &Value) -> Result<Vec<Span>, WireError> {
    let parts = payload.as_array().ok_or_else(|| WireError::NotAnArray {
        context: "v0.5 payload".to_string(),
    })?;
    if parts.len() != 2 {
        return Err(WireError::MissingField {
            context: "v0.5 payload".to_string(),
            field: "[strings, traces]".to_string(),
        });
    }
    let strings: Vec<&str> = parts[0]
        .as_array()
        .ok_or_else(|| WireError::NotAnArray {
            context: "string table".to_string(),
        })?
        .iter()
        .map(|s| s.as_str().unwrap_or(""))
        .collect();
    let traces = parts[1].as_array().ok_or_else(|| WireError::NotAnArray {
        context: "traces".to_string(),
    })?;

    let lookup = |idx: &Value| -> Result<String, WireError> {
        let i = as_u64_lenient(idx).ok_or_else(|| WireError::MissingField {
            context: "v0.5 span".to_string(),
            field: "string index".to_string(),
        })?;
        strings
            .get(i as usize)
            .map(|s| s.to_string())
            .ok_or(WireError::StringIndex {
                index: i,
                table_len: strings.len(),
            })
    };

    let mut spans = Vec::new();
    for trace in traces {
        let trace_spans = trace.as_array().ok_or_else(|| WireError::NotAnArray {
            context: "trace".to_string(),
        })?;
        for item in trace_spans {
            let index = spans.len();
            let fields = item.as_array().filter(|a| a.len() == 12).ok_or_else(|| {
                WireError::InvalidSpan {
                    index,
                    message: "v0.5 span must be an array of 12 fields".to_string(),
                }
            })?;

            let mut meta = BTreeMap::new();
            if let Some(map) = fields[9].as_object() {
                for (k, v) in map {
                    let key_idx = Value::from(k.parse::<u64>().unwrap_or(u64::MAX));
                    meta.insert(lookup(&key_idx)?, lookup(v)?);
                }
            }
            let mut metrics = BTreeMap::new();
            if let Some(map) = fields[10].as_object() {
                for (k, v) in map {
                    let key_idx = Value::from(k.parse::<u64>().unwrap_or(u64::MAX));
                    metrics.insert(lookup(&key_idx)?, v.as_f64().unwrap_or_default());
                }
            }

            let span_type = lookup(&fields[11])?;
            spans.push(Span {
                service: lookup(&fields[0])?,
                name: lookup(&fields[1])?,
                resource: lookup(&fields[2])?,
                trace_id: parse_id(&fields[3]).ok_or_else(|| invalid(index, "trace_id"))?,
                span_id: parse_id(&fields[4]).ok_or_else(|| invalid(index, "span_id"))?,
                parent_id: parse_id(&fields[5]).filter(|id| *id != 0),
                start: as_i64_lenient(&fields[6]).unwrap_or_default(),
                duration: as_i64_lenient(&fields[7]).unwrap_or_default(),
                error: as_i64_lenient(&fields[8]).unwrap_or_default(),
                meta,
                metrics,
                span_type: if span_type.is_empty() {
                    None
                } else {
                    Some(span_type)
                },
                raw: item.clone(),
            });
        }
    }
    Ok(spans)
}

// ── agent v0.2 ──────────────────────────────────────────────────────

fn decode_agent_v02(payload: &Value) -> Result<Vec<Span>, WireError> {
    let tracer_payloads = match payload.get("tracerPayloads") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(v) => v.as_array().ok_or_else(|| WireError::NotAnArray {
            context: "tracerPayloads".to_string(),
        })?,
    };

    let mut spans = Vec::new();
    for tracer_payload in tracer_payloads {
        let chunks = tracer_payload
            .get("chunks")
            .and_then(|c| c.as_array())
            .map(|c| c.as_slice())
            .unwrap_or_default();
        for chunk in chunks {
            let chunk_spans = chunk
                .get("spans")
                .and_then(|s| s.as_array())
                .map(|s| s.as_slice())
                .unwrap_or_default();
            for obj in chunk_spans {
                let index = spans.len();
                spans.push(parse_span_object(obj, index, &CAMEL_KEYS)?);
            }
        }
    }
    Ok(spans)
}

// ── Parsing helpers ─────────────────────────────────────────────────

struct IdKeys {
    trace_id: &'static str,
    span_id: &'static str,
    parent_id: &'static str,
}

const SNAKE_KEYS: IdKeys = IdKeys {
    trace_id: "trace_id",
    span_id: "span_id",
    parent_id: "parent_id",
};

const CAMEL_KEYS: IdKeys = IdKeys {
    trace_id: "traceID",
    span_id: "spanID",
    parent_id: "parentID",
};

fn parse_span_object(obj: &Value, index: usize, keys: &IdKeys) -> Result<Span, WireError> {
    if !obj.is_object() {
        return Err(WireError::InvalidSpan {
            index,
            message: "span should be an object".to_string(),
        });
    }

    let trace_id = obj
        .get(keys.trace_id)
        .and_then(parse_id)
        .ok_or_else(|| invalid(index, keys.trace_id))?;
    let span_id = obj
        .get(keys.span_id)
        .and_then(parse_id)
        .ok_or_else(|| invalid(index, keys.span_id))?;
    let parent_id = obj
        .get(keys.parent_id)
        .and_then(parse_id)
        .filter(|id| *id != 0);

    let meta = obj
        .get("meta")
        .and_then(|m| m.as_object())
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let s = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default();

    let metrics = obj
        .get("metrics")
        .and_then(|m| m.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect()
        })
        .unwrap_or_default();

    Ok(Span {
        trace_id,
        span_id,
        parent_id,
        service: str_field(obj, "service"),
        name: str_field(obj, "name"),
        resource: str_field(obj, "resource"),
        span_type: obj
            .get("type")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        start: obj.get("start").and_then(as_i64_lenient).unwrap_or_default(),
        duration: obj
            .get("duration")
            .and_then(as_i64_lenient)
            .unwrap_or_default(),
        error: obj.get("error").and_then(as_i64_lenient).unwrap_or_default(),
        meta,
        metrics,
        raw: obj.clone(),
    })
}

fn invalid(index: usize, field: &str) -> WireError {
    WireError::InvalidSpan {
        index,
        message: format!("missing or invalid '{}'", field),
    }
}

fn str_field(obj: &Value, field: &str) -> String {
    obj.get(field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Ids arrive as unsigned numbers, negative numbers, or decimal strings.
fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_i64().map(normalize_id)),
        Value::String(s) => s
            .parse::<u64>()
            .ok()
            .or_else(|| s.parse::<i64>().ok().map(normalize_id)),
        _ => None,
    }
}

fn as_u64_lenient(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_i64_lenient(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v04_span(trace_id: i64, span_id: u64, parent_id: u64, ua: &str) -> Value {
        json!({
            "trace_id": trace_id,
            "span_id": span_id,
            "parent_id": parent_id,
            "service": "weblog",
            "name": "http.request",
            "resource": "GET /",
            "type": "web",
            "start": 1_700_000_000_000_000_000i64,
            "duration": 1200,
            "error": 0,
            "meta": { "http.useragent": ua, "http.status_code": "200" },
            "metrics": { "_sampling_priority_v1": 1 }
        })
    }

    #[test]
    fn test_v04_flattens_traces_in_order() {
        let payload = json!([
            [v04_span(1, 10, 0, "rid/AAA"), v04_span(1, 11, 10, "x")],
            [v04_span(2, 20, 0, "rid/BBB")]
        ]);
        let spans = decode_spans(TraceFormat::LibraryV04, &payload).unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].span_id, 10);
        assert!(spans[0].is_root());
        assert_eq!(spans[1].parent_id, Some(10));
        assert_eq!(spans[2].trace_id, 2);
        assert_eq!(spans[0].span_type.as_deref(), Some("web"));
        assert_eq!(spans[0].metrics.get("_sampling_priority_v1"), Some(&1.0));
    }

    #[test]
    fn test_v04_rejects_non_array() {
        let result = decode_spans(TraceFormat::LibraryV04, &json!({"traces": []}));
        match result.unwrap_err() {
            WireError::NotAnArray { context } => assert_eq!(context, "traces"),
            other => panic!("expected NotAnArray, got {:?}", other),
        }
    }

    #[test]
    fn test_v04_span_without_span_id_is_invalid() {
        let payload = json!([[{"trace_id": 1, "name": "x"}]]);
        match decode_spans(TraceFormat::LibraryV04, &payload).unwrap_err() {
            WireError::InvalidSpan { index, message } => {
                assert_eq!(index, 0);
                assert!(message.contains("span_id"));
            }
            other => panic!("expected InvalidSpan, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_ids_are_reinterpreted_as_unsigned() {
        let payload = json!([[v04_span(-1, 5, 0, "")]]);
        let spans = decode_spans(TraceFormat::LibraryV04, &payload).unwrap();
        assert_eq!(spans[0].trace_id, u64::MAX);
        assert_eq!(normalize_id(i64::MIN), 1u64 << 63);
    }

    #[test]
    fn test_v05_string_table() {
        let payload = json!([
            ["", "weblog", "http.request", "GET /", "web", "http.useragent", "tracecheck rid/ABC123"],
            [[[1, 2, 3, 42, 7, 0, 100, 5, 0, {"5": 6}, {}, 4]]]
        ]);
        let spans = decode_spans(TraceFormat::LibraryV05, &payload).unwrap();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.service, "weblog");
        assert_eq!(span.resource, "GET /");
        assert_eq!(span.trace_id, 42);
        assert!(span.is_root());
        assert_eq!(span.request_id(), Some("ABC123"));
    }

    #[test]
    fn test_v05_out_of_range_string_index() {
        let payload = json!([["a"], [[[9, 0, 0, 1, 1, 0, 0, 0, 0, {}, {}, 0]]]]);
        match decode_spans(TraceFormat::LibraryV05, &payload).unwrap_err() {
            WireError::StringIndex { index, table_len } => {
                assert_eq!(index, 9);
                assert_eq!(table_len, 1);
            }
            other => panic!("expected StringIndex, got {:?}", other),
        }
    }

    #[test]
    fn test_agent_payload_with_string_ids() {
        let payload = json!({
            "tracerPayloads": [{
                "chunks": [{
                    "spans": [{
                        "traceID": "18446744073709551615",
                        "spanID": "3",
                        "parentID": "0",
                        "service": "weblog",
                        "name": "http.request",
                        "resource": "GET /",
                        "start": "1700000000000000000",
                        "duration": "10",
                        "meta": {"http.request.headers.x-test-request-id": "RID1"}
                    }]
                }]
            }]
        });
        let spans = decode_spans(TraceFormat::AgentV02, &payload).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].trace_id, u64::MAX);
        assert_eq!(spans[0].start, 1_700_000_000_000_000_000);
        assert_eq!(spans[0].request_id(), Some("RID1"));
    }

    #[test]
    fn test_agent_payload_without_tracer_payloads_is_empty() {
        let spans = decode_spans(TraceFormat::AgentV02, &json!({"hostName": "x"})).unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn test_rid_from_user_agent() {
        assert_eq!(
            rid_from_user_agent("tracecheck rid/ABCDEF0123"),
            Some("ABCDEF0123")
        );
        assert_eq!(rid_from_user_agent("rid/XYZ; extra"), Some("XYZ"));
        assert_eq!(rid_from_user_agent("rid/"), None);
        assert_eq!(rid_from_user_agent("curl/8.0"), None);
        assert_eq!(
            rid_from_user_agent("Mozilla/5.0 hybrid/2.0 tracecheck rid/ABCDEF"),
            Some("ABCDEF")
        );
        assert_eq!(rid_from_user_agent("agent rid/lower rid/UPPER9"), Some("UPPER9"));
        assert_eq!(rid_from_user_agent("android/14 grid/3"), None);
    }

    #[test]
    fn test_telemetry_header() {
        let header = telemetry_header(&json!({
            "api_version": "v2",
            "request_type": "app-started",
            "seq_id": 1,
            "runtime_id": "abc",
            "tracer_time": 1700000000
        }))
        .unwrap();
        assert_eq!(header.api_version, "v2");
        assert_eq!(header.seq_id, Some(1));
        assert_eq!(header.runtime_id.as_deref(), Some("abc"));

        match telemetry_header(&json!({"request_type": "app-started"})).unwrap_err() {
            WireError::MissingField { field, .. } => assert_eq!(field, "api_version"),
            other => panic!("expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn test_trace_format_for_endpoint() {
        assert_eq!(
            TraceFormat::for_endpoint("/v0.4/traces"),
            Some(TraceFormat::LibraryV04)
        );
        assert_eq!(
            TraceFormat::for_endpoint("/api/v0.2/traces"),
            Some(TraceFormat::AgentV02)
        );
        assert_eq!(TraceFormat::for_endpoint("/info"), None);
    }
}
