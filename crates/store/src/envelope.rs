//! On-disk envelope written by the proxy for every intercepted exchange.
//!
//! ```json
//! {
//!   "source": "library",
//!   "timestamp": "2024-05-01T10:00:00.123Z",
//!   "path": "/v0.4/traces",
//!   "host": "agent:8126",
//!   "request": { "method": "PUT", "headers": [["content-type", "application/json"]], "content": [] },
//!   "response": { "status_code": 200, "headers": [], "content": {"rate_by_service": {}} }
//! }
//! ```
//!
//! `content` holds a payload the proxy already decoded. `raw_content` holds
//! base64 bytes it could not decode.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::record::{request_id_from_headers, Decoded, Payload, Record, RecordKind, Source};

#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    pub path: String,
    #[serde(default)]
    pub host: Option<String>,
    pub request: MessageEnvelope,
    #[serde(default)]
    pub response: Option<MessageEnvelope>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub raw_content: Option<String>,
}

impl MessageEnvelope {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn payload(&self) -> Result<Payload, String> {
        if let Some(content) = &self.content {
            if !content.is_null() {
                return Ok(Payload::json(content.clone()));
            }
        }
        let Some(encoded) = &self.raw_content else {
            return Ok(Payload::empty());
        };
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| format!("raw_content is not valid base64: {}", e))?;
        if bytes.is_empty() {
            return Ok(Payload::empty());
        }
        let is_json = self
            .header("content-type")
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("application/json") || ct.contains("text/json")
            })
            .unwrap_or(false);
        if is_json {
            let value: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| format!("raw_content declared as JSON but does not parse: {}", e))?;
            return Ok(Payload {
                raw: bytes,
                decoded: Decoded::Json(value),
            });
        }
        Ok(Payload::raw(bytes))
    }
}

impl Envelope {
    /// Turn this envelope into its request record and, when a response was
    /// captured, its response record. `seq` and `exchange` are left for the
    /// store to assign.
    pub fn into_records(
        self,
        expected: Source,
        fallback_time: OffsetDateTime,
    ) -> Result<Vec<Record>, String> {
        if let Some(declared) = &self.source {
            let declared: Source = declared.parse()?;
            if declared != expected {
                return Err(format!(
                    "envelope declares source '{}' but was found in the '{}' folder",
                    declared, expected
                ));
            }
        }

        let timestamp = match &self.timestamp {
            Some(ts) => OffsetDateTime::parse(ts, &Rfc3339)
                .map_err(|e| format!("invalid timestamp '{}': {}", ts, e))?,
            None => fallback_time,
        };

        let mut records = Vec::with_capacity(2);
        let request_payload = self.request.payload()?;
        let request_id = request_id_from_headers(&self.request.headers);
        records.push(Record {
            seq: 0,
            exchange: 0,
            source: expected,
            timestamp,
            kind: RecordKind::Request,
            method: self.request.method.clone(),
            path: self.path.clone(),
            host: self.host.clone(),
            status_code: None,
            headers: self.request.headers.clone(),
            payload: request_payload,
            request_id: request_id.clone(),
            log_file: None,
        });

        if let Some(response) = &self.response {
            let status_code = response.status_code.ok_or_else(|| {
                "response is missing 'status_code'".to_string()
            })?;
            records.push(Record {
                seq: 0,
                exchange: 0,
                source: expected,
                timestamp,
                kind: RecordKind::Response,
                method: None,
                path: self.path.clone(),
                host: self.host.clone(),
                status_code: Some(status_code),
                headers: response.headers.clone(),
                payload: response.payload()?,
                // A response belongs to whoever issued the request.
                request_id,
                log_file: None,
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<Vec<Record>, String> {
        let envelope: Envelope = serde_json::from_value(value).map_err(|e| e.to_string())?;
        envelope.into_records(Source::Library, OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn request_and_response_become_two_records() {
        let records = parse(json!({
            "path": "/v0.4/traces",
            "timestamp": "2024-05-01T10:00:00Z",
            "request": {"headers": [["x-test-request-id", "RID"]], "content": []},
            "response": {"status_code": 200, "content": {"rate_by_service": {}}}
        }))
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RecordKind::Request);
        assert_eq!(records[1].status_code, Some(200));
        assert_eq!(records[1].request_id.as_deref(), Some("RID"));
        assert_eq!(records[0].timestamp.unix_timestamp(), 1_714_557_600);
    }

    #[test]
    fn raw_json_content_is_decoded() {
        let records = parse(json!({
            "path": "/info",
            "request": {
                "headers": [["Content-Type", "application/json"]],
                "raw_content": BASE64.encode(br#"{"a":1}"#)
            }
        }))
        .unwrap();
        assert_eq!(records[0].json(), Some(&json!({"a": 1})));
        assert_eq!(records[0].payload.raw, br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn raw_binary_content_stays_raw() {
        let records = parse(json!({
            "path": "/v0.4/traces",
            "request": {
                "headers": [["content-type", "application/msgpack"]],
                "raw_content": BASE64.encode([0x91u8, 0x90])
            }
        }))
        .unwrap();
        assert_eq!(records[0].payload.decoded, Decoded::Raw);
        assert_eq!(records[0].payload.raw, vec![0x91, 0x90]);
    }

    #[test]
    fn mismatched_source_is_rejected() {
        let err = parse(json!({
            "source": "agent",
            "path": "/api/v0.2/traces",
            "request": {}
        }))
        .unwrap_err();
        assert!(err.contains("'agent'"), "{}", err);
    }

    #[test]
    fn invalid_timestamp_is_rejected() {
        let err = parse(json!({
            "path": "/",
            "timestamp": "yesterday",
            "request": {}
        }))
        .unwrap_err();
        assert!(err.contains("invalid timestamp"), "{}", err);
    }

    #[test]
    fn response_without_status_is_rejected() {
        let err = parse(json!({"path": "/", "request": {}, "response": {}})).unwrap_err();
        assert!(err.contains("status_code"));
    }
}
