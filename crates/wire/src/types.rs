//! Typed structs for the wire formats the harness inspects.
//!
//! Spans keep a copy of the value they were decoded from so failure
//! diagnostics can show exactly what the library sent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header carrying the request id on calls made by the test client.
pub const REQUEST_ID_HEADER: &str = "x-test-request-id";

/// Marker prefix embedded in the `User-Agent` of calls made by the test client.
pub const USER_AGENT_RID_PREFIX: &str = "rid/";

/// Span meta keys that may carry the request id, in lookup order.
pub const RID_META_KEYS: &[&str] = &[
    "http.request.headers.user-agent",
    "http.useragent",
    "grpc.metadata.user-agent",
];

/// The trace payload family an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceFormat {
    /// Library to agent, msgpack v0.4 (array of traces of span maps).
    LibraryV04,
    /// Library to agent, msgpack v0.5 (string table + span arrays).
    LibraryV05,
    /// Agent to backend, protobuf `AgentPayload` decoded to JSON.
    AgentV02,
}

impl TraceFormat {
    /// Select the trace format served on `path`, if any.
    pub fn for_endpoint(path: &str) -> Option<TraceFormat> {
        match path {
            "/v0.4/traces" => Some(TraceFormat::LibraryV04),
            "/v0.5/traces" => Some(TraceFormat::LibraryV05),
            "/api/v0.2/traces" => Some(TraceFormat::AgentV02),
            _ => None,
        }
    }
}

/// A span decoded from any supported trace payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: u64,
    pub span_id: u64,
    /// `None` for root spans (parent id absent or zero).
    pub parent_id: Option<u64>,
    pub service: String,
    pub name: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_type: Option<String>,
    pub start: i64,
    pub duration: i64,
    pub error: i64,
    pub meta: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    /// The value this span was decoded from.
    pub raw: serde_json::Value,
}

impl Span {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Request id carried by this span, if any.
    pub fn request_id(&self) -> Option<&str> {
        crate::deserialize::rid_from_span(self)
    }
}

/// The envelope fields every telemetry message shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryHeader {
    pub api_version: String,
    pub request_type: String,
    pub seq_id: Option<u64>,
    pub runtime_id: Option<String>,
    pub tracer_time: Option<i64>,
}
