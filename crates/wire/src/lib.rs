//! tracecheck-wire: typed views over the payloads a tracing library sends.
//!
//! The proxy writes payloads as structured JSON. This crate turns those
//! values into typed spans and telemetry headers so the engine and its
//! validators never walk raw `serde_json::Value` trees themselves.
//!
//! Supported trace payload families:
//! - library `/v0.4/traces`: array of traces, each an array of span objects
//! - library `/v0.5/traces`: `[strings, traces]` with string-table indices
//! - agent `/api/v0.2/traces`: `tracerPayloads[].chunks[].spans[]`

pub mod deserialize;
pub mod types;

pub use deserialize::{
    decode_spans, normalize_id, rid_from_span, rid_from_user_agent, telemetry_header, WireError,
};
pub use types::*;
