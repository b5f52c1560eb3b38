use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;
use tracecheck_wire::{rid_from_user_agent, REQUEST_ID_HEADER};

/// The logical producer of a captured exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Source {
    /// Traffic from the instrumented weblog to the agent.
    Library,
    /// Traffic from the agent to the backend.
    Agent,
    /// Queries made against the backend API.
    Backend,
    /// OTLP traffic sent directly by an OpenTelemetry SDK.
    OpenTelemetry,
    /// Traffic from the n-th auxiliary weblog.
    Buddy(u8),
}

impl Source {
    /// Folder name under `<log_folder>/interfaces/`.
    pub fn dir_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Library => write!(f, "library"),
            Source::Agent => write!(f, "agent"),
            Source::Backend => write!(f, "backend"),
            Source::OpenTelemetry => write!(f, "open_telemetry"),
            Source::Buddy(n) => write!(f, "buddy{}", n),
        }
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "library" => Ok(Source::Library),
            "agent" => Ok(Source::Agent),
            "backend" => Ok(Source::Backend),
            "open_telemetry" => Ok(Source::OpenTelemetry),
            other => other
                .strip_prefix("buddy")
                .and_then(|n| n.parse::<u8>().ok())
                .map(Source::Buddy)
                .ok_or_else(|| format!("unknown source '{}'", other)),
        }
    }
}

impl From<Source> for String {
    fn from(source: Source) -> String {
        source.to_string()
    }
}

impl TryFrom<String> for Source {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Which half of an HTTP exchange a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Request,
    Response,
}

/// Best-effort structured form of a payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "format", content = "value", rename_all = "lowercase")]
pub enum Decoded {
    Empty,
    Json(serde_json::Value),
    /// Bytes the store could not decode (msgpack, protobuf, binary bodies).
    Raw,
}

/// Body of a captured message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    #[serde(skip)]
    pub raw: Vec<u8>,
    pub decoded: Decoded,
}

impl Payload {
    pub fn empty() -> Self {
        Payload {
            raw: Vec::new(),
            decoded: Decoded::Empty,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        let raw = serde_json::to_vec(&value).unwrap_or_default();
        Payload {
            raw,
            decoded: Decoded::Json(value),
        }
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        Payload {
            raw: bytes,
            decoded: Decoded::Raw,
        }
    }
}

/// One intercepted network event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Arrival order within the owning store.
    pub seq: u64,
    /// Shared by the request and response records of one exchange.
    pub exchange: u64,
    pub source: Source,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kind: RecordKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub payload: Payload,
    /// Correlation key taken from the request-id header or user agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Record {
    /// A request record with a JSON body, for in-memory feeding.
    pub fn request(source: Source, path: &str, content: serde_json::Value) -> Self {
        Record {
            seq: 0,
            exchange: 0,
            source,
            timestamp: OffsetDateTime::now_utc(),
            kind: RecordKind::Request,
            method: None,
            path: path.to_string(),
            host: None,
            status_code: None,
            headers: Vec::new(),
            payload: Payload::json(content),
            request_id: None,
            log_file: None,
        }
    }

    /// A response record with a JSON body, for in-memory feeding.
    pub fn response(source: Source, path: &str, status_code: u16, content: serde_json::Value) -> Self {
        Record {
            kind: RecordKind::Response,
            status_code: Some(status_code),
            ..Record::request(source, path, content)
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self.request_id = request_id_from_headers(&self.headers);
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        match &self.payload.decoded {
            Decoded::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == RecordKind::Request
    }
}

/// Request id carried by a message's headers, if any.
pub(crate) fn request_id_from_headers(headers: &[(String, String)]) -> Option<String> {
    let explicit = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(REQUEST_ID_HEADER))
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty());
    explicit.or_else(|| {
        headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
            .find_map(|(_, v)| rid_from_user_agent(v).map(|s| s.to_string()))
    })
}
