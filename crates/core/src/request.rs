use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

/// Length of a generated request id.
pub const REQUEST_ID_LEN: usize = 36;

const COUNTER_DIGITS: usize = 10;
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(0);

/// Generate a request id unique for the lifetime of this process.
///
/// The id is a zero-padded process-wide counter followed by random
/// upper-case alphanumerics; the counter alone guarantees uniqueness, the
/// suffix keeps ids from different processes apart.
pub fn new_request_id() -> String {
    let n = NEXT_REQUEST.fetch_add(1, Ordering::Relaxed);
    let mut id = format!("{:0width$}", n, width = COUNTER_DIGITS);
    let mut rng = rand::thread_rng();
    while id.len() < REQUEST_ID_LEN {
        let i = rng.gen_range(0..ID_ALPHABET.len());
        id.push(ID_ALPHABET[i] as char);
    }
    id
}

/// What the weblog answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeblogResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    /// Transport error, when no HTTP response came back at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An outbound call made by a test body.
///
/// `id` is the only key tying the call to the records it caused downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<WeblogResponse>,
}

impl LogicalRequest {
    /// A request with a fresh id, issued now, with no response yet.
    pub fn new(method: &str, path: &str) -> Self {
        LogicalRequest::with_id(&new_request_id(), method, path)
    }

    /// A request carrying an id assigned elsewhere (a recorded run, a test).
    pub fn with_id(id: &str, method: &str, path: &str) -> Self {
        LogicalRequest {
            id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            issued_at: OffsetDateTime::now_utc(),
            completed_at: None,
            response: None,
        }
    }

    pub fn complete(mut self, response: WeblogResponse) -> Self {
        self.completed_at = Some(OffsetDateTime::now_utc());
        self.response = Some(response);
        self
    }

    pub fn status_code(&self) -> Option<u16> {
        self.response.as_ref().and_then(|r| r.status_code)
    }

    /// The `[issued, completed]` window in nanoseconds since the epoch, when
    /// the call completed.
    pub fn window_nanos(&self) -> Option<(i128, i128)> {
        let completed = self.completed_at?;
        Some((
            self.issued_at.unix_timestamp_nanos(),
            completed.unix_timestamp_nanos(),
        ))
    }
}
