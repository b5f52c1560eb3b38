//! Thin HTTP client the test bodies use to drive the weblog.
//!
//! Every call carries a fresh request id in the `x-test-request-id` header
//! and in the user agent (`rid/<ID>`), so the library's spans can be traced
//! back to it. Calls are journaled to `<log_folder>/weblog/requests.jsonl`;
//! in replay mode the journal answers instead of the network.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracecheck_wire::{REQUEST_ID_HEADER, USER_AGENT_RID_PREFIX};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::request::{new_request_id, LogicalRequest, WeblogResponse};

/// Journal location relative to the log folder.
pub const JOURNAL_PATH: &str = "weblog/requests.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    test_id: String,
    index: usize,
    request: LogicalRequest,
}

enum ClientMode {
    Live {
        agent: ureq::Agent,
        journal: Option<Mutex<File>>,
    },
    Replay {
        recorded: HashMap<(String, usize), LogicalRequest>,
    },
}

pub struct WeblogClient {
    base_url: String,
    mode: ClientMode,
    /// Calls made so far, per test id.
    calls: Mutex<HashMap<String, usize>>,
}

impl WeblogClient {
    /// A client sending real requests to `base_url`, journaling them under
    /// `log_folder` when one is given.
    pub fn live(
        base_url: &str,
        log_folder: Option<&Path>,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(timeout))
            .build()
            .into();
        let journal = match log_folder {
            Some(folder) => Some(Mutex::new(open_journal(&folder.join(JOURNAL_PATH))?)),
            None => None,
        };
        Ok(WeblogClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            mode: ClientMode::Live { agent, journal },
            calls: Mutex::new(HashMap::new()),
        })
    }

    /// A client answering from the journal of a previous run.
    ///
    /// A log folder without a journal replays as a run that made no calls.
    pub fn replay(log_folder: &Path) -> Result<Self, EngineError> {
        let path = log_folder.join(JOURNAL_PATH);
        let mut recorded = HashMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| EngineError::io(&path, e))?;
            for (i, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: JournalEntry =
                    serde_json::from_str(line).map_err(|e| EngineError::Journal {
                        path: path.clone(),
                        line: i + 1,
                        message: e.to_string(),
                    })?;
                recorded.insert((entry.test_id, entry.index), entry.request);
            }
        }
        debug!(requests = recorded.len(), "loaded weblog journal");
        Ok(WeblogClient {
            base_url: String::new(),
            mode: ClientMode::Replay { recorded },
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.mode, ClientMode::Replay { .. })
    }

    pub fn get(&self, test_id: &str, path: &str) -> Result<LogicalRequest, EngineError> {
        self.send(test_id, "GET", path, None)
    }

    pub fn post(
        &self,
        test_id: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<LogicalRequest, EngineError> {
        self.send(test_id, "POST", path, Some(body))
    }

    fn send(
        &self,
        test_id: &str,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<LogicalRequest, EngineError> {
        let index = self.next_call_index(test_id);
        match &self.mode {
            ClientMode::Replay { recorded } => recorded
                .get(&(test_id.to_string(), index))
                .cloned()
                .ok_or_else(|| EngineError::ReplayMiss {
                    test_id: test_id.to_string(),
                    index,
                }),
            ClientMode::Live { agent, journal } => {
                let request = self.call(agent, method, path, body);
                if let Some(journal) = journal {
                    let entry = JournalEntry {
                        test_id: test_id.to_string(),
                        index,
                        request: request.clone(),
                    };
                    append_entry(journal, &entry)?;
                }
                Ok(request)
            }
        }
    }

    fn next_call_index(&self, test_id: &str) -> usize {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = calls.entry(test_id.to_string()).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }

    /// Issue one call. A transport failure is recorded on the response, not
    /// returned: the test may well be asserting on it.
    fn call(
        &self,
        agent: &ureq::Agent,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> LogicalRequest {
        let rid = new_request_id();
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let user_agent = format!("tracecheck {}{}", USER_AGENT_RID_PREFIX, rid);
        let request = LogicalRequest::with_id(&rid, method, path);

        let result = match body {
            Some(body) => agent
                .post(&url)
                .header(REQUEST_ID_HEADER, &rid)
                .header("User-Agent", &user_agent)
                .send_json(body),
            None => agent
                .get(&url)
                .header(REQUEST_ID_HEADER, &rid)
                .header("User-Agent", &user_agent)
                .call(),
        };

        let response = match result {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.as_str().to_string(),
                            String::from_utf8_lossy(v.as_bytes()).to_string(),
                        )
                    })
                    .collect();
                let body = response
                    .into_body()
                    .read_to_string()
                    .unwrap_or_else(|e| {
                        warn!(%url, error = %e, "could not read weblog response body");
                        String::new()
                    });
                WeblogResponse {
                    status_code: Some(status_code),
                    headers,
                    body,
                    error: None,
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "weblog request failed");
                WeblogResponse {
                    status_code: None,
                    headers: Vec::new(),
                    body: String::new(),
                    error: Some(e.to_string()),
                }
            }
        };
        debug!(rid = %request.id, %method, %path, status = ?response.status_code, "weblog call");
        request.complete(response)
    }
}

fn open_journal(path: &Path) -> Result<File, EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EngineError::io(path, e))
}

fn append_entry(journal: &Mutex<File>, entry: &JournalEntry) -> Result<(), EngineError> {
    let line = serde_json::to_string(entry).map_err(|e| EngineError::Journal {
        path: PathBuf::from(JOURNAL_PATH),
        line: entry.index + 1,
        message: e.to_string(),
    })?;
    let mut file = journal.lock().unwrap_or_else(PoisonError::into_inner);
    writeln!(file, "{}", line).map_err(|e| EngineError::io(JOURNAL_PATH, e))
}
