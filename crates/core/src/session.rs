//! A conformance session: one scenario, one interface per traffic source,
//! and the teardown that evaluates everything the tests registered.
//!
//! Test bodies never evaluate anything. They issue weblog calls and register
//! validators through a [`TestScope`]; [`Session::finish`] waits for the data,
//! drains every queue once and returns the [`SessionReport`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracecheck_store::{DeserializationError, Record, Source, StoreError};
use tracecheck_wire::Span;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::context::ScenarioContext;
use crate::error::EngineError;
use crate::interface::{CancellationToken, EngineContext, Interface, Mode, WaitOutcome};
use crate::report::SessionReport;
use crate::request::LogicalRequest;
use crate::schema::{AGENT_TELEMETRY_PATH, LIBRARY_TELEMETRY_PATH};
use crate::validator::{CountMode, Validator, ValidatorId, ValidatorKind};
use crate::weblog::WeblogClient;

/// Reason given to validators still queued when a session is interrupted.
const INTERRUPTED: &str = "session interrupted before evaluation";

// ── Interfaces ───────────────────────────────────────────────────────

/// Every interface of a session, one per source.
pub struct Interfaces {
    pub library: Interface,
    pub agent: Interface,
    pub backend: Interface,
    pub open_telemetry: Interface,
    pub buddies: Vec<Interface>,
}

impl Interfaces {
    fn build(
        buddies: u8,
        mut make: impl FnMut(Source) -> Result<Interface, EngineError>,
    ) -> Result<Self, EngineError> {
        let library = make(Source::Library)?;
        let agent = make(Source::Agent)?;
        let backend = make(Source::Backend)?;
        let open_telemetry = make(Source::OpenTelemetry)?;
        let buddies = (0..buddies)
            .map(|n| make(Source::Buddy(n)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Interfaces {
            library,
            agent,
            backend,
            open_telemetry,
            buddies,
        })
    }

    pub fn get(&self, source: Source) -> Option<&Interface> {
        match source {
            Source::Library => Some(&self.library),
            Source::Agent => Some(&self.agent),
            Source::Backend => Some(&self.backend),
            Source::OpenTelemetry => Some(&self.open_telemetry),
            Source::Buddy(n) => self.buddies.get(usize::from(n)),
        }
    }

    /// Library, agent, backend, open_telemetry, then the buddies in order.
    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        [&self.library, &self.agent, &self.backend, &self.open_telemetry]
            .into_iter()
            .chain(self.buddies.iter())
    }

    /// The order teardown waits in: a buddy or the agent only goes quiet
    /// after the library has flushed.
    fn teardown_order(&self) -> impl Iterator<Item = &Interface> {
        std::iter::once(&self.library)
            .chain(self.buddies.iter())
            .chain([&self.agent, &self.backend, &self.open_telemetry])
    }
}

// ── Session ──────────────────────────────────────────────────────────

pub struct Session {
    engine: EngineContext,
    mode: Mode,
    log_folder: Option<PathBuf>,
    interfaces: Interfaces,
    cancel: CancellationToken,
    weblog: Option<WeblogClient>,
}

impl Session {
    /// A session fed only through `append_data`.
    pub fn in_memory(scenario: ScenarioContext, config: EngineConfig) -> Result<Self, EngineError> {
        let engine = EngineContext::new(Arc::new(scenario), config)?;
        let interfaces = Interfaces::build(engine.scenario.buddies, |source| {
            Ok(Interface::in_memory(source, engine.clone()))
        })?;
        Ok(Session::assemble(engine, Mode::InMemory, None, interfaces, None))
    }

    /// A session polling the folder a running proxy writes to.
    pub fn live(
        scenario: ScenarioContext,
        config: EngineConfig,
        log_folder: &Path,
    ) -> Result<Self, EngineError> {
        let engine = EngineContext::new(Arc::new(scenario), config)?;
        let interfaces = Interfaces::build(engine.scenario.buddies, |source| {
            Ok(Interface::live(source, log_folder, engine.clone()))
        })?;
        info!(folder = %log_folder.display(), scenario = %engine.scenario.name, "live session");
        Ok(Session::assemble(
            engine,
            Mode::Live,
            Some(log_folder.to_path_buf()),
            interfaces,
            None,
        ))
    }

    /// A session over a previous run's folder. Everything is loaded now, and
    /// weblog calls are answered from the run's journal.
    pub fn replay(
        scenario: ScenarioContext,
        config: EngineConfig,
        log_folder: &Path,
    ) -> Result<Self, EngineError> {
        if !log_folder.is_dir() {
            return Err(StoreError::FolderNotFound {
                path: log_folder.to_path_buf(),
            }
            .into());
        }
        let engine = EngineContext::new(Arc::new(scenario), config)?;
        let interfaces = Interfaces::build(engine.scenario.buddies, |source| {
            Interface::replay(source, log_folder, engine.clone())
        })?;
        let weblog = WeblogClient::replay(log_folder)?;
        info!(
            folder = %log_folder.display(),
            scenario = %engine.scenario.name,
            records = interfaces.iter().map(Interface::record_count).sum::<usize>(),
            "replay session"
        );
        Ok(Session::assemble(
            engine,
            Mode::Replay,
            Some(log_folder.to_path_buf()),
            interfaces,
            Some(weblog),
        ))
    }

    fn assemble(
        engine: EngineContext,
        mode: Mode,
        log_folder: Option<PathBuf>,
        interfaces: Interfaces,
        weblog: Option<WeblogClient>,
    ) -> Self {
        Session {
            engine,
            mode,
            log_folder,
            interfaces,
            cancel: CancellationToken::new(),
            weblog,
        }
    }

    pub fn with_weblog(mut self, weblog: WeblogClient) -> Self {
        self.weblog = Some(weblog);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn log_folder(&self) -> Option<&Path> {
        self.log_folder.as_deref()
    }

    pub fn scenario(&self) -> &ScenarioContext {
        &self.engine.scenario
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    /// A handle that interrupts `finish` from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Scope for one test: everything registered through it carries `test_id`.
    pub fn test(&self, test_id: &str) -> TestScope<'_> {
        TestScope {
            session: self,
            test_id: test_id.to_string(),
        }
    }

    /// Teardown: wait for the data, evaluate every queue once, and gather
    /// the suite-level errors.
    ///
    /// Live interfaces are waited one after the other (library, buddies,
    /// agent, backend, open_telemetry), each for its own timeout and never
    /// past the session-wide `timeout_s`. A last pass then picks up what
    /// arrived late and settles half-written entries. When the session is
    /// cancelled, queued validators are reported as not evaluated.
    pub fn finish(self) -> SessionReport {
        let config = &self.engine.config;
        let library = self.engine.scenario.library.library.as_deref();
        let session_deadline = Instant::now() + config.timeout();
        let mut waits = BTreeMap::new();
        let mut session_errors = Vec::new();

        for interface in self.interfaces.teardown_order() {
            let own = Instant::now() + config.interface_timeout(interface.source(), library);
            match interface.wait_until(own.min(session_deadline), &self.cancel) {
                Ok(outcome) => {
                    waits.insert(interface.source().to_string(), outcome);
                }
                Err(e) => {
                    warn!(interface = %interface.source(), error = %e, "wait failed");
                    session_errors.push(format!("{}: {}", interface.source(), e));
                }
            }
        }
        for interface in self.interfaces.iter() {
            if let Err(e) = interface.settle() {
                warn!(interface = %interface.source(), error = %e, "settle failed");
                session_errors.push(format!("{}: {}", interface.source(), e));
            }
        }

        let interrupted = self.cancel.is_cancelled();
        let mut results = Vec::new();
        for interface in self.interfaces.iter() {
            if interrupted {
                results.extend(interface.abandon(INTERRUPTED));
            } else {
                results.extend(interface.evaluate());
            }
        }

        let mut deserialization_errors: BTreeMap<String, Vec<DeserializationError>> = BTreeMap::new();
        for interface in self.interfaces.iter() {
            let errors = interface.deserialization_errors();
            if !errors.is_empty() {
                warn!(interface = %interface.source(), count = errors.len(), "deserialization errors");
                deserialization_errors.insert(interface.source().to_string(), errors);
            }
        }

        let report = SessionReport::new(
            &self.engine.scenario.name,
            self.mode,
            results,
            waits,
            deserialization_errors,
            session_errors,
        );
        info!(
            passed = report.passed,
            failed = report.failed,
            interrupted,
            "session finished"
        );
        report
    }
}

// ── Test scope ───────────────────────────────────────────────────────

/// What a test body sees of the session.
pub struct TestScope<'s> {
    session: &'s Session,
    test_id: String,
}

impl<'s> TestScope<'s> {
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn library(&self) -> InterfaceHandle<'_> {
        self.handle(&self.session.interfaces.library)
    }

    pub fn agent(&self) -> InterfaceHandle<'_> {
        self.handle(&self.session.interfaces.agent)
    }

    pub fn backend(&self) -> InterfaceHandle<'_> {
        self.handle(&self.session.interfaces.backend)
    }

    pub fn open_telemetry(&self) -> InterfaceHandle<'_> {
        self.handle(&self.session.interfaces.open_telemetry)
    }

    pub fn interface(&self, source: Source) -> Result<InterfaceHandle<'_>, EngineError> {
        self.session
            .interfaces
            .get(source)
            .map(|interface| self.handle(interface))
            .ok_or(EngineError::UnknownInterface(source))
    }

    fn handle<'a>(&'a self, interface: &'a Interface) -> InterfaceHandle<'a> {
        InterfaceHandle {
            interface,
            test_id: &self.test_id,
            cancel: &self.session.cancel,
        }
    }

    pub fn get(&self, path: &str) -> Result<LogicalRequest, EngineError> {
        self.weblog()?.get(&self.test_id, path)
    }

    pub fn post(&self, path: &str, body: &serde_json::Value) -> Result<LogicalRequest, EngineError> {
        self.weblog()?.post(&self.test_id, path, body)
    }

    fn weblog(&self) -> Result<&WeblogClient, EngineError> {
        self.session
            .weblog
            .as_ref()
            .ok_or_else(|| EngineError::NoWeblog(self.test_id.clone()))
    }
}

/// Registration surface of one interface, bound to one test.
///
/// Every `assert_*` only queues a validator and returns its id; nothing is
/// checked until the session finishes.
pub struct InterfaceHandle<'a> {
    interface: &'a Interface,
    test_id: &'a str,
    cancel: &'a CancellationToken,
}

impl<'a> InterfaceHandle<'a> {
    pub fn source(&self) -> Source {
        self.interface.source()
    }

    fn register(&self, kind: ValidatorKind) -> Result<ValidatorId, EngineError> {
        self.interface
            .append_validation(Validator::new(self.test_id, kind))
    }

    pub fn append_data(&self, record: Record) -> Result<(), EngineError> {
        self.interface.append_data(record)
    }

    /// Block until this interface's data is complete or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<WaitOutcome, EngineError> {
        self.interface.wait(timeout, self.cancel)
    }

    /// Exactly `expected` spans carry the request id.
    pub fn assert_span_count(
        &self,
        request: &LogicalRequest,
        expected: usize,
    ) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::SpanCount {
            request: request.clone(),
            expected,
            mode: CountMode::Exactly,
            full_trace: false,
        })
    }

    /// Exactly `expected` spans in the traces the request started,
    /// children without the id included.
    pub fn assert_full_trace_span_count(
        &self,
        request: &LogicalRequest,
        expected: usize,
    ) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::SpanCount {
            request: request.clone(),
            expected,
            mode: CountMode::Exactly,
            full_trace: true,
        })
    }

    pub fn assert_at_least_spans(
        &self,
        request: &LogicalRequest,
        minimum: usize,
    ) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::SpanCount {
            request: request.clone(),
            expected: minimum,
            mode: CountMode::AtLeast,
            full_trace: false,
        })
    }

    /// Run `check` on every span of `request`, or on every span of the
    /// interface when `request` is `None`.
    pub fn add_span_validation<F>(
        &self,
        request: Option<&LogicalRequest>,
        description: &str,
        check: F,
    ) -> Result<ValidatorId, EngineError>
    where
        F: Fn(&Span) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(ValidatorKind::SpanCheck {
            request: request.cloned(),
            description: description.to_string(),
            check: Box::new(check),
        })
    }

    pub fn assert_receive_request_root_trace(
        &self,
        request: &LogicalRequest,
    ) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::RootSpanPresent {
            request: request.clone(),
        })
    }

    pub fn assert_trace_id_uniqueness(&self) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::TraceIdUniqueness)
    }

    /// Let `trace_id` appear in several traces on this interface.
    pub fn add_trace_id_exception(&self, trace_id: u64) {
        self.interface.add_trace_id_exception(trace_id);
    }

    pub fn assert_trace_headers_present(&self) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::HeadersPresent)
    }

    pub fn assert_responses_successful(&self, path: &str) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::ResponsesSuccessful {
            path: path.to_string(),
        })
    }

    /// Telemetry sent from this interface's source got 2xx answers.
    pub fn assert_telemetry_requests_are_successful(&self) -> Result<ValidatorId, EngineError> {
        let path = match self.interface.source() {
            Source::Agent => AGENT_TELEMETRY_PATH,
            _ => LIBRARY_TELEMETRY_PATH,
        };
        self.assert_responses_successful(path)
    }

    pub fn assert_no_skipped_seq_ids(&self) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::NoSkippedSeqIds)
    }

    /// Every governed payload matches its schema, except violations whose
    /// key is in `allowed_errors`.
    pub fn assert_schemas(&self, allowed_errors: &[&str]) -> Result<ValidatorId, EngineError> {
        self.register(ValidatorKind::Schema {
            allowed_errors: allowed_errors.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn check_deserialization_errors(&self) -> Result<(), EngineError> {
        self.interface.check_deserialization_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::FailureKind;
    use serde_json::json;

    fn session() -> Session {
        let scenario = ScenarioContext::for_library("python", Some("2.9.0")).unwrap();
        Session::in_memory(scenario, EngineConfig::default()).unwrap()
    }

    fn traces_for(rid: &str, count: u64) -> Record {
        let spans: Vec<serde_json::Value> = (0..count)
            .map(|i| {
                json!({
                    "trace_id": 1, "span_id": 100 + i, "parent_id": if i == 0 { 0 } else { 100 },
                    "name": "n", "service": "s", "resource": "r", "start": 1, "duration": 1,
                    "meta": {"http.request.headers.x-test-request-id": rid}
                })
            })
            .collect();
        Record::request(Source::Library, "/v0.4/traces", json!([spans]))
    }

    #[test]
    fn results_are_attributed_to_the_registering_test() {
        let session = session();
        let request = LogicalRequest::with_id("RID", "GET", "/");
        session.test("test_a").library().assert_span_count(&request, 2).unwrap();
        session.test("test_b").library().assert_span_count(&request, 3).unwrap();
        session.interfaces().library.append_data(traces_for("RID", 2)).unwrap();

        let report = session.finish();
        assert_eq!(report.total, 2);
        let by_test = report.by_test();
        assert!(by_test["test_a"][0].outcome.is_passed());
        assert!(!by_test["test_b"][0].outcome.is_passed());
        assert_eq!(report.waits["library"], WaitOutcome::Complete);
    }

    #[test]
    fn cancelled_session_reports_validators_as_not_evaluated() {
        let session = session();
        let request = LogicalRequest::with_id("RID", "GET", "/");
        let scope = session.test("test_a");
        scope.library().assert_span_count(&request, 1).unwrap();
        scope.agent().assert_trace_id_uniqueness().unwrap();
        session.cancellation_token().cancel();

        let report = session.finish();
        assert_eq!(report.total, 2);
        for result in &report.results {
            assert_eq!(result.outcome.failure().unwrap().kind, FailureKind::NotEvaluated);
        }
    }

    #[test]
    fn weblog_calls_need_a_client() {
        let session = session();
        assert!(matches!(
            session.test("t").get("/"),
            Err(EngineError::NoWeblog(_))
        ));
    }

    #[test]
    fn buddies_are_addressable_by_source() {
        let mut scenario = ScenarioContext::for_library("java", None).unwrap();
        scenario.buddies = 2;
        let session = Session::in_memory(scenario, EngineConfig::default()).unwrap();
        assert_eq!(session.interfaces().iter().count(), 6);
        let scope = session.test("t");
        assert_eq!(scope.interface(Source::Buddy(1)).unwrap().source(), Source::Buddy(1));
        assert!(matches!(
            scope.interface(Source::Buddy(2)),
            Err(EngineError::UnknownInterface(Source::Buddy(2)))
        ));
    }

    #[test]
    fn silent_interfaces_with_zero_timeouts_do_not_delay_teardown() {
        let tmp = tempfile::TempDir::new().unwrap();
        let folder = tmp.path().join("interfaces").join("library");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(
            folder.join("00001.log"),
            "{\"path\": \"/info\", \"request\": {}}\n",
        )
        .unwrap();

        let config = EngineConfig {
            poll_interval_ms: 10,
            quiescence_ms: 50,
            timeout_s: 30,
            library_timeout_s: Some(10),
            agent_timeout_s: 0,
            backend_timeout_s: 0,
            open_telemetry_timeout_s: 0,
            ..EngineConfig::default()
        };
        let scenario = ScenarioContext::for_library("java", None).unwrap();
        let session = Session::live(scenario, config, tmp.path()).unwrap();

        let started = Instant::now();
        let report = session.finish();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.waits["library"], WaitOutcome::Quiescent);
        assert_eq!(report.waits["backend"], WaitOutcome::TimedOut);
        assert_eq!(report.waits["agent"], WaitOutcome::TimedOut);
        assert!(report.session_errors.is_empty());
    }

    #[test]
    fn replay_of_a_missing_folder_is_an_error() {
        let scenario = ScenarioContext::for_library("java", None).unwrap();
        let result = Session::replay(scenario, EngineConfig::default(), Path::new("/nonexistent/logs_x"));
        assert!(matches!(
            result,
            Err(EngineError::Store(StoreError::FolderNotFound { .. }))
        ));
    }
}
