//! Deferred assertions.
//!
//! A [`Validator`] is built while a test body runs and evaluated once, later,
//! against the complete record set of one interface. Every kind of check is a
//! [`ValidatorKind`] variant; the engine treats them all the same way.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracecheck_store::{Record, Source};
use tracecheck_wire::{telemetry_header, Span, TraceFormat};

use crate::context::ScenarioContext;
use crate::correlate::{CorrelatedSpan, Correlator};
use crate::interface::WaitOutcome;
use crate::request::LogicalRequest;
use crate::schema::{SchemaValidator, SchemaViolation, AGENT_TELEMETRY_PATH, LIBRARY_TELEMETRY_PATH};

pub type ValidatorId = u64;

/// Most observed items attached to a failure.
pub const MAX_OBSERVED: usize = 10;

/// Headers every tracer sends with a trace payload.
pub const TRACE_HEADERS: &[&str] = &[
    "datadog-meta-tracer-version",
    "datadog-meta-lang",
    "datadog-meta-lang-version",
];

/// Per-span check; `Err` carries what was wrong with the span.
pub type SpanCheckFn = Box<dyn Fn(&Span) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMode {
    Exactly,
    AtLeast,
}

pub enum ValidatorKind {
    /// The request produced `expected` spans (or at least that many).
    SpanCount {
        request: LogicalRequest,
        expected: usize,
        mode: CountMode,
        full_trace: bool,
    },
    /// Every span (of `request`, or of the interface) passes `check`.
    SpanCheck {
        request: Option<LogicalRequest>,
        description: String,
        check: SpanCheckFn,
    },
    /// The request produced a root span.
    RootSpanPresent { request: LogicalRequest },
    /// No two traces share a trace id, except the interface's exceptions.
    TraceIdUniqueness,
    /// Trace payloads carry the tracer identification headers.
    HeadersPresent,
    /// Every response on `path` is a 2xx.
    ResponsesSuccessful { path: String },
    /// Telemetry `seq_id`s have no gap within one runtime.
    NoSkippedSeqIds,
    /// Every governed payload matches its schema.
    Schema { allowed_errors: Vec<String> },
}

impl ValidatorKind {
    pub fn describe(&self) -> String {
        match self {
            ValidatorKind::SpanCount {
                request,
                expected,
                mode,
                full_trace,
            } => {
                let quantity = match mode {
                    CountMode::Exactly => format!("exactly {}", expected),
                    CountMode::AtLeast => format!("at least {}", expected),
                };
                let scope = if *full_trace { " (full traces)" } else { "" };
                format!("{} span(s) for request {}{}", quantity, request.id, scope)
            }
            ValidatorKind::SpanCheck {
                request,
                description,
                ..
            } => match request {
                Some(r) => format!("span check '{}' for request {}", description, r.id),
                None => format!("span check '{}'", description),
            },
            ValidatorKind::RootSpanPresent { request } => {
                format!("root span for request {}", request.id)
            }
            ValidatorKind::TraceIdUniqueness => "trace id uniqueness".to_string(),
            ValidatorKind::HeadersPresent => "trace payload headers".to_string(),
            ValidatorKind::ResponsesSuccessful { path } => {
                format!("successful responses on {}", path)
            }
            ValidatorKind::NoSkippedSeqIds => "no skipped telemetry seq_id".to_string(),
            ValidatorKind::Schema { .. } => "schema conformance".to_string(),
        }
    }

    fn request_id(&self) -> Option<&str> {
        match self {
            ValidatorKind::SpanCount { request, .. } | ValidatorKind::RootSpanPresent { request } => {
                Some(request.id.as_str())
            }
            ValidatorKind::SpanCheck {
                request: Some(request),
                ..
            } => Some(request.id.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorKind({})", self.describe())
    }
}

/// A registered assertion. Consumed by evaluation, so it can only run once.
#[derive(Debug)]
pub struct Validator {
    pub id: ValidatorId,
    pub test_id: String,
    pub interface: Source,
    pub kind: ValidatorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The data the validator needed is not there.
    NoMatchingData,
    /// The data is there and the assertion does not hold.
    Assertion,
    /// A payload does not match its wire-format schema.
    SchemaViolation,
    /// The session stopped before the validator could run.
    NotEvaluated,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::NoMatchingData => write!(f, "no matching data"),
            FailureKind::Assertion => write!(f, "assertion failed"),
            FailureKind::SchemaViolation => write!(f, "schema violation"),
            FailureKind::NotEvaluated => write!(f, "not evaluated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// What was actually seen: spans, payloads, headers or violations.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub observed: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed(Failure),
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Passed => None,
            Outcome::Failed(f) => Some(f),
        }
    }
}

/// Everything a validator can look at.
pub struct EvalContext<'a> {
    pub scenario: &'a ScenarioContext,
    pub records: &'a [Record],
    pub wait: WaitOutcome,
    pub timing_fallback: bool,
    pub schemas: &'a SchemaValidator,
    /// Trace ids allowed to appear in several traces.
    pub trace_id_exceptions: &'a BTreeSet<u64>,
}

impl<'a> EvalContext<'a> {
    fn correlator(&self) -> Correlator<'a> {
        Correlator::new(self.records).with_timing_fallback(self.timing_fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatorResult {
    pub id: ValidatorId,
    pub test_id: String,
    pub interface: Source,
    pub description: String,
    pub outcome: Outcome,
    /// Schema errors the allow-list tolerated.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tolerated: Vec<SchemaViolation>,
}

impl Validator {
    pub fn new(test_id: &str, kind: ValidatorKind) -> Self {
        Validator {
            id: 0,
            test_id: test_id.to_string(),
            interface: Source::Library,
            kind,
        }
    }

    pub fn evaluate(self, ctx: &EvalContext<'_>) -> ValidatorResult {
        let description = self.kind.describe();
        let rid = self.kind.request_id().map(|s| s.to_string());
        let mut tolerated = Vec::new();

        let outcome = match &self.kind {
            ValidatorKind::SpanCount {
                request,
                expected,
                mode,
                full_trace,
            } => span_count(ctx, request, *expected, *mode, *full_trace),
            ValidatorKind::SpanCheck { request, check, .. } => span_check(ctx, request.as_ref(), check),
            ValidatorKind::RootSpanPresent { request } => root_span_present(ctx, request),
            ValidatorKind::TraceIdUniqueness => trace_id_uniqueness(ctx, ctx.trace_id_exceptions),
            ValidatorKind::HeadersPresent => headers_present(ctx),
            ValidatorKind::ResponsesSuccessful { path } => responses_successful(ctx, path),
            ValidatorKind::NoSkippedSeqIds => no_skipped_seq_ids(ctx),
            ValidatorKind::Schema { allowed_errors } => {
                let report = ctx.schemas.validate(ctx.records, allowed_errors);
                tolerated = report.tolerated;
                schema_outcome(report.violations)
            }
        };

        let outcome = match outcome {
            Outcome::Failed(mut failure) => {
                if failure.request_id.is_none() {
                    failure.request_id = rid;
                }
                Outcome::Failed(failure)
            }
            passed => passed,
        };

        ValidatorResult {
            id: self.id,
            test_id: self.test_id,
            interface: self.interface,
            description,
            outcome,
            tolerated,
        }
    }

    /// Report this validator without running it.
    pub fn not_evaluated(self, reason: &str) -> ValidatorResult {
        let rid = self.kind.request_id().map(|s| s.to_string());
        ValidatorResult {
            id: self.id,
            description: self.kind.describe(),
            test_id: self.test_id,
            interface: self.interface,
            outcome: Outcome::Failed(Failure {
                kind: FailureKind::NotEvaluated,
                message: reason.to_string(),
                request_id: rid,
                observed: Vec::new(),
            }),
            tolerated: Vec::new(),
        }
    }
}

// ── Failure helpers ──────────────────────────────────────────────────

fn failed(kind: FailureKind, message: String, observed: Vec<serde_json::Value>) -> Outcome {
    Outcome::Failed(Failure {
        kind,
        message,
        request_id: None,
        observed,
    })
}

/// `what` was needed and is absent. Says whether the data was complete.
fn no_data(ctx: &EvalContext<'_>, what: &str) -> Outcome {
    let message = match ctx.wait {
        WaitOutcome::TimedOut => format!(
            "{} never arrived: the wait timed out while data was still flowing",
            what
        ),
        WaitOutcome::Interrupted => format!("{} not seen before the wait was interrupted", what),
        WaitOutcome::Quiescent | WaitOutcome::Complete => {
            format!("{} not found in the complete data", what)
        }
    };
    failed(FailureKind::NoMatchingData, message, Vec::new())
}

fn observed_spans(spans: &[CorrelatedSpan]) -> Vec<serde_json::Value> {
    spans
        .iter()
        .take(MAX_OBSERVED)
        .map(|s| s.span.raw.clone())
        .collect()
}

// ── Kinds ────────────────────────────────────────────────────────────

fn span_count(
    ctx: &EvalContext<'_>,
    request: &LogicalRequest,
    expected: usize,
    mode: CountMode,
    full_trace: bool,
) -> Outcome {
    let spans = ctx.correlator().get_spans(request, full_trace);
    if spans.is_empty() && expected > 0 {
        return no_data(ctx, &format!("span for request {}", request.id));
    }
    let holds = match mode {
        CountMode::Exactly => spans.len() == expected,
        CountMode::AtLeast => spans.len() >= expected,
    };
    if holds {
        return Outcome::Passed;
    }
    let quantity = match mode {
        CountMode::Exactly => "exactly",
        CountMode::AtLeast => "at least",
    };
    failed(
        FailureKind::Assertion,
        format!(
            "expected {} {} span(s) for request {}, found {}",
            quantity,
            expected,
            request.id,
            spans.len()
        ),
        observed_spans(&spans),
    )
}

fn span_check(ctx: &EvalContext<'_>, request: Option<&LogicalRequest>, check: &SpanCheckFn) -> Outcome {
    let spans: Vec<CorrelatedSpan> = match request {
        Some(request) => ctx.correlator().get_spans(request, false),
        None => ctx.correlator().spans().collect(),
    };
    if spans.is_empty() {
        let what = match request {
            Some(r) => format!("span for request {}", r.id),
            None => "span".to_string(),
        };
        return no_data(ctx, &what);
    }
    for s in &spans {
        if let Err(reason) = check(&s.span) {
            return failed(
                FailureKind::Assertion,
                format!(
                    "span {} of trace {} (record #{}): {}",
                    s.span_id, s.trace_id, s.record_seq, reason
                ),
                vec![s.span.raw.clone()],
            );
        }
    }
    Outcome::Passed
}

fn root_span_present(ctx: &EvalContext<'_>, request: &LogicalRequest) -> Outcome {
    let spans = ctx.correlator().get_spans(request, false);
    if spans.is_empty() {
        return no_data(ctx, &format!("span for request {}", request.id));
    }
    if spans.iter().any(|s| s.span.is_root()) {
        return Outcome::Passed;
    }
    failed(
        FailureKind::Assertion,
        format!(
            "request {} produced {} span(s) but none is a root span",
            request.id,
            spans.len()
        ),
        observed_spans(&spans),
    )
}

fn trace_id_uniqueness(ctx: &EvalContext<'_>, exceptions: &BTreeSet<u64>) -> Outcome {
    let mut roots: BTreeMap<u64, Vec<CorrelatedSpan>> = BTreeMap::new();
    for s in ctx.correlator().spans().filter(|s| s.span.is_root()) {
        roots.entry(s.trace_id).or_default().push(s);
    }
    let duplicated: Vec<(u64, Vec<CorrelatedSpan>)> = roots
        .into_iter()
        .filter(|(trace_id, spans)| spans.len() > 1 && !exceptions.contains(trace_id))
        .collect();
    if duplicated.is_empty() {
        return Outcome::Passed;
    }
    let ids: Vec<String> = duplicated.iter().map(|(id, _)| id.to_string()).collect();
    let observed: Vec<CorrelatedSpan> = duplicated.into_iter().flat_map(|(_, s)| s).collect();
    failed(
        FailureKind::Assertion,
        format!("trace id(s) shared by several traces: {}", ids.join(", ")),
        observed_spans(&observed),
    )
}

fn headers_present(ctx: &EvalContext<'_>) -> Outcome {
    let mut required: Vec<&str> = TRACE_HEADERS.to_vec();
    if ctx.scenario.library.is("php") {
        required.push("datadog-meta-lang-interpreter");
    }

    let mut seen = 0usize;
    for record in ctx.records.iter().filter(|r| r.is_request()) {
        match TraceFormat::for_endpoint(&record.path) {
            Some(TraceFormat::LibraryV04 | TraceFormat::LibraryV05) => {}
            _ => continue,
        }
        seen += 1;
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|h| record.header(h).is_none())
            .collect();
        if !missing.is_empty() {
            return failed(
                FailureKind::Assertion,
                format!(
                    "trace payload #{} on {} is missing header(s): {}",
                    record.seq,
                    record.path,
                    missing.join(", ")
                ),
                vec![serde_json::json!({ "headers": record.headers })],
            );
        }
    }
    if seen == 0 {
        return no_data(ctx, "trace payload");
    }
    Outcome::Passed
}

fn responses_successful(ctx: &EvalContext<'_>, path: &str) -> Outcome {
    let responses: Vec<&Record> = ctx
        .records
        .iter()
        .filter(|r| !r.is_request() && r.path == path)
        .collect();
    if responses.is_empty() {
        return no_data(ctx, &format!("response on {}", path));
    }
    let bad: Vec<&&Record> = responses
        .iter()
        .filter(|r| !matches!(r.status_code, Some(200..=299)))
        .collect();
    if bad.is_empty() {
        return Outcome::Passed;
    }
    failed(
        FailureKind::Assertion,
        format!(
            "{} of {} response(s) on {} were not successful (first: record #{}, status {})",
            bad.len(),
            responses.len(),
            path,
            bad[0].seq,
            bad[0]
                .status_code
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        ),
        bad.iter()
            .take(MAX_OBSERVED)
            .map(|r| serde_json::json!({ "seq": r.seq, "status_code": r.status_code }))
            .collect(),
    )
}

fn no_skipped_seq_ids(ctx: &EvalContext<'_>) -> Outcome {
    let mut by_runtime: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for record in ctx.records.iter().filter(|r| r.is_request()) {
        if record.path != LIBRARY_TELEMETRY_PATH && record.path != AGENT_TELEMETRY_PATH {
            continue;
        }
        let Some(payload) = record.json() else { continue };
        let Ok(header) = telemetry_header(payload) else { continue };
        if let Some(seq_id) = header.seq_id {
            by_runtime
                .entry(header.runtime_id.unwrap_or_default())
                .or_default()
                .push(seq_id);
        }
    }
    if by_runtime.is_empty() {
        return no_data(ctx, "telemetry message");
    }

    let mut gaps = Vec::new();
    for (runtime, mut ids) in by_runtime {
        ids.sort_unstable();
        ids.dedup();
        for pair in ids.windows(2) {
            if pair[1] > pair[0] + 1 {
                gaps.push(serde_json::json!({
                    "runtime_id": runtime,
                    "after": pair[0],
                    "next": pair[1],
                }));
            }
        }
    }
    if gaps.is_empty() {
        return Outcome::Passed;
    }
    failed(
        FailureKind::Assertion,
        format!("{} gap(s) in telemetry seq_id", gaps.len()),
        gaps.into_iter().take(MAX_OBSERVED).collect(),
    )
}

fn schema_outcome(violations: Vec<SchemaViolation>) -> Outcome {
    let Some(first) = violations.first() else {
        return Outcome::Passed;
    };
    let message = format!(
        "{} schema violation(s); first: record #{} on {} at '{}' ({}): {}",
        violations.len(),
        first.seq,
        first.path,
        first.pointer,
        first.schema,
        first.message
    );
    let observed = violations
        .iter()
        .take(MAX_OBSERVED)
        .filter_map(|v| serde_json::to_value(v).ok())
        .collect();
    failed(FailureKind::SchemaViolation, message, observed)
}
