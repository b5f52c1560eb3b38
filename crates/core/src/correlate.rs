//! Tie a test's requests to the spans they caused downstream.
//!
//! A span belongs to a request when it carries the request id (explicit
//! header tag, or `rid/<ID>` in a user-agent tag). Child spans rarely carry
//! it, so `full_trace` widens the match to every span of a matched trace.
//!
//! Optionally, a root span carrying no id at all can be attributed by timing:
//! if it started inside the `[issued, completed]` window of the request. Under
//! concurrent load this can attribute a span to the wrong request, so it is
//! off by default and only consulted when nothing matched by id.

use serde::Serialize;
use std::collections::BTreeSet;

use tracecheck_store::Record;
use tracecheck_wire::{decode_spans, Span, TraceFormat};
use tracing::debug;

use crate::request::LogicalRequest;

/// A span and where it was found.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelatedSpan {
    /// Sequence number of the record carrying the span.
    pub record_seq: u64,
    pub trace_id: u64,
    pub span_id: u64,
    pub span: Span,
}

pub struct Correlator<'a> {
    records: &'a [Record],
    timing_fallback: bool,
}

impl<'a> Correlator<'a> {
    pub fn new(records: &'a [Record]) -> Self {
        Correlator {
            records,
            timing_fallback: false,
        }
    }

    pub fn with_timing_fallback(mut self, enabled: bool) -> Self {
        self.timing_fallback = enabled;
        self
    }

    /// Every span of every trace payload, in arrival order.
    ///
    /// Payloads that do not decode are skipped here; the schema check is
    /// where they get reported.
    pub fn spans(&self) -> impl Iterator<Item = CorrelatedSpan> + 'a {
        let records: &'a [Record] = self.records;
        records
            .iter()
            .filter(|r| r.is_request())
            .filter_map(|record| {
                let format = TraceFormat::for_endpoint(&record.path)?;
                let payload = record.json()?;
                match decode_spans(format, payload) {
                    Ok(spans) => Some((record.seq, spans)),
                    Err(e) => {
                        debug!(seq = record.seq, path = %record.path, error = %e, "undecodable trace payload");
                        None
                    }
                }
            })
            .flat_map(|(seq, spans)| {
                spans.into_iter().map(move |span| CorrelatedSpan {
                    record_seq: seq,
                    trace_id: span.trace_id,
                    span_id: span.span_id,
                    span,
                })
            })
    }

    /// Spans caused by `request`.
    pub fn get_spans(&self, request: &LogicalRequest, full_trace: bool) -> Vec<CorrelatedSpan> {
        let all: Vec<CorrelatedSpan> = self.spans().collect();

        let mut matched: Vec<bool> = all
            .iter()
            .map(|s| s.span.request_id() == Some(request.id.as_str()))
            .collect();

        if self.timing_fallback && !matched.iter().any(|m| *m) {
            if let Some((issued, completed)) = request.window_nanos() {
                for (i, s) in all.iter().enumerate() {
                    let start = i128::from(s.span.start);
                    if s.span.is_root()
                        && s.span.request_id().is_none()
                        && start >= issued
                        && start <= completed
                    {
                        debug!(rid = %request.id, span_id = s.span_id, "span attributed by timing window");
                        matched[i] = true;
                    }
                }
            }
        }

        if !full_trace {
            return all
                .into_iter()
                .zip(matched)
                .filter_map(|(s, m)| m.then_some(s))
                .collect();
        }

        let traces: BTreeSet<u64> = all
            .iter()
            .zip(&matched)
            .filter(|(_, m)| **m)
            .map(|(s, _)| s.trace_id)
            .collect();
        all.into_iter()
            .filter(|s| traces.contains(&s.trace_id))
            .collect()
    }

    /// Records whose own headers carry the request id.
    pub fn records_for(&self, request: &LogicalRequest) -> Vec<&'a Record> {
        let records: &'a [Record] = self.records;
        records
            .iter()
            .filter(|r| r.request_id.as_deref() == Some(request.id.as_str()))
            .collect()
    }
}
