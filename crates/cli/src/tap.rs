//! TAP (Test Anything Protocol) v14 rendering of a session report.

use tracecheck_core::{Outcome, SessionReport};

pub struct Tap {
    points: Vec<TestPoint>,
}

struct TestPoint {
    ok: bool,
    desc: String,
    diagnostics: Vec<String>,
}

impl Tap {
    fn new() -> Self {
        Tap { points: Vec::new() }
    }

    /// One test point per validator, then one per interface with corrupt
    /// log entries, then one per session error.
    pub fn from_report(report: &SessionReport) -> Self {
        let mut tap = Tap::new();
        for result in &report.results {
            let desc = format!("{}: [{}] {}", result.test_id, result.interface, result.description);
            match &result.outcome {
                Outcome::Passed => {
                    let notes = result
                        .tolerated
                        .iter()
                        .map(|v| format!("tolerated: {} ({})", v.key, v.message))
                        .collect();
                    tap.push(true, desc, notes);
                }
                Outcome::Failed(failure) => {
                    let mut notes = vec![format!("{}: {}", failure.kind, failure.message)];
                    if let Some(rid) = &failure.request_id {
                        notes.push(format!("request id: {}", rid));
                    }
                    for observed in &failure.observed {
                        notes.push(format!("observed: {}", observed));
                    }
                    tap.push(false, desc, notes);
                }
            }
        }
        for (interface, errors) in &report.deserialization_errors {
            tap.push(
                false,
                format!("deserialization: [{}] {} corrupt log entries", interface, errors.len()),
                errors.iter().map(|e| e.to_string()).collect(),
            );
        }
        for error in &report.session_errors {
            tap.push(false, "session".to_string(), vec![error.clone()]);
        }
        tap
    }

    fn push(&mut self, ok: bool, desc: String, diagnostics: Vec<String>) {
        self.points.push(TestPoint {
            ok,
            desc,
            diagnostics,
        });
    }

    pub fn failure_count(&self) -> usize {
        self.points.iter().filter(|p| !p.ok).count()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("TAP version 14\n");
        out.push_str(&format!("1..{}\n", self.points.len()));
        for (i, point) in self.points.iter().enumerate() {
            let status = if point.ok { "ok" } else { "not ok" };
            out.push_str(&format!("{} {} - {}\n", status, i + 1, point.desc));
            for note in &point.diagnostics {
                for line in note.lines() {
                    out.push_str(&format!("  # {}\n", line));
                }
            }
        }
        let failed = self.failure_count();
        out.push_str(&format!("# tests {}\n", self.points.len()));
        out.push_str(&format!("# pass  {}\n", self.points.len() - failed));
        out.push_str(&format!("# fail  {}\n", failed));
        out
    }
}
