//! Session teardown report.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use tracecheck_store::DeserializationError;

use crate::interface::{Mode, WaitOutcome};
use crate::schema::SchemaViolation;
use crate::validator::{Outcome, ValidatorResult};

/// Everything a session learned, keyed for stable output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub scenario: String,
    pub mode: Mode,
    /// Every validator result, interface by interface, in registration order.
    pub results: Vec<ValidatorResult>,
    /// How each interface's wait ended.
    pub waits: BTreeMap<String, WaitOutcome>,
    /// Corrupt log entries, per interface. Fatal to the suite.
    pub deserialization_errors: BTreeMap<String, Vec<DeserializationError>>,
    /// Failures of the engine itself (unreadable folders and the like).
    pub session_errors: Vec<String>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl SessionReport {
    pub fn new(
        scenario: &str,
        mode: Mode,
        results: Vec<ValidatorResult>,
        waits: BTreeMap<String, WaitOutcome>,
        deserialization_errors: BTreeMap<String, Vec<DeserializationError>>,
        session_errors: Vec<String>,
    ) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.outcome.is_passed()).count();
        SessionReport {
            scenario: scenario.to_string(),
            mode,
            results,
            waits,
            deserialization_errors,
            session_errors,
            passed,
            failed: total - passed,
            total,
        }
    }

    /// Results grouped by the test that registered them.
    pub fn by_test(&self) -> BTreeMap<&str, Vec<&ValidatorResult>> {
        let mut grouped: BTreeMap<&str, Vec<&ValidatorResult>> = BTreeMap::new();
        for result in &self.results {
            grouped.entry(result.test_id.as_str()).or_default().push(result);
        }
        grouped
    }

    /// Ids of tests with at least one failed validator.
    pub fn failed_tests(&self) -> Vec<&str> {
        self.by_test()
            .into_iter()
            .filter(|(_, results)| results.iter().any(|r| !r.outcome.is_passed()))
            .map(|(test_id, _)| test_id)
            .collect()
    }

    pub fn tolerated_schema_errors(&self) -> Vec<&SchemaViolation> {
        self.results.iter().flat_map(|r| r.tolerated.iter()).collect()
    }

    pub fn deserialization_error_count(&self) -> usize {
        self.deserialization_errors.values().map(Vec::len).sum()
    }

    /// True when every validator passed and the suite-level checks are clean.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.deserialization_error_count() == 0 && self.session_errors.is_empty()
    }

    /// SHA-256 of the report's JSON. Two runs over the same data agree.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Session '{}': {}/{} passed ({} failed)",
            self.scenario, self.passed, self.total, self.failed
        )?;
        for result in &self.results {
            if let Outcome::Failed(failure) = &result.outcome {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {} ({}): {}",
                    result.interface, result.test_id, result.description, failure.kind, failure.message
                )?;
            }
        }
        for (interface, errors) in &self.deserialization_errors {
            for error in errors {
                writeln!(f, "  CORRUPT [{}]: {}", interface, error)?;
            }
        }
        for error in &self.session_errors {
            writeln!(f, "  ERROR: {}", error)?;
        }
        Ok(())
    }
}
