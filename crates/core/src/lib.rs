#![allow(clippy::result_large_err)]
//! tracecheck-core: the interface engine of the tracecheck conformance harness.
//!
//! Test bodies drive a weblog and register deferred validators; the engine
//! waits until the captured traffic is complete, then evaluates every
//! validator exactly once against the records of its interface.
//!
//! # Public API
//!
//! - [`Session`] -- live, replay or in-memory session; [`Session::finish`]
//!   is the teardown hook returning a [`SessionReport`]
//! - [`TestScope`] / [`InterfaceHandle`] -- per-test registration surface
//! - [`Interface`] -- one source's records and validator queue
//! - [`Correlator`] -- request to span matching
//! - [`SchemaValidator`] -- wire-format schema checks
//! - [`ScenarioContext`], [`HarnessConfig`] -- what is under test and how
//!   the engine behaves

pub mod config;
pub mod context;
pub mod correlate;
pub mod error;
pub mod interface;
pub mod report;
pub mod request;
pub mod schema;
pub mod session;
pub mod validator;
pub mod weblog;

// ── Convenience re-exports ───────────────────────────────────────────

pub use config::{EngineConfig, HarnessConfig, ScenarioConfig, SchemaConfig};
pub use context::{LibraryVersion, ScenarioContext, Version};
pub use correlate::{CorrelatedSpan, Correlator};
pub use error::EngineError;
pub use interface::{CancellationToken, EngineContext, Interface, Mode, WaitOutcome};
pub use report::SessionReport;
pub use request::{new_request_id, LogicalRequest, WeblogResponse};
pub use schema::{SchemaReport, SchemaValidator, SchemaViolation, Selection};
pub use session::{InterfaceHandle, Interfaces, Session, TestScope};
pub use validator::{
    CountMode, Failure, FailureKind, Outcome, Validator, ValidatorId, ValidatorKind,
    ValidatorResult,
};
pub use weblog::WeblogClient;

pub use tracecheck_store::{DeserializationError, Record, RecordStore, Source};
pub use tracecheck_wire::Span;
