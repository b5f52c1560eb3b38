//! One interface per traffic source: its records, its validator queue, and
//! the single point where the engine waits for data.
//!
//! Registration and evaluation are decoupled. `append_validation` only
//! queues; `evaluate` drains the queue exactly once against the records that
//! were visible when the last `wait` returned. New records become visible
//! only when `wait` or the teardown `settle` returns, never while a poll is
//! in progress.

use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracecheck_store::{DeserializationError, Record, RecordStore, Source};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::ScenarioContext;
use crate::error::EngineError;
use crate::schema::SchemaValidator;
use crate::validator::{EvalContext, Validator, ValidatorId, ValidatorResult};

/// How a `wait` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitOutcome {
    /// Data arrived, then the interface stayed quiet for the quiescence window.
    Quiescent,
    /// The timeout elapsed first. Whatever arrived is kept.
    TimedOut,
    /// Nothing to wait for: replayed or in-memory data is complete.
    Complete,
    /// A cancellation token fired.
    Interrupted,
}

/// Shared flag that stops waits in progress.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// A proxy is still writing; the store is polled.
    Live,
    /// A previous run's folder, bulk-loaded once.
    Replay,
    /// Records are fed through `append_data` only.
    InMemory,
}

/// What every interface of a session shares.
#[derive(Clone)]
pub struct EngineContext {
    pub scenario: Arc<ScenarioContext>,
    pub schemas: Arc<SchemaValidator>,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(scenario: Arc<ScenarioContext>, config: EngineConfig) -> Result<Self, EngineError> {
        Ok(EngineContext {
            scenario,
            schemas: Arc::new(SchemaValidator::new()?),
            config,
        })
    }
}

struct State {
    data: Vec<Record>,
    validators: VecDeque<Validator>,
    /// `None` for in-memory interfaces, and while a wait holds it.
    store: Option<RecordStore>,
    ready: bool,
    closed: bool,
    next_validator: ValidatorId,
    last_wait: Option<WaitOutcome>,
    trace_id_exceptions: BTreeSet<u64>,
}

pub struct Interface {
    source: Source,
    mode: Mode,
    engine: EngineContext,
    state: Mutex<State>,
}

impl Interface {
    fn with_store(source: Source, mode: Mode, engine: EngineContext, store: Option<RecordStore>) -> Self {
        Interface {
            source,
            mode,
            engine,
            state: Mutex::new(State {
                data: Vec::new(),
                validators: VecDeque::new(),
                store,
                ready: false,
                closed: false,
                next_validator: 0,
                last_wait: None,
                trace_id_exceptions: BTreeSet::new(),
            }),
        }
    }

    pub fn in_memory(source: Source, engine: EngineContext) -> Self {
        Interface::with_store(source, Mode::InMemory, engine, None)
    }

    /// An interface polling `<log_folder>/interfaces/<source>/`.
    pub fn live(source: Source, log_folder: &Path, engine: EngineContext) -> Self {
        let store = RecordStore::for_log_folder(log_folder, source);
        Interface::with_store(source, Mode::Live, engine, Some(store))
    }

    /// An interface over a finished run: everything on disk is loaded now.
    pub fn replay(source: Source, log_folder: &Path, engine: EngineContext) -> Result<Self, EngineError> {
        let mut store = RecordStore::for_log_folder(log_folder, source);
        store.load_data_from_logs()?;
        let records = store.drain();
        let interface = Interface::with_store(source, Mode::Replay, engine, Some(store));
        {
            let mut state = interface.lock();
            for record in records {
                push_record(&mut state, record);
            }
        }
        Ok(interface)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// True once the first record has been observed.
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn record_count(&self) -> usize {
        self.lock().data.len()
    }

    pub fn pending_validators(&self) -> usize {
        self.lock().validators.len()
    }

    /// A snapshot of the visible records, in arrival order.
    pub fn records(&self) -> Vec<Record> {
        self.lock().data.clone()
    }

    pub fn last_wait(&self) -> Option<WaitOutcome> {
        self.lock().last_wait
    }

    /// Make a record visible to validators. It must belong to this
    /// interface's source.
    pub fn append_data(&self, record: Record) -> Result<(), EngineError> {
        if record.source != self.source {
            return Err(EngineError::SourceMismatch {
                expected: self.source,
                found: record.source,
            });
        }
        push_record(&mut self.lock(), record);
        Ok(())
    }

    /// Queue a validator. Never evaluates it.
    pub fn append_validation(&self, mut validator: Validator) -> Result<ValidatorId, EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::InterfaceClosed(self.source));
        }
        let id = state.next_validator;
        state.next_validator += 1;
        validator.id = id;
        validator.interface = self.source;
        debug!(
            interface = %self.source,
            id,
            test_id = %validator.test_id,
            validator = %validator.kind.describe(),
            "validator queued"
        );
        state.validators.push_back(validator);
        Ok(id)
    }

    /// Allow `trace_id` to appear in several traces.
    pub fn add_trace_id_exception(&self, trace_id: u64) {
        self.lock().trace_id_exceptions.insert(trace_id);
    }

    /// Block until the data is complete or `timeout` elapses.
    ///
    /// A line the proxy has not finished writing stays pending for the next
    /// poll; only [`settle`](Interface::settle) turns it into an error.
    pub fn wait(&self, timeout: Duration, cancel: &CancellationToken) -> Result<WaitOutcome, EngineError> {
        self.wait_until(Instant::now() + timeout, cancel)
    }

    /// [`wait`](Interface::wait) against an absolute deadline.
    pub fn wait_until(&self, deadline: Instant, cancel: &CancellationToken) -> Result<WaitOutcome, EngineError> {
        if self.mode != Mode::Live {
            self.lock().last_wait = Some(WaitOutcome::Complete);
            return Ok(WaitOutcome::Complete);
        }

        let taken = self.lock().store.take();
        let Some(mut store) = taken else {
            // Another wait holds the store.
            return Ok(self.last_wait().unwrap_or(WaitOutcome::Complete));
        };

        let poll_interval = self.engine.config.poll_interval();
        let quiescence = self.engine.config.quiescence();
        let result = poll_until_quiet(&mut store, deadline, poll_interval, quiescence, cancel);
        let records = store.drain();
        let mut state = self.lock();
        state.store = Some(store);
        for record in records {
            push_record(&mut state, record);
        }
        let outcome = result?;
        state.last_wait = Some(outcome);

        match outcome {
            WaitOutcome::TimedOut => warn!(
                interface = %self.source,
                records = state.data.len(),
                "wait timed out"
            ),
            _ => info!(
                interface = %self.source,
                records = state.data.len(),
                outcome = ?outcome,
                "wait finished"
            ),
        }
        Ok(outcome)
    }

    /// Teardown only: the writer is done. Pick up whatever arrived since
    /// the last wait and settle unterminated fragments, parsing them or
    /// recording them as deserialization errors.
    ///
    /// Returns the number of records made visible. A no-op unless live.
    pub fn settle(&self) -> Result<usize, EngineError> {
        if self.mode != Mode::Live {
            return Ok(0);
        }
        let taken = self.lock().store.take();
        let Some(mut store) = taken else {
            return Ok(0);
        };
        let result = store.poll().and_then(|polled| Ok(polled + store.flush()?));
        let records = store.drain();
        let mut state = self.lock();
        state.store = Some(store);
        let count = records.len();
        for record in records {
            push_record(&mut state, record);
        }
        result?;
        if count > 0 {
            debug!(interface = %self.source, records = count, "settled late records");
        }
        Ok(count)
    }

    /// Evaluate every queued validator once, in registration order.
    ///
    /// The queue is drained: a second call returns nothing, and the
    /// interface refuses new validators afterwards.
    pub fn evaluate(&self) -> Vec<ValidatorResult> {
        let mut state = self.lock();
        state.closed = true;
        let queue = std::mem::take(&mut state.validators);
        if queue.is_empty() {
            return Vec::new();
        }

        let ctx = EvalContext {
            scenario: &self.engine.scenario,
            records: &state.data,
            wait: state.last_wait.unwrap_or(WaitOutcome::Complete),
            timing_fallback: self.engine.config.timing_fallback,
            schemas: &self.engine.schemas,
            trace_id_exceptions: &state.trace_id_exceptions,
        };

        let results: Vec<ValidatorResult> = queue.into_iter().map(|v| v.evaluate(&ctx)).collect();
        for result in results.iter().filter(|r| !r.outcome.is_passed()) {
            if let Some(failure) = result.outcome.failure() {
                warn!(
                    interface = %self.source,
                    test_id = %result.test_id,
                    validator = %result.description,
                    kind = %failure.kind,
                    "{}",
                    failure.message
                );
            }
        }
        results
    }

    /// Close the interface without running its queue; every pending
    /// validator is reported as not evaluated.
    pub fn abandon(&self, reason: &str) -> Vec<ValidatorResult> {
        let mut state = self.lock();
        state.closed = true;
        std::mem::take(&mut state.validators)
            .into_iter()
            .map(|v| v.not_evaluated(reason))
            .collect()
    }

    pub fn deserialization_errors(&self) -> Vec<DeserializationError> {
        self.lock()
            .store
            .as_ref()
            .map(|s| s.errors().to_vec())
            .unwrap_or_default()
    }

    /// Fail when any entry of this interface's logs could not be parsed.
    pub fn check_deserialization_errors(&self) -> Result<(), EngineError> {
        let errors = self.deserialization_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Deserialization {
                interface: self.source,
                errors,
            })
        }
    }
}

fn push_record(state: &mut State, mut record: Record) {
    record.seq = state.data.len() as u64;
    state.data.push(record);
    state.ready = true;
}

/// Poll until the store has been quiet for `quiescence` after its first
/// record, the deadline passes, or `cancel` fires.
fn poll_until_quiet(
    store: &mut RecordStore,
    deadline: Instant,
    poll_interval: Duration,
    quiescence: Duration,
    cancel: &CancellationToken,
) -> Result<WaitOutcome, EngineError> {
    let mut last_change = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Interrupted);
        }
        if store.poll()? > 0 {
            last_change = Instant::now();
        }
        let now = Instant::now();
        let ready = store.record_count() > 0;
        if ready && now.duration_since(last_change) >= quiescence {
            return Ok(WaitOutcome::Quiescent);
        }
        if now >= deadline {
            return Ok(WaitOutcome::TimedOut);
        }
        std::thread::sleep(poll_interval.min(deadline - now));
    }
}
