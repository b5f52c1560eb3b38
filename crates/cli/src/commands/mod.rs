pub(crate) mod inspect;
pub(crate) mod replay;
pub(crate) mod spans;
pub(crate) mod validate;
pub(crate) mod watch;

use std::path::Path;
use std::process;

use tracecheck_core::{EngineError, HarnessConfig, ScenarioContext, Session, SessionReport};
use tracecheck_store::{Record, RecordStore, Source, StoreError};

use crate::tap::Tap;
use crate::{report_error, ConfigArgs, OutputFormat};

/// Test id the session-wide checks are reported under.
const SESSION_TEST_ID: &str = "session";

/// Resolve the configuration and scenario, or exit 1.
pub(crate) fn load_config(
    args: &ConfigArgs,
    output: OutputFormat,
    quiet: bool,
) -> (HarnessConfig, ScenarioContext) {
    let resolved = args
        .resolve()
        .and_then(|config| ScenarioContext::from_config(&config).map(|ctx| (config, ctx)));
    match resolved {
        Ok(pair) => pair,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    }
}

/// Checks every replayed or watched run gets, whatever its tests were:
/// schemas on every interface, trace-id uniqueness on the library, and the
/// telemetry checks when the scenario declares the `telemetry` feature.
pub(crate) fn register_session_checks(
    session: &Session,
    allowed_errors: &[String],
) -> Result<(), EngineError> {
    let allowed: Vec<&str> = allowed_errors.iter().map(String::as_str).collect();
    let scope = session.test(SESSION_TEST_ID);
    for interface in session.interfaces().iter() {
        scope.interface(interface.source())?.assert_schemas(&allowed)?;
    }
    let library = scope.library();
    library.assert_trace_id_uniqueness()?;
    if session.scenario().has_feature("telemetry") {
        library.assert_telemetry_requests_are_successful()?;
        library.assert_no_skipped_seq_ids()?;
    }
    Ok(())
}

/// Print the report and exit 1 unless the session is clean.
pub(crate) fn finish_with_report(report: &SessionReport, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Text => {
            let tap = Tap::from_report(report);
            print!("{}", tap.render());
            if !quiet {
                eprint!("{}", report);
            }
        }
        OutputFormat::Json => {
            let mut value = serde_json::to_value(report).unwrap_or_default();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("digest".to_string(), serde_json::json!(report.digest()));
            }
            let pretty = serde_json::to_string_pretty(&value)
                .unwrap_or_else(|e| format!("serialization error: {}", e));
            println!("{}", pretty);
        }
    }
    if !report.is_success() {
        process::exit(1);
    }
}

/// Bulk-load one interface folder of a finished run.
pub(crate) fn load_interface(
    log_folder: &Path,
    source: Source,
) -> Result<(Vec<Record>, RecordStore), StoreError> {
    let mut store = RecordStore::for_log_folder(log_folder, source);
    store.load_data_from_logs()?;
    Ok((store.drain(), store))
}
