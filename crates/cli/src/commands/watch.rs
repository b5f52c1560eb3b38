use std::path::Path;
use std::process;

use tracecheck_core::Session;
use tracing::warn;

use super::{finish_with_report, load_config, register_session_checks};
use crate::{report_error, ConfigArgs, OutputFormat};

/// Follow a live log folder until every interface is quiet or the timeout
/// elapses. Ctrl-C stops the wait; the report still prints.
pub(crate) fn cmd_watch(log_folder: &Path, args: &ConfigArgs, output: OutputFormat, quiet: bool) {
    let (config, scenario) = load_config(args, output, quiet);

    let session = match Session::live(scenario, config.engine.clone(), log_folder) {
        Ok(s) => s,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    };
    if let Err(e) = register_session_checks(&session, &config.schemas.allowed_errors) {
        report_error(&format!("error: {}", e), output, quiet);
        process::exit(1);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            report_error(&format!("error: failed to start runtime: {}", e), output, quiet);
            process::exit(1);
        }
    };
    let cancel = session.cancellation_token();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted: stopping the wait");
            cancel.cancel();
        }
    });

    if !quiet {
        eprintln!(
            "Watching {} (timeout {}s, Ctrl-C to stop)...",
            log_folder.display(),
            config.engine.timeout_s
        );
    }
    let report = session.finish();
    rt.shutdown_background();
    finish_with_report(&report, output, quiet);
}
