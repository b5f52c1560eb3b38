use std::path::Path;
use std::process;

use tracecheck_core::Session;

use super::{finish_with_report, load_config, register_session_checks};
use crate::{report_error, require_folder, ConfigArgs, OutputFormat};

pub(crate) fn cmd_replay(log_folder: &Path, args: &ConfigArgs, output: OutputFormat, quiet: bool) {
    require_folder(log_folder, output, quiet);
    let (config, scenario) = load_config(args, output, quiet);

    let session = match Session::replay(scenario, config.engine.clone(), log_folder) {
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

    let report = session.finish();
    finish_with_report(&report, output, quiet);
}
