use std::path::Path;
use std::process;

use tracecheck_core::{Correlator, LogicalRequest};
use tracecheck_store::Source;

use super::load_interface;
use crate::{report_error, require_folder, OutputFormat};

pub(crate) fn cmd_spans(
    log_folder: &Path,
    source: Source,
    rid: &str,
    full_trace: bool,
    output: OutputFormat,
    quiet: bool,
) {
    require_folder(log_folder, output, quiet);
    let (records, _) = match load_interface(log_folder, source) {
        Ok(loaded) => loaded,
        Err(e) => {
            report_error(&format!("error: {}", e), output, quiet);
            process::exit(1);
        }
    };

    let request = LogicalRequest::with_id(rid, "GET", "/");
    let spans = Correlator::new(&records).get_spans(&request, full_trace);

    match output {
        OutputFormat::Text => {
            if spans.is_empty() {
                if !quiet {
                    eprintln!("No spans for request id {} on {}", rid, source);
                }
                process::exit(1);
            }
            println!(
                "{:>20}  {:>20}  {:>20}  {:<24}  RESOURCE",
                "TRACE", "SPAN", "PARENT", "NAME"
            );
            for s in &spans {
                let parent = s
                    .span
                    .parent_id
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>20}  {:>20}  {:>20}  {:<24}  {} (record #{})",
                    s.trace_id, s.span_id, parent, s.span.name, s.span.resource, s.record_seq
                );
            }
        }
        OutputFormat::Json => {
            let pretty = serde_json::to_string_pretty(&spans)
                .unwrap_or_else(|e| format!("serialization error: {}", e));
            println!("{}", pretty);
            if spans.is_empty() {
                process::exit(1);
            }
        }
    }
}
