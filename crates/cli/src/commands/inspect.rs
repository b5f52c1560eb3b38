use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::process;

use tracecheck_store::{DeserializationError, Source};
use tracing::warn;

use super::load_interface;
use crate::{report_error, require_folder, OutputFormat};

#[derive(Serialize)]
struct InterfaceSummary {
    source: Source,
    requests: usize,
    responses: usize,
    /// Request count per endpoint.
    endpoints: BTreeMap<String, usize>,
    request_ids: usize,
    errors: Vec<DeserializationError>,
}

pub(crate) fn cmd_inspect(log_folder: &Path, output: OutputFormat, quiet: bool) {
    require_folder(log_folder, output, quiet);

    let interfaces_dir = log_folder.join("interfaces");
    let mut sources: Vec<Source> = match std::fs::read_dir(&interfaces_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                match name.parse::<Source>() {
                    Ok(source) => Some(source),
                    Err(reason) => {
                        warn!(folder = %name, %reason, "skipping unknown interface folder");
                        None
                    }
                }
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    sources.sort();

    let mut summaries = Vec::new();
    for source in sources {
        let (records, store) = match load_interface(log_folder, source) {
            Ok(loaded) => loaded,
            Err(e) => {
                report_error(&format!("error: {}", e), output, quiet);
                process::exit(1);
            }
        };
        let mut endpoints: BTreeMap<String, usize> = BTreeMap::new();
        for record in records.iter().filter(|r| r.is_request()) {
            *endpoints.entry(record.path.clone()).or_insert(0) += 1;
        }
        let mut request_ids: Vec<&str> = records
            .iter()
            .filter_map(|r| r.request_id.as_deref())
            .collect();
        request_ids.sort_unstable();
        request_ids.dedup();

        let requests = records.iter().filter(|r| r.is_request()).count();
        summaries.push(InterfaceSummary {
            source,
            requests,
            responses: records.len() - requests,
            endpoints,
            request_ids: request_ids.len(),
            errors: store.errors().to_vec(),
        });
    }

    match output {
        OutputFormat::Text => {
            if summaries.is_empty() {
                println!("No interfaces under {}", interfaces_dir.display());
            }
            for s in &summaries {
                println!(
                    "{}: {} request(s), {} response(s), {} request id(s), {} error(s)",
                    s.source,
                    s.requests,
                    s.responses,
                    s.request_ids,
                    s.errors.len()
                );
                for (path, count) in &s.endpoints {
                    println!("  {:>6}  {}", count, path);
                }
                for e in &s.errors {
                    println!("  CORRUPT: {}", e);
                }
            }
        }
        OutputFormat::Json => {
            let pretty = serde_json::to_string_pretty(&summaries)
                .unwrap_or_else(|e| format!("serialization error: {}", e));
            println!("{}", pretty);
        }
    }
}
