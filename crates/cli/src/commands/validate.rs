use std::path::Path;
use std::process;

use tracecheck_core::SchemaValidator;
use tracecheck_store::{RecordStore, Source};

use crate::{report_error, OutputFormat};

pub(crate) fn cmd_validate(
    file: &Path,
    source: Source,
    allowed_errors: &[String],
    output: OutputFormat,
    quiet: bool,
) {
    if !file.is_file() {
        report_error(
            &format!("error reading file '{}': not a file", file.display()),
            output,
            quiet,
        );
        process::exit(1);
    }

    let validator = match SchemaValidator::new() {
        Ok(v) => v,
        Err(e) => {
            report_error(&format!("internal error: {}", e), output, quiet);
            process::exit(1);
        }
    };

    let folder = file.parent().unwrap_or_else(|| Path::new("."));
    let mut store = RecordStore::new(source, folder);
    let ingested = store.ingest_file(file).and_then(|_| store.flush());
    if let Err(e) = ingested {
        report_error(&format!("error: {}", e), output, quiet);
        process::exit(1);
    }
    let records = store.drain();
    let errors = store.errors().to_vec();
    let report = validator.validate(&records, allowed_errors);
    let clean = report.violations.is_empty() && errors.is_empty();

    match output {
        OutputFormat::Text => {
            if !quiet || !clean {
                println!(
                    "{}: {} record(s), {} checked, {} violation(s), {} tolerated, {} corrupt entr{}",
                    file.display(),
                    records.len(),
                    report.checked,
                    report.violations.len(),
                    report.tolerated.len(),
                    errors.len(),
                    if errors.len() == 1 { "y" } else { "ies" }
                );
            }
            for v in &report.violations {
                println!(
                    "  FAIL [#{} {}]: {} at '{}': {}",
                    v.seq, v.path, v.schema, v.pointer, v.message
                );
                println!("    key: {}", v.key);
            }
            for e in &errors {
                println!("  CORRUPT: {}", e);
            }
        }
        OutputFormat::Json => {
            let value = serde_json::json!({
                "file": file.display().to_string(),
                "source": source,
                "records": records.len(),
                "schemas": report,
                "deserialization_errors": errors,
                "valid": clean,
            });
            let pretty = serde_json::to_string_pretty(&value)
                .unwrap_or_else(|e| format!("serialization error: {}", e));
            println!("{}", pretty);
        }
    }

    if !clean {
        process::exit(1);
    }
}
