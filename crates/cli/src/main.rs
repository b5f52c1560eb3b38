mod commands;
mod logging;
mod tap;

use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracecheck_core::{EngineError, HarnessConfig, Source};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Conformance harness for tracing libraries.
#[derive(Parser)]
#[command(
    name = "tracecheck",
    version,
    about = "Conformance harness for tracing libraries: validates captured traffic"
)]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log more (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Configuration file plus the flags that override it.
#[derive(Args, Debug)]
pub(crate) struct ConfigArgs {
    /// Path to a TOML harness configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Tracing library under test, optionally `name@version`
    #[arg(long)]
    library: Option<String>,
    /// Upper bound on waiting for data, in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Delay between two scans of an interface folder, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Schema violation key to tolerate (`<path>#<pointer>`); repeatable
    #[arg(long = "allow-error")]
    allow_errors: Vec<String>,
}

impl ConfigArgs {
    pub(crate) fn resolve(&self) -> Result<HarnessConfig, EngineError> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(library) = &self.library {
            let (name, version) = match library.split_once('@') {
                Some((name, version)) => (name, Some(version.to_string())),
                None => (library.as_str(), None),
            };
            config.scenario.library = Some(name.to_string());
            config.scenario.library_version = version;
        }
        if let Some(timeout) = self.timeout {
            config.engine.timeout_s = timeout;
        }
        if let Some(poll) = self.poll_interval_ms {
            config.engine.poll_interval_ms = poll;
        }
        config
            .schemas
            .allowed_errors
            .extend(self.allow_errors.iter().cloned());
        config.check()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Re-evaluate a finished run's log folder
    Replay {
        /// Log folder of the run (contains interfaces/<source>/)
        log_folder: PathBuf,
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Follow a log folder a proxy is writing to, until it goes quiet
    Watch {
        /// Log folder the proxy writes to
        log_folder: PathBuf,
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Schema-validate every record of one log file
    Validate {
        /// Path to the log file
        file: PathBuf,
        /// Traffic source the file was captured from
        #[arg(long, default_value = "library")]
        source: Source,
        /// Schema violation key to tolerate; repeatable
        #[arg(long = "allow-error")]
        allow_errors: Vec<String>,
    },

    /// Summarize what a log folder holds, per interface
    Inspect {
        /// Log folder of the run
        log_folder: PathBuf,
    },

    /// Dump the spans correlated with a request id
    Spans {
        /// Log folder of the run
        log_folder: PathBuf,
        /// Request id to look for
        #[arg(long)]
        rid: String,
        /// Include every span of the matched traces
        #[arg(long)]
        full_trace: bool,
        /// Interface to search
        #[arg(long, default_value = "library")]
        source: Source,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Replay { log_folder, config } => {
            commands::replay::cmd_replay(&log_folder, &config, cli.output, cli.quiet);
        }
        Commands::Watch { log_folder, config } => {
            commands::watch::cmd_watch(&log_folder, &config, cli.output, cli.quiet);
        }
        Commands::Validate {
            file,
            source,
            allow_errors,
        } => {
            commands::validate::cmd_validate(&file, source, &allow_errors, cli.output, cli.quiet);
        }
        Commands::Inspect { log_folder } => {
            commands::inspect::cmd_inspect(&log_folder, cli.output, cli.quiet);
        }
        Commands::Spans {
            log_folder,
            rid,
            full_trace,
            source,
        } => {
            commands::spans::cmd_spans(&log_folder, source, &rid, full_trace, cli.output, cli.quiet);
        }
    }
}

/// Exit 1 with `msg` when `folder` is not a directory.
pub(crate) fn require_folder(folder: &Path, output: OutputFormat, quiet: bool) {
    if !folder.is_dir() {
        let msg = format!("error: log folder not found: {}", folder.display());
        report_error(&msg, output, quiet);
        process::exit(1);
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
