//! Harness configuration, read from a TOML file.
//!
//! Every key has a default so an empty file (or no file) is a valid
//! configuration:
//!
//! ```toml
//! [scenario]
//! name = "DEFAULT"
//! library = "python"
//! library_version = "2.9.0"
//!
//! [engine]
//! poll_interval_ms = 200
//! quiescence_ms = 1000
//! timeout_s = 60
//! agent_timeout_s = 5
//! backend_timeout_s = 0
//!
//! [schemas]
//! allowed_errors = ["/v0.4/traces#/*/*/meta/http.status_code"]
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use tracecheck_store::Source;

use crate::error::EngineError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub scenario: ScenarioConfig,
    pub engine: EngineConfig,
    pub schemas: SchemaConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    pub name: String,
    pub library: Option<String>,
    pub library_version: Option<String>,
    pub weblog_variant: Option<String>,
    pub agent_version: Option<String>,
    pub features: Vec<String>,
    /// Number of auxiliary weblogs, each captured on its own interface.
    pub buddies: u8,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            name: "DEFAULT".to_string(),
            library: None,
            library_version: None,
            weblog_variant: None,
            agent_version: None,
            features: Vec::new(),
            buddies: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Delay between two scans of an interface folder.
    pub poll_interval_ms: u64,
    /// How long an interface must stay silent before its data is complete.
    pub quiescence_ms: u64,
    /// Upper bound on the whole teardown wait.
    pub timeout_s: u64,
    /// Teardown wait on the library interface. Unset: the library's usual
    /// flush delay.
    pub library_timeout_s: Option<u64>,
    pub agent_timeout_s: u64,
    pub backend_timeout_s: u64,
    pub open_telemetry_timeout_s: u64,
    /// Buddies are waited after the library, so by then they are done.
    pub buddies_timeout_s: u64,
    /// Attribute root spans without a request id to requests by timing.
    pub timing_fallback: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            poll_interval_ms: 200,
            quiescence_ms: 1000,
            timeout_s: 60,
            library_timeout_s: None,
            agent_timeout_s: 5,
            backend_timeout_s: 0,
            open_telemetry_timeout_s: 0,
            buddies_timeout_s: 0,
            timing_fallback: false,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    /// How long teardown waits on `source` for a session testing `library`.
    pub fn interface_timeout(&self, source: Source, library: Option<&str>) -> Duration {
        let seconds = match source {
            Source::Library => self
                .library_timeout_s
                .unwrap_or_else(|| default_library_timeout_s(library)),
            Source::Agent => self.agent_timeout_s,
            Source::Backend => self.backend_timeout_s,
            Source::OpenTelemetry => self.open_telemetry_timeout_s,
            Source::Buddy(_) => self.buddies_timeout_s,
        };
        Duration::from_secs(seconds)
    }
}

/// Time tracers usually take to flush their last payloads.
fn default_library_timeout_s(library: Option<&str>) -> u64 {
    match library {
        Some("java") | Some("python") => 25,
        Some("golang") | Some("php") => 10,
        Some("nodejs") | Some("ruby") => 0,
        _ => 40,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchemaConfig {
    /// Known schema violations to tolerate, as `<path>#<pointer>` keys.
    pub allowed_errors: Vec<String>,
}

impl HarnessConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, EngineError> {
        let config: HarnessConfig =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        HarnessConfig::from_toml_str(&content).map_err(|e| match e {
            EngineError::Config(msg) => {
                EngineError::Config(format!("could not parse '{}': {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Reject values the engine cannot work with.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.engine.poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "engine.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if let Some(library) = &self.scenario.library {
            if library.contains('@') {
                return Err(EngineError::Config(format!(
                    "scenario.library '{}' must not contain '@'",
                    library
                )));
            }
        }
        for key in &self.schemas.allowed_errors {
            if !key.contains('#') {
                return Err(EngineError::Config(format!(
                    "allowed error '{}' must have the form <path>#<pointer>",
                    key
                )));
            }
        }
        Ok(())
    }
}
