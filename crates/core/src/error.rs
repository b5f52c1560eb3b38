use std::path::PathBuf;

use tracecheck_store::{DeserializationError, Source, StoreError};

/// Errors raised by the engine itself.
///
/// A validator that does not hold is not an error: it produces a failed
/// [`Outcome`](crate::validator::Outcome).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A record was offered to an interface that does not own its source.
    #[error("record from '{found}' offered to the '{expected}' interface")]
    SourceMismatch { expected: Source, found: Source },

    /// The interface already evaluated its queue.
    #[error("interface '{0}' is closed: its validators were already evaluated")]
    InterfaceClosed(Source),

    #[error("no '{0}' interface in this session")]
    UnknownInterface(Source),

    /// The session-end deserialization check found corrupt entries.
    #[error("{} deserialization error(s) on the '{interface}' interface", errors.len())]
    Deserialization {
        interface: Source,
        errors: Vec<DeserializationError>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid version: {0}")]
    Version(String),

    #[error("failed to compile schema '{name}': {message}")]
    Schema { name: String, message: String },

    /// A line of the weblog request journal could not be read back.
    #[error("{}:{line}: invalid journal entry: {message}", path.display())]
    Journal {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("test '{0}' issued a weblog call but the session has no weblog client")]
    NoWeblog(String),

    /// Replay mode was asked for a request the live run never recorded.
    #[error("no recorded weblog call #{index} for test '{test_id}'")]
    ReplayMiss { test_id: String, index: usize },

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }
}
