use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Errors that stop the store from reading its folder at all.
///
/// A corrupt entry is never a `StoreError`: it becomes a
/// [`DeserializationError`] and ingestion moves on.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The log folder given for replay does not exist.
    #[error("log folder not found: {}", path.display())]
    FolderNotFound { path: PathBuf },

    /// A file or folder could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// One entry of a log file that could not be turned into records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeserializationError {
    pub file: PathBuf,
    /// 1-based line for line-delimited files, `None` for whole-file documents.
    pub line: Option<usize>,
    pub message: String,
}

impl fmt::Display for DeserializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.file.display(), line, self.message),
            None => write!(f, "{}: {}", self.file.display(), self.message),
        }
    }
}
