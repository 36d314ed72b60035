//! Error types for report indexing, loading and filtering

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReportError>;

#[derive(Debug, Error)]
pub enum ReportError {
    /// Report root is missing or not a directory
    #[error("invalid report directory: {}", path.display())]
    InvalidDirectory { path: PathBuf },

    /// One report file could not be deserialized
    #[error("malformed report {}: {details}", path.display())]
    MalformedReport { path: PathBuf, details: String },

    /// A host or mode selector matched nothing
    #[error("invalid selection '{selector}': {details}")]
    InvalidSelection { selector: String, details: String },

    /// A stale report could not be removed
    #[error("failed to delete {}: {source}", path.display())]
    DeletionFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A custom filter clause or tag pattern could not be parsed
    #[error("invalid filter '{clause}': {details}")]
    InvalidFilter { clause: String, details: String },

    #[error("io failure at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReportError {
    /// Structural failures abort the run; everything else is isolated per file or per selector.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReportError::InvalidDirectory { .. } | ReportError::InvalidFilter { .. } | ReportError::Io { .. })
    }

    pub fn is_selection(&self) -> bool {
        matches!(self, ReportError::InvalidSelection { .. })
    }
}
