//! Error types
//!
//! Numeric kernels treat shape mismatches as programming errors and panic.
//! Everything that crosses a boundary (files, configuration, datasets) reports
//! through the types here instead.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure while reading a flat weight file.
///
/// The file carries no header, so the only checks possible are the byte count
/// against the architecture the caller expects.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read weight file: {0}")]
    Io(#[from] std::io::Error),
    #[error("weight file truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("weight file has trailing data: expected {expected} bytes, found {found}")]
    TrailingBytes { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("config serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed summary line: {0}")]
    Summary(String),
}

pub(crate) fn invalid_config(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}
