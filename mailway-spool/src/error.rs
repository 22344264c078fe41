//! Error types for queue operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Envelope body could not be encoded or decoded.
    #[error("Envelope serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A queue file name does not follow `<id>@<domain>@<base36>.env`.
    #[error("Invalid queue file name: {0}")]
    InvalidName(String),

    /// An envelope references a message body that is missing.
    #[error("Missing message content: {0}")]
    MissingContent(PathBuf),
}

pub type Result<T> = std::result::Result<T, SpoolError>;
