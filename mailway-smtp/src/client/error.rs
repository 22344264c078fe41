use std::io;

use thiserror::Error;

use super::response::Response;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised while speaking to a remote SMTP server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server closed the connection mid-dialogue.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// The per-operation deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// The server's reply did not match the SMTP line format.
    #[error("Malformed reply: {0}")]
    Malformed(String),

    /// A well-formed reply outside the expected class.
    #[error("{}", .0.text())]
    Rejected(Response),
}

impl ClientError {
    /// A 5xx rejection means no retry will help; everything else is
    /// worth another attempt later.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected(response) if response.is_permanent_error())
    }
}
