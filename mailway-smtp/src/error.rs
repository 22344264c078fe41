use std::io;

use thiserror::Error;

/// Errors terminating an inbound session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The underlying connection failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The client sent a command line past the protocol limit.
    #[error("Line too long")]
    LineTooLong,

    /// The client went silent past the read deadline.
    #[error("Read timed out")]
    Timeout,

    /// Staging or committing the submission failed.
    #[error(transparent)]
    Spool(#[from] mailway_spool::SpoolError),
}
