use std::io;

use thiserror::Error;

use crate::dns::DnsError;

/// Errors surfacing from the delivery engine itself. Failures against
/// a single envelope are folded into that envelope's error state
/// instead and never escalate here.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error(transparent)]
    Spool(#[from] mailway_spool::SpoolError),
}
