pub mod envelope;
pub mod error;
pub mod spool;

pub use envelope::{dispose, BounceRequest, DeliveryNote, Envelope, QueueName, QueuePolicy, Record};
pub use error::{Result, SpoolError};
pub use spool::Spool;
