//! Outbound delivery: the queue sweeper, host resolution, the per-host
//! SMTP transaction, and bounce generation.

pub mod bounce;
pub mod dns;
pub mod engine;
pub mod error;
pub mod transaction;

pub use dns::{DnsError, MailHost, Resolver};
pub use engine::DeliveryEngine;
pub use error::DeliveryError;
