//! SMTP protocol handling, both directions.
//!
//! [`session`] implements the inbound command loop that turns accepted
//! submissions into spooled envelopes; [`server`] owns the listener and
//! the session admission gate; [`client`] speaks the outbound half used
//! by the delivery engine.

pub mod client;
pub mod error;
pub mod server;
pub mod session;

pub use client::{ClientError, Response, SmtpClient};
pub use error::SessionError;
pub use server::Server;
pub use session::Session;
