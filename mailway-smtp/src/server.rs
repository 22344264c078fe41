//! The inbound listener and its session admission gate.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use mailway_common::relay::RelayTable;
use mailway_spool::Spool;

use crate::error::SessionError;
use crate::session::Session;

/// The inbound SMTP service. Concurrent sessions are capped by a
/// semaphore; a connection past the cap is turned away with a 421
/// before any greeting.
pub struct Server {
    socket: SocketAddr,
    spool: Spool,
    relay: Arc<RelayTable>,
    sessions: Arc<Semaphore>,
}

impl Server {
    #[must_use]
    pub fn new(socket: SocketAddr, max_sessions: usize, spool: Spool, relay: RelayTable) -> Self {
        Self {
            socket,
            spool,
            relay: Arc::new(relay),
            sessions: Arc::new(Semaphore::new(max_sessions)),
        }
    }

    /// Accept connections until the task is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error when the listening socket cannot be bound or
    /// accepting fails.
    pub async fn serve(self) -> Result<(), SessionError> {
        let listener = TcpListener::bind(self.socket).await?;
        info!("Listening on {}", self.socket);

        loop {
            let (mut stream, address) = listener.accept().await?;
            debug!("Connection received from {address}");

            let Ok(permit) = Arc::clone(&self.sessions).try_acquire_owned() else {
                warn!("{address}: session limit reached, turning away");
                let _ = stream
                    .write_all(b"421 Service temporarily unavailable\r\n")
                    .await;
                continue;
            };

            let session = Session::new(
                stream,
                address.ip().to_string(),
                self.spool.clone(),
                Arc::clone(&self.relay),
            );
            tokio::spawn(async move {
                if let Err(err) = session.serve().await {
                    warn!("{address}: session ended: {err}");
                }
                drop(permit);
            });
        }
    }
}
