//! The inbound SMTP command loop.
//!
//! One session serves one connection. Accepted transactions are staged
//! under a per-session directory in the spool and committed into the
//! outbound queue when the end-of-data dot arrives, so an aborted
//! connection never leaves half a submission in the queue.

use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use tokio::fs::{self, File};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};
use tokio::time::timeout;
use tracing::{debug, warn};

use mailway_common::address::{self, MessageId};
use mailway_common::relay::RelayTable;
use mailway_spool::{Envelope, QueueName, Record, Spool};

use crate::error::SessionError;

/// RFC 5321 allows 512 octets for command lines; we accept a bit more
/// slack but never buffer an unbounded line.
const MAX_LINE: usize = 4096;

/// Idle clients are cut after this long without a complete line.
const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Protocol or relay errors past this count drop the connection.
const MAX_ERRORS: u8 = 2;

/// Protocol position within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum State {
    Closed,
    Greeting,
    Greeted,
    HaveSender,
    InData,
}

/// Per-connection protocol state.
pub struct Session<Stream> {
    stream: BufStream<Stream>,
    /// Client address, for logging.
    peer: String,
    /// Session id; doubles as the staging directory name and the
    /// committed message id prefix.
    id: MessageId,
    /// Transaction counter within the session, starting at 1. The
    /// suffix `0` is reserved for bounce envelopes.
    seq: u32,
    state: State,
    sender: String,
    recipients: AHashSet<String>,
    body: Option<File>,
    protocol_errors: u8,
    relay_errors: u8,
    spool: Spool,
    relay: Arc<RelayTable>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    #[must_use]
    pub fn new(stream: Stream, peer: String, spool: Spool, relay: Arc<RelayTable>) -> Self {
        Self {
            stream: BufStream::new(stream),
            peer,
            id: MessageId::generate(),
            seq: 1,
            state: State::Greeting,
            sender: String::new(),
            recipients: AHashSet::new(),
            body: None,
            protocol_errors: 0,
            relay_errors: 0,
            spool,
            relay,
        }
    }

    /// Drive the connection until the client quits, errs out, or goes
    /// quiet. Uncommitted staged state is discarded on the way out.
    ///
    /// # Errors
    ///
    /// Returns an error for I/O failures, an overlong line, or a read
    /// timeout; a clean client disconnect is not an error.
    pub async fn serve(mut self) -> Result<(), SessionError> {
        let outcome = self.run().await;
        self.body.take();
        if let Err(err) = self.spool.discard(self.id.as_str()).await {
            warn!("{}: staging cleanup failed: {err}", self.peer);
        }
        outcome
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        self.send("220 Service ready").await?;
        loop {
            let line = match timeout(READ_TIMEOUT, self.read_line()).await {
                Ok(read) => read?,
                Err(_) => return Err(SessionError::Timeout),
            };
            let Some(line) = line else {
                // Client closed its end without QUIT.
                break;
            };
            if let Some(reply) = self.handle(&line).await {
                debug!("{}< {reply}", self.peer);
                self.send(&reply).await?;
            }
            if self.state == State::Closed
                || self.protocol_errors > MAX_ERRORS
                || self.relay_errors > MAX_ERRORS
            {
                if self.protocol_errors > 0 || self.relay_errors > 0 {
                    warn!(
                        "{}: ERROR! P={}, R={}",
                        self.peer, self.protocol_errors, self.relay_errors
                    );
                }
                break;
            }
        }
        Ok(())
    }

    /// Read one CRLF-terminated line, bounded by [`MAX_LINE`]. The
    /// bytes come back raw: message bodies must reach the spool
    /// unmodified, so decoding is left to the command dispatcher.
    /// `Ok(None)` means the client closed the connection.
    async fn read_line(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let mut buf = Vec::new();
        let read = (&mut self.stream)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if !buf.ends_with(b"\n") {
            return if buf.len() > MAX_LINE {
                Err(SessionError::LineTooLong)
            } else {
                // EOF mid-line.
                Ok(None)
            };
        }
        while buf.last().is_some_and(|byte| matches!(byte, b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(buf))
    }

    async fn send(&mut self, reply: &str) -> Result<(), SessionError> {
        self.stream.write_all(reply.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Process one line, returning the reply to send (body lines get
    /// none). While in DATA the raw bytes are appended verbatim, 8-bit
    /// mail included; only command lines are decoded for parsing.
    /// Staging failures surface as a 421 rather than an error.
    async fn handle(&mut self, line: &[u8]) -> Option<String> {
        if self.state == State::InData {
            if line == b"." {
                return Some(self.finish_data().await);
            }
            if let Some(file) = self.body.as_mut() {
                let mut chunk = Vec::with_capacity(line.len() + 2);
                chunk.extend_from_slice(b"\r\n");
                chunk.extend_from_slice(line);
                if let Err(err) = file.write_all(&chunk).await {
                    warn!("{}: ERROR! {err}", self.peer);
                    self.state = State::Closed;
                    return Some("421 Service temporarily unavailable".to_string());
                }
            }
            return None;
        }

        let line = String::from_utf8_lossy(line);
        debug!("{}> {line}", self.peer);
        let (verb, param) = line.split_once(' ').unwrap_or((line.as_ref(), ""));
        match verb.to_ascii_uppercase().as_str() {
            "EHLO" | "HELO" => {
                self.state = State::Greeted;
                Some("250 At your service".to_string())
            }
            "MAIL" => {
                if self.state < State::Greeted {
                    self.protocol_errors += 1;
                    return Some(self.expects());
                }
                match address::normalize(param) {
                    Some((command, addr)) if command == "FROM" => {
                        debug!("{}>   =[{addr}]", self.peer);
                        self.sender = addr;
                        self.state = State::HaveSender;
                        Some("250 OK".to_string())
                    }
                    _ => {
                        self.protocol_errors += 1;
                        Some("500 Syntax error".to_string())
                    }
                }
            }
            "RCPT" => {
                if self.state < State::HaveSender {
                    self.protocol_errors += 1;
                    return Some(self.expects());
                }
                match address::normalize(param) {
                    Some((command, addr)) if command == "TO" => {
                        debug!("{}>   =[{addr}]", self.peer);
                        match self.relay.authorize(&addr, &self.sender) {
                            Ok(expanded) => {
                                for recipient in expanded {
                                    debug!("{}>   =>{recipient}", self.peer);
                                    self.recipients.insert(recipient);
                                }
                                Some("250 OK".to_string())
                            }
                            Err(denied) => {
                                self.relay_errors += 1;
                                Some(format!("553 {denied}"))
                            }
                        }
                    }
                    _ => {
                        self.protocol_errors += 1;
                        Some("500 Syntax error".to_string())
                    }
                }
            }
            "DATA" => {
                if self.state < State::HaveSender || self.recipients.is_empty() {
                    self.protocol_errors += 1;
                    return Some(self.expects());
                }
                match self.prepare_staging().await {
                    Ok(()) => {
                        self.state = State::InData;
                        Some("354 Go ahead".to_string())
                    }
                    Err(err) => {
                        warn!("{}: ERROR! {err}", self.peer);
                        self.state = State::Closed;
                        Some("421 Service temporarily unavailable".to_string())
                    }
                }
            }
            "RSET" => {
                self.body.take();
                if let Err(err) = self.spool.discard(self.id.as_str()).await {
                    warn!("{}: staging flush failed: {err}", self.peer);
                }
                self.sender.clear();
                self.recipients.clear();
                self.state = State::Greeted;
                Some("250 Flushed".to_string())
            }
            "NOOP" => Some("250 OK".to_string()),
            "QUIT" => {
                self.state = State::Closed;
                Some("220 closing connection".to_string())
            }
            _ => {
                self.protocol_errors += 1;
                Some("502 Command not implemented".to_string())
            }
        }
    }

    /// The "bad sequence" reply, naming what would be accepted now.
    fn expects(&self) -> String {
        let commands = match self.state {
            State::Greeting => "EHLO, HELO",
            State::Greeted => "MAIL",
            _ if self.recipients.is_empty() => "RCPT",
            _ => "",
        };
        if commands.is_empty() {
            "503 Bad sequence of commands".to_string()
        } else {
            format!("503 Bad sequence of commands, expecting: {commands}")
        }
    }

    /// Stage one envelope per destination domain plus the shared body
    /// file, seeded with a synthesized `Received:` header.
    async fn prepare_staging(&mut self) -> Result<(), SessionError> {
        let staging = self.spool.staging_dir(self.id.as_str());
        fs::create_dir_all(&staging).await.map_err(mailway_spool::SpoolError::from)?;

        let from_domain = address::domain_of(&self.sender).unwrap_or("localhost").to_string();
        let origin = format!("postmaster@{from_domain}");

        let mut by_domain: AHashMap<String, Vec<String>> = AHashMap::new();
        for recipient in &self.recipients {
            if let Some(domain) = address::domain_of(recipient) {
                by_domain.entry(domain.to_string()).or_default().push(recipient.clone());
            }
        }
        for (domain, mut recipients) in by_domain {
            recipients.sort_unstable();
            let name = QueueName {
                id: self.seq.to_string(),
                domain,
                schedule: 0,
            };
            let record = Record {
                sender: self.sender.clone(),
                recipients,
                attempted: 0,
                origin: origin.clone(),
            };
            Envelope::create(&staging, &name, &record).await?;
        }

        let mut file = File::create(staging.join(format!("{}.msg", self.seq)))
            .await
            .map_err(mailway_spool::SpoolError::from)?;
        let header = format!(
            "Received: from {} by {from_domain}; {}",
            self.peer,
            chrono::Local::now().to_rfc2822()
        );
        file.write_all(header.as_bytes())
            .await
            .map_err(mailway_spool::SpoolError::from)?;
        self.body = Some(file);
        Ok(())
    }

    /// End of data: close the body, commit the staged transaction into
    /// the outbound queue, and reset for the next transaction.
    async fn finish_data(&mut self) -> String {
        if let Some(mut file) = self.body.take()
            && let Err(err) = file.flush().await
        {
            warn!("{}: ERROR! {err}", self.peer);
            self.state = State::Closed;
            return "421 Service temporarily unavailable".to_string();
        }
        match self.spool.commit(self.id.as_str()).await {
            Ok(queued) => {
                debug!("{}: envelope(s) queued: {queued}", self.peer);
                self.seq += 1;
                self.sender.clear();
                self.recipients.clear();
                self.state = State::Greeted;
                "250 OK".to_string()
            }
            Err(err) => {
                warn!("{}: ERROR! {err}", self.peer);
                self.state = State::Closed;
                "421 Service temporarily unavailable".to_string()
            }
        }
    }
}
