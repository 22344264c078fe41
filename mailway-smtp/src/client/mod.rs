//! The outbound half of the protocol, used by the delivery engine to
//! hand mail to a remote server.

pub mod error;
pub mod response;

pub use error::ClientError;
pub use response::Response;

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use error::Result;
use response::ReplyBuilder;

/// Reply lines past this length are treated as garbage.
const MAX_LINE: usize = 4096;

/// An SMTP client dialogue over one connection. Every read and write
/// carries the per-operation deadline given at construction.
pub struct SmtpClient<Stream = TcpStream> {
    stream: BufStream<Stream>,
    deadline: Duration,
}

impl SmtpClient<TcpStream> {
    /// Connect to `host:port` and wait for a 2xx greeting.
    ///
    /// # Errors
    ///
    /// Returns an error when the connection or the greeting fails.
    pub async fn connect(host: IpAddr, port: u16, deadline: Duration) -> Result<Self> {
        let stream = timeout(deadline, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let mut client = Self::from_stream(stream, deadline);
        let greeting = client.read_reply().await?;
        if greeting.is_success() {
            Ok(client)
        } else {
            Err(ClientError::Rejected(greeting))
        }
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> SmtpClient<Stream> {
    /// Wrap an established stream. The greeting is not consumed.
    #[must_use]
    pub fn from_stream(stream: Stream, deadline: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            deadline,
        }
    }

    /// Introduce ourselves: EHLO first, HELO when the server rejects
    /// it.
    ///
    /// # Errors
    ///
    /// Returns an error when both greetings are rejected or I/O fails.
    pub async fn hello(&mut self, local_domain: &str) -> Result<Response> {
        match self.exchange(&format!("EHLO {local_domain}"), Response::is_success).await {
            Ok(reply) => Ok(reply),
            Err(ClientError::Rejected(_)) => {
                self.exchange(&format!("HELO {local_domain}"), Response::is_success)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// # Errors
    ///
    /// Returns an error when the sender is rejected or I/O fails.
    pub async fn mail_from(&mut self, sender: &str) -> Result<Response> {
        self.exchange(&format!("MAIL FROM:<{sender}>"), Response::is_success)
            .await
    }

    /// # Errors
    ///
    /// Returns an error when the recipient is rejected or I/O fails.
    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<Response> {
        self.exchange(&format!("RCPT TO:<{recipient}>"), Response::is_success)
            .await
    }

    /// Send DATA, expecting the 354 go-ahead.
    ///
    /// # Errors
    ///
    /// Returns an error when the server declines or I/O fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.exchange("DATA", Response::is_intermediate).await
    }

    /// Stream the message body verbatim and terminate it with the
    /// dot line, expecting the 2xx acceptance.
    ///
    /// # Errors
    ///
    /// Returns an error when the message is rejected or I/O fails.
    pub async fn send_body(&mut self, body: &[u8]) -> Result<Response> {
        timeout(self.deadline, async {
            self.stream.write_all(body).await?;
            self.stream.write_all(b"\r\n.\r\n").await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout)??;
        let reply = self.read_reply().await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(ClientError::Rejected(reply))
        }
    }

    /// # Errors
    ///
    /// Returns an error when the farewell is rejected or I/O fails.
    pub async fn quit(&mut self) -> Result<Response> {
        self.exchange("QUIT", Response::is_success).await
    }

    async fn exchange(
        &mut self,
        command: &str,
        accept: impl Fn(&Response) -> bool,
    ) -> Result<Response> {
        debug!("cli> {command}");
        timeout(self.deadline, async {
            self.stream.write_all(command.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        let reply = self.read_reply().await?;
        if accept(&reply) {
            Ok(reply)
        } else {
            Err(ClientError::Rejected(reply))
        }
    }

    /// Read one complete (possibly multi-line) reply.
    async fn read_reply(&mut self) -> Result<Response> {
        let mut builder = ReplyBuilder::default();
        loop {
            let line = timeout(self.deadline, self.read_line())
                .await
                .map_err(|_| ClientError::Timeout)??;
            if line.is_empty() {
                continue;
            }
            debug!("<svr {line}");
            if let Some(reply) = builder.push(&line)? {
                return Ok(reply);
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let read = (&mut self.stream)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        if buf.len() > MAX_LINE {
            return Err(ClientError::Malformed(format!(
                "reply line too long: {}...",
                String::from_utf8_lossy(&buf[..20])
            )));
        }
        while buf.last().is_some_and(|byte| matches!(byte, b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
