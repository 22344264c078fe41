//! A scriptable SMTP server for delivery tests: fixed replies per
//! command, RCPT replies consumed in order, commands recorded for
//! assertions.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// The replies one connection will give. RCPT replies are consumed in
/// order, the last one repeating.
#[derive(Clone)]
pub struct Script {
    pub greeting: String,
    pub hello: String,
    pub mail: String,
    pub rcpt: Vec<String>,
    pub data: String,
    pub accept: String,
    pub quit: String,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: "220 mock ready".to_string(),
            hello: "250 mock at your service".to_string(),
            mail: "250 OK".to_string(),
            rcpt: vec!["250 OK".to_string()],
            data: "354 Go ahead".to_string(),
            accept: "250 OK".to_string(),
            quit: "220 bye".to_string(),
        }
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    commands: Arc<Mutex<Vec<String>>>,
}

impl MockServer {
    /// Bind an ephemeral port and serve the script to every
    /// connection.
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let record = Arc::clone(&commands);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let script = script.clone();
                let record = Arc::clone(&record);
                tokio::spawn(async move {
                    let _ = handle(stream, script, record).await;
                });
            }
        });

        Self { addr, commands }
    }

    /// Everything clients have sent, one entry per command line, with
    /// message bodies recorded as a single `<body>` entry.
    pub async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }
}

async fn handle(
    mut stream: TcpStream,
    script: Script,
    record: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (read, mut writer) = stream.split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    let mut rcpt_index = 0usize;

    writer.write_all(script.greeting.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim().to_string();
        record.lock().await.push(command.clone());

        let verb = command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let reply = match verb.as_str() {
            "EHLO" | "HELO" => script.hello.clone(),
            "MAIL" => script.mail.clone(),
            "RCPT" => {
                let reply = script.rcpt[rcpt_index.min(script.rcpt.len() - 1)].clone();
                rcpt_index += 1;
                reply
            }
            "DATA" => {
                writer.write_all(script.data.as_bytes()).await?;
                writer.write_all(b"\r\n").await?;
                if script.data.starts_with("354") {
                    let mut body = String::new();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                        if line.trim_end() == "." {
                            break;
                        }
                        body.push_str(&line);
                    }
                    record.lock().await.push(format!("<body:{}b>", body.len()));
                    writer.write_all(script.accept.as_bytes()).await?;
                    writer.write_all(b"\r\n").await?;
                }
                continue;
            }
            "QUIT" => {
                writer.write_all(script.quit.as_bytes()).await?;
                writer.write_all(b"\r\n").await?;
                return Ok(());
            }
            _ => "500 Unknown command".to_string(),
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
}
