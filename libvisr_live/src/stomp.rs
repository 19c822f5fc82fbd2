//! Minimal STOMP 1.2 client, enough to subscribe to a destination and receive messages.
//!
//! Frame layout:
//!
//! ```text
//! COMMAND\n
//! key:value\n        (repeated)
//! \n
//! body\0             (content-length bytes if the header is present)
//! ```
//!
//! Bare end-of-line bytes between frames are heart-beats and are skipped.

use std::sync::mpsc::Sender;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::StompError;
use super::watcher::{ChangeWatcher, Notice, QueueWatcher, TickTrigger};

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StompFrame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: vec![],
            body: vec![],
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    /// First value of a header; repeated headers after the first are ignored
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn escapes_headers(command: &str) -> bool {
        command != "CONNECT" && command != "CONNECTED"
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = Self::escapes_headers(&self.command);
        let mut out = Vec::with_capacity(self.body.len() + 64);
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (key, value) in self.headers.iter() {
            if escape {
                out.extend_from_slice(escape_header(key).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(key.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(StompError::MalformedFrame(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Incremental frame decoder over a byte stream
#[derive(Debug, Default)]
pub struct StompCodec {
    buffer: Vec<u8>,
}

impl StompCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Find the next line starting at `from`; returns the line (without EOL) and the index
    /// just past its newline
    fn line_at(&self, from: usize) -> Option<(&[u8], usize)> {
        let offset = self.buffer[from..].iter().position(|b| *b == b'\n')?;
        let mut line = &self.buffer[from..from + offset];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        Some((line, from + offset + 1))
    }

    /// Decode the next complete frame, or None if more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<StompFrame>, StompError> {
        let heartbeat = self
            .buffer
            .iter()
            .take_while(|b| **b == b'\n' || **b == b'\r')
            .count();
        self.buffer.drain(..heartbeat);
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let Some((command, mut pos)) = self.line_at(0) else {
            return Ok(None);
        };
        let command = String::from_utf8_lossy(command).into_owned();
        let escaped = StompFrame::escapes_headers(&command);

        let mut headers = vec![];
        loop {
            let Some((line, next)) = self.line_at(pos) else {
                return Ok(None);
            };
            pos = next;
            if line.is_empty() {
                break;
            }
            let line = String::from_utf8_lossy(line);
            let (key, value) = line.split_once(':').ok_or_else(|| {
                StompError::MalformedFrame(format!("header line without a colon: {line}"))
            })?;
            if escaped {
                headers.push((unescape_header(key)?, unescape_header(value)?));
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim()
                    .parse::<usize>()
                    .map_err(|_| StompError::MalformedFrame(format!("bad content-length {v}")))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                if self.buffer.len() < pos + len + 1 {
                    return Ok(None);
                }
                if self.buffer[pos + len] != 0 {
                    return Err(StompError::MalformedFrame(String::from(
                        "frame body is not NUL terminated",
                    )));
                }
                pos + len
            }
            None => match self.buffer[pos..].iter().position(|b| *b == 0) {
                Some(offset) => pos + offset,
                None => return Ok(None),
            },
        };

        let body = self.buffer[pos..body_end].to_vec();
        self.buffer.drain(..body_end + 1);
        Ok(Some(StompFrame {
            command,
            headers,
            body,
        }))
    }
}

/// Connection settings for the queue listener
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub address: String,
    pub login: String,
    pub passcode: String,
    pub destination: String,
    pub reconnect_delay: Duration,
}

/// A connected STOMP session
#[derive(Debug)]
pub struct StompClient {
    stream: TcpStream,
    codec: StompCodec,
}

impl StompClient {
    /// Connect and log in; fails if the broker answers with an ERROR frame
    pub async fn connect(address: &str, login: &str, passcode: &str) -> Result<Self, StompError> {
        let stream = TcpStream::connect(address).await?;
        let mut client = Self {
            stream,
            codec: StompCodec::new(),
        };
        let host = address.split(':').next().unwrap_or(address);
        let connect = StompFrame::new("CONNECT")
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("login", login)
            .with_header("passcode", passcode)
            .with_header("heart-beat", "0,0");
        client.send(&connect).await?;

        let reply = client.next_frame().await?;
        match reply.command.as_str() {
            "CONNECTED" => {
                log::info!(
                    "Connected to STOMP broker {address} (version {})",
                    reply.header("version").unwrap_or("unknown")
                );
                Ok(client)
            }
            _ => Err(StompError::ConnectRejected(
                reply
                    .header("message")
                    .map(String::from)
                    .unwrap_or_else(|| reply.body_text()),
            )),
        }
    }

    pub async fn send(&mut self, frame: &StompFrame) -> Result<(), StompError> {
        self.stream.write_all(&frame.encode()).await?;
        Ok(())
    }

    pub async fn subscribe(&mut self, destination: &str, id: &str) -> Result<(), StompError> {
        let frame = StompFrame::new("SUBSCRIBE")
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto");
        self.send(&frame).await?;
        log::info!("Subscribed to {destination}");
        Ok(())
    }

    /// Wait for the next frame from the broker
    pub async fn next_frame(&mut self) -> Result<StompFrame, StompError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.codec.next_frame()? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(StompError::ConnectionClosed);
            }
            self.codec.push(&chunk[..n]);
        }
    }
}

/// One connection's worth of listening. Returns Ok when the tick worker has gone away.
async fn listen_once(
    settings: &QueueSettings,
    watcher: &mut QueueWatcher,
    tx: &Sender<TickTrigger>,
) -> Result<(), StompError> {
    let mut client =
        StompClient::connect(&settings.address, &settings.login, &settings.passcode).await?;
    client.subscribe(&settings.destination, "1").await?;

    loop {
        let frame = client.next_frame().await?;
        match frame.command.as_str() {
            "MESSAGE" => {
                let body = frame.body_text();
                log::debug!("Received queue message: {body}");
                if let Some(trigger) = watcher.on_change(&Notice::QueueMessage(body)) {
                    if tx.send(trigger).is_err() {
                        return Ok(());
                    }
                }
            }
            "ERROR" => log::error!(
                "STOMP broker error: {} {}",
                frame.header("message").unwrap_or(""),
                frame.body_text()
            ),
            other => log::debug!("Ignoring STOMP frame {other}"),
        }
    }
}

/// Listen to the configured destination until the tick worker goes away, reconnecting
/// after failures
pub async fn run_queue_listener(
    settings: QueueSettings,
    mut watcher: QueueWatcher,
    tx: Sender<TickTrigger>,
) {
    loop {
        match listen_once(&settings, &mut watcher, &tx).await {
            Ok(()) => {
                log::info!("Queue listener stopping; tick worker has shut down");
                return;
            }
            Err(e) => log::warn!(
                "Queue listener failed: {e}. Reconnecting in {} s",
                settings.reconnect_delay.as_secs_f32()
            ),
        }
        tokio::time::sleep(settings.reconnect_delay).await;
    }
}
