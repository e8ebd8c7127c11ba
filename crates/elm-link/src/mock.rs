//! Scripted ELM327 adapter for tests
//!
//! [`MockConnector`] hands the transport one end of an in-memory duplex
//! pipe and serves the other end with a [`MockAdapter`]: commands are read
//! up to each carriage return and answered by a programmable responder,
//! including continuous `ATMA`-style frame streams that stop on the next
//! received byte, the way the real firmware does.

use crate::config::LinkConfig;
use crate::connector::{AdapterStream, Connector};
use crate::error::LinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Address scheme accepted by [`MockConnector`]
pub const MOCK_SCHEME: &str = "mock://";

const PIPE_CAPACITY: usize = 16 * 1024;

/// What the adapter does after receiving one command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Write the text verbatim
    Text(String),
    /// Write `head`, then one frame per `interval` until any byte arrives
    Stream {
        head: String,
        frames: Vec<String>,
        interval: Duration,
        repeat: bool,
    },
    /// Say nothing
    Silent,
}

impl MockReply {
    /// Standard reply with echo on: `cmd`, body lines, blank line, prompt
    pub fn echoed(command: &str, lines: &[&str]) -> Self {
        let mut text = format!("{command}\r");
        for line in lines {
            text.push_str(line);
            text.push('\r');
        }
        text.push_str("\r>");
        MockReply::Text(text)
    }
}

type Responder = dyn Fn(&str) -> MockReply + Send + Sync;

/// A scripted adapter. Clones share the responder and the command log.
#[derive(Clone)]
pub struct MockAdapter {
    responder: Arc<Responder>,
    received: Arc<Mutex<Vec<String>>>,
}

impl MockAdapter {
    pub fn new(responder: impl Fn(&str) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// ELM327 v1.5 with echo, headers and spaces on, talking to a CAN
    /// (11-bit, 500 kbaud) vehicle
    pub fn echoing() -> Self {
        Self::new(elm327_reply)
    }

    /// Never answers anything
    pub fn silent() -> Self {
        Self::new(|_| MockReply::Silent)
    }

    /// Answers every command with the same raw text
    pub fn fixed(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| MockReply::Text(text.clone()))
    }

    /// Every non-empty command line received, in order
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// How many times `command` was received
    pub fn count(&self, command: &str) -> usize {
        self.received.lock().iter().filter(|c| *c == command).count()
    }

    fn reply_to(&self, command: &str) -> MockReply {
        if !command.is_empty() {
            self.received.lock().push(command.to_string());
        }
        (self.responder)(command)
    }

    /// Serve one end of a duplex pipe until it closes
    pub async fn serve(self, mut port: DuplexStream) {
        let mut line = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match port.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                match byte {
                    b'\r' => {
                        let command = String::from_utf8_lossy(&line).trim().to_uppercase();
                        line.clear();
                        if !self.answer(&mut port, &command).await {
                            return;
                        }
                    }
                    b'\n' => {}
                    other => line.push(other),
                }
            }
        }
    }

    async fn answer(&self, port: &mut DuplexStream, command: &str) -> bool {
        match self.reply_to(command) {
            MockReply::Text(text) => port.write_all(text.as_bytes()).await.is_ok(),
            MockReply::Silent => true,
            MockReply::Stream {
                head,
                frames,
                interval,
                repeat,
            } => {
                if port.write_all(head.as_bytes()).await.is_err() {
                    return false;
                }
                stream_frames(port, &frames, interval, repeat).await
            }
        }
    }
}

/// Emit frames until interrupted by any incoming byte
async fn stream_frames(
    port: &mut DuplexStream,
    frames: &[String],
    interval: Duration,
    repeat: bool,
) -> bool {
    let mut next = 0;
    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            read = port.read(&mut buf) => {
                return match read {
                    Ok(0) | Err(_) => false,
                    Ok(_) => port.write_all(b"\rSTOPPED\r\r>").await.is_ok(),
                };
            }
            _ = tokio::time::sleep(interval) => {
                if next < frames.len() {
                    let line = format!("{}\r", frames[next]);
                    if port.write_all(line.as_bytes()).await.is_err() {
                        return false;
                    }
                    next += 1;
                    if repeat && next == frames.len() {
                        next = 0;
                    }
                }
            }
        }
    }
}

/// Canned ELM327 behavior used by [`MockAdapter::echoing`]
pub fn elm327_reply(command: &str) -> MockReply {
    match command {
        "" => MockReply::Text(">".to_string()),
        "ATZ" | "ATWS" => MockReply::echoed(command, &["", "ELM327 v1.5"]),
        "ATI" => MockReply::echoed(command, &["ELM327 v1.5"]),
        "ATDPN" => MockReply::echoed(command, &["A6"]),
        "ATRV" => MockReply::echoed(command, &["12.6V"]),
        "ATMA" => MockReply::Stream {
            head: "ATMA\r".to_string(),
            frames: vec![
                "7E8 04 41 0C 1A F8".to_string(),
                "3E9 00 3F 12 A0 00 00 00 00".to_string(),
                "18 DA F1 10 03 41 0D 28".to_string(),
            ],
            interval: Duration::from_millis(50),
            repeat: true,
        },
        "010C" => MockReply::echoed(command, &["7E8 04 41 0C 1A F8 "]),
        "010D" => MockReply::echoed(command, &["7E8 03 41 0D 28 "]),
        "0105" => MockReply::echoed(command, &["7E8 03 41 05 73 "]),
        "0100" => MockReply::echoed(command, &["7E8 06 41 00 BE 3F A8 13 "]),
        "0902" => MockReply::echoed(
            command,
            &[
                "7E8 10 14 49 02 01 31 44 34 ",
                "7E8 21 47 50 30 30 52 35 35 ",
                "7E8 22 42 31 32 33 34 35 36 ",
            ],
        ),
        "03" => MockReply::echoed(command, &["7E8 06 43 02 01 33 C1 00 "]),
        c if c.starts_with("AT") => MockReply::echoed(command, &["OK"]),
        _ => MockReply::echoed(command, &["NO DATA"]),
    }
}

/// Connector that wires each `connect` to a fresh [`MockAdapter`] session
#[derive(Clone)]
pub struct MockConnector {
    adapter: MockAdapter,
    refuse: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    session: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MockConnector {
    pub fn new(adapter: MockAdapter) -> Self {
        Self {
            adapter,
            refuse: Arc::new(AtomicBool::new(false)),
            connects: Arc::new(AtomicUsize::new(0)),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn adapter(&self) -> &MockAdapter {
        &self.adapter
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts that reached the connector
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Drop the adapter side of the current pipe, as if the peer vanished
    pub fn hang_up(&self) {
        if let Some(handle) = self.session.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn validate(&self, address: &str) -> Result<(), LinkError> {
        match address.strip_prefix(MOCK_SCHEME) {
            Some(rest) if !rest.is_empty() => Ok(()),
            _ => Err(LinkError::InvalidAddress(address.to_string())),
        }
    }

    async fn connect(
        &self,
        address: &str,
        _config: &LinkConfig,
    ) -> Result<Box<dyn AdapterStream>, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(LinkError::Refused(address.to_string()));
        }

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let handle = tokio::spawn(self.adapter.clone().serve(far));
        if let Some(previous) = self.session.lock().replace(handle) {
            previous.abort();
        }
        Ok(Box::new(near))
    }
}
