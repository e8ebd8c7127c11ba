//! Adapter transport
//!
//! Owns the duplex stream and exposes the raw primitives every layer above
//! builds on: open/close, raw writes, "read until a stop byte", and "drain
//! whatever is available". Failures never escape as errors: they bump the
//! consecutive input/output error counters, and the connected state is
//! derived from those counters.

use crate::config::LinkConfig;
use crate::connector::{AdapterStream, Connector};
use crate::framing::{COMMAND_TERMINATOR, FRAME_DELIMITER, PROMPT};
use crate::signal::StopSignal;
use crate::stats::{LinkStats, LinkStatsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long `drain_available` waits for each further chunk
const DRAIN_SLICE: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 256;

/// Connection state derived from the stream and the error counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Open stream plus bytes read past the last stop byte
struct OpenLink {
    stream: Box<dyn AdapterStream>,
    pending: VecDeque<u8>,
}

impl OpenLink {
    fn new(stream: Box<dyn AdapterStream>) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
        }
    }
}

/// Duplex link to one adapter
pub struct Transport {
    connector: Arc<dyn Connector>,
    config: LinkConfig,
    link: Mutex<Option<OpenLink>>,
    address: parking_lot::Mutex<Option<String>>,
    open: AtomicBool,
    connecting: AtomicBool,
    input_errors: AtomicU32,
    output_errors: AtomicU32,
    /// Bumped by every successful `open`
    generation: AtomicU64,
    stats: LinkStats,
    stop: StopSignal,
    shut_down: AtomicBool,
}

impl Transport {
    /// Create a transport that opens streams through `connector`
    pub fn new(connector: Arc<dyn Connector>, config: LinkConfig) -> Self {
        Self {
            connector,
            config,
            link: Mutex::new(None),
            address: parking_lot::Mutex::new(None),
            open: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            input_errors: AtomicU32::new(0),
            output_errors: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            stats: LinkStats::default(),
            stop: StopSignal::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Stop signal shared with the command engine's waits
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Address of the last successfully validated `open`
    pub fn peer_address(&self) -> Option<String> {
        self.address.lock().clone()
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_handle(&self) -> &LinkStats {
        &self.stats
    }

    pub fn input_error_count(&self) -> u32 {
        self.input_errors.load(Ordering::SeqCst)
    }

    pub fn output_error_count(&self) -> u32 {
        self.output_errors.load(Ordering::SeqCst)
    }

    /// Identifies the current stream. Changes whenever a new stream is
    /// opened, so state tied to one adapter session can tell it is stale.
    pub fn link_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Open a stream to `address`, replacing any previous one.
    ///
    /// Invalid addresses are rejected before any I/O. On success the error
    /// counters are reset and the warm-reset sequence is written.
    pub async fn open(&self, address: &str) -> bool {
        if self.is_shut_down() {
            debug!(address, "Ignoring open on shut down transport");
            return false;
        }
        if let Err(e) = self.connector.validate(address) {
            warn!(address, error = %e, "Rejected adapter address");
            return false;
        }

        self.connecting.store(true, Ordering::SeqCst);
        self.close().await;
        *self.address.lock() = Some(address.to_string());

        let opened = match self.connector.connect(address, &self.config).await {
            Ok(stream) => {
                *self.link.lock().await = Some(OpenLink::new(stream));
                self.input_errors.store(0, Ordering::SeqCst);
                self.output_errors.store(0, Ordering::SeqCst);
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.open.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!(address, error = %e, "Failed to open adapter link");
                false
            }
        };
        self.connecting.store(false, Ordering::SeqCst);

        if opened {
            info!(address, "Adapter link opened");
            self.warm_reset().await;
        }
        opened && self.is_connected()
    }

    /// Clear adapter state left behind by an abnormal disconnect
    async fn warm_reset(&self) {
        for command in &self.config.warm_reset {
            let line = format!("{command}{COMMAND_TERMINATOR}");
            if !self.write_raw(line.as_bytes()).await {
                return;
            }
            let reply = self.read_until(PROMPT, self.config.command_wait()).await;
            debug!(command = %command, reply = %reply, "Warm reset step");
        }
        self.drain_available().await;
    }

    /// Tear down the stream. Safe to call when nothing is open.
    pub async fn close(&self) {
        let previous = self.link.lock().await.take();
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut link) = previous {
            let _ = link.stream.shutdown().await;
            info!("Adapter link closed");
        }
    }

    /// Stop all waits and close the stream. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down transport");
        self.stop.trigger();
        self.close().await;
    }

    /// Connected while the stream is open and neither error counter has
    /// passed the threshold. Evaluated lazily on every call.
    pub fn is_connected(&self) -> bool {
        let limit = self.config.max_io_errors;
        self.open.load(Ordering::SeqCst)
            && self.input_errors.load(Ordering::SeqCst) <= limit
            && self.output_errors.load(Ordering::SeqCst) <= limit
    }

    pub fn link_state(&self) -> LinkState {
        if self.connecting.load(Ordering::SeqCst) {
            LinkState::Connecting
        } else if self.is_connected() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    /// Write `bytes` in full, or fail visibly.
    ///
    /// The write is never abandoned half-way because of a stop request.
    pub async fn write_raw(&self, bytes: &[u8]) -> bool {
        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            self.record_output_error("no open stream");
            return false;
        };

        let write = async {
            link.stream.write_all(bytes).await?;
            link.stream.flush().await
        };
        match tokio::time::timeout(self.config.command_wait(), write).await {
            Ok(Ok(())) => {
                self.output_errors.store(0, Ordering::SeqCst);
                self.stats.add_bytes_out(bytes.len());
                true
            }
            Ok(Err(e)) => {
                self.record_output_error(&e.to_string());
                false
            }
            Err(_) => {
                self.record_output_error("write timed out");
                false
            }
        }
    }

    /// Collect printable bytes until `stop_byte` or `max_wait` elapses.
    ///
    /// CR/LF runs become a single `|`. The stop byte itself is consumed but
    /// not returned. Whatever was collected is returned on timeout, even if
    /// empty.
    pub async fn read_until(&self, stop_byte: u8, max_wait: Duration) -> String {
        let mut collected = String::new();
        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            self.record_input_error("no open stream");
            return collected;
        };

        let deadline = Instant::now() + max_wait;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            while let Some(byte) = link.pending.pop_front() {
                if byte == stop_byte {
                    return collected;
                }
                push_translated(&mut collected, byte);
            }

            let now = Instant::now();
            if now >= deadline || self.stop.is_triggered() {
                break;
            }
            let slice = self.config.poll_interval().min(deadline - now);

            let read = tokio::select! {
                read = tokio::time::timeout(slice, link.stream.read(&mut buf)) => read,
                _ = self.stop.triggered() => break,
            };
            match read {
                Ok(Ok(0)) => {
                    self.record_input_error("stream closed by peer");
                    break;
                }
                Ok(Ok(n)) => {
                    self.input_errors.store(0, Ordering::SeqCst);
                    self.stats.add_bytes_in(n);
                    link.pending.extend(&buf[..n]);
                }
                Ok(Err(e)) => {
                    self.record_input_error(&e.to_string());
                    break;
                }
                // Nothing available during this poll
                Err(_) => {}
            }
        }
        collected
    }

    /// Return whatever the adapter has already sent, without waiting for a
    /// stop byte.
    pub async fn drain_available(&self) -> String {
        let mut collected = String::new();
        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return collected;
        };

        for byte in link.pending.drain(..) {
            push_translated(&mut collected, byte);
        }

        let mut buf = [0u8; READ_CHUNK];
        loop {
            match tokio::time::timeout(DRAIN_SLICE, link.stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    self.record_input_error("stream closed by peer");
                    break;
                }
                Ok(Ok(n)) => {
                    self.stats.add_bytes_in(n);
                    for &byte in &buf[..n] {
                        push_translated(&mut collected, byte);
                    }
                }
                Ok(Err(e)) => {
                    self.record_input_error(&e.to_string());
                    break;
                }
                Err(_) => break,
            }
        }
        if !collected.is_empty() {
            debug!(drained = %collected, "Drained stale adapter output");
        }
        collected
    }

    fn record_input_error(&self, reason: &str) {
        let count = self.input_errors.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count, reason, "Adapter input error");
        if count == self.config.max_io_errors + 1 {
            warn!(count, "Input error threshold exceeded, adapter link considered lost");
        }
    }

    fn record_output_error(&self, reason: &str) {
        let count = self.output_errors.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(count, reason, "Adapter output error");
        if count == self.config.max_io_errors + 1 {
            warn!(count, "Output error threshold exceeded, adapter link considered lost");
        }
    }
}

/// Append one received byte: printable ASCII verbatim, CR/LF runs as one
/// delimiter, everything else dropped.
fn push_translated(out: &mut String, byte: u8) {
    match byte {
        b'\r' | b'\n' => {
            if !out.is_empty() && !out.ends_with(FRAME_DELIMITER) {
                out.push(FRAME_DELIMITER);
            }
        }
        0x20..=0x7E => out.push(byte as char),
        _ => {}
    }
}
