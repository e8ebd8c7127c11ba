//! Bus monitor (sniff) session
//!
//! The terminal rung puts the adapter into monitor-all mode, samples a
//! handful of frames to make sure the bus is actually readable, then hands
//! the stream to a reader task that publishes raw frames and the values
//! decoded from them by the lookup's sniff rules.

use crate::config::SessionConfig;
use crate::ladder::{managed_session, LadderDriver, Rung, SessionCore};
use crate::lookup::Lookup;
use crate::session::SessionKind;
use async_trait::async_trait;
use elm_link::{has_error_marker, CommandEngine, ObdProtocol, StopSignal};
use packet_decoder::{split_frame, DecodedValue, Decoder, RawFrame};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const FRAME_CAPACITY: usize = 1024;

/// Passive CAN bus observer
#[derive(Clone)]
pub struct MonitorSession {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    core: SessionCore,
    lookup: Arc<dyn Lookup>,
    protocol: Mutex<Option<ObdProtocol>>,
    frames: broadcast::Sender<RawFrame>,
    values: broadcast::Sender<DecodedValue>,
    last_frame: Arc<Mutex<Instant>>,
    reader: Mutex<Option<FrameReader>>,
}

struct FrameReader {
    stop: StopSignal,
    handle: JoinHandle<()>,
}

/// Everything needed to turn one monitor line into published output
#[derive(Clone)]
struct FrameSink {
    lookup: Arc<dyn Lookup>,
    network: String,
    decoder: Decoder,
    frames: broadcast::Sender<RawFrame>,
    values: broadcast::Sender<DecodedValue>,
    last_frame: Arc<Mutex<Instant>>,
}

impl FrameSink {
    fn publish(&self, line: &str) {
        let Some(frame) = split_frame(line) else {
            trace!(line, "Unparseable monitor line");
            return;
        };
        *self.last_frame.lock() = Instant::now();
        for rule in self.lookup.sniff_rules(&frame.header, &self.network) {
            if let Some(value) = self.decoder.decode_frame(&rule, &frame) {
                let _ = self.values.send(value);
            }
        }
        let _ = self.frames.send(frame);
    }
}

async fn read_frames(engine: Arc<CommandEngine>, sink: FrameSink, stop: StopSignal, wait: Duration) {
    loop {
        let line = tokio::select! {
            line = engine.next_line(wait) => line,
            _ = stop.triggered() => break,
        };
        if line.is_empty() {
            if !engine.transport().is_connected() {
                break;
            }
            continue;
        }
        if has_error_marker(&line) {
            debug!(line = %line, "Monitor reported an error");
            continue;
        }
        sink.publish(&line);
    }
    debug!("Frame reader exited");
}

impl MonitorSession {
    pub fn new(engine: Arc<CommandEngine>, lookup: Arc<dyn Lookup>, config: SessionConfig) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CAPACITY);
        let (values, _) = broadcast::channel(FRAME_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                core: SessionCore::new(SessionKind::Monitor, engine, config),
                lookup,
                protocol: Mutex::new(None),
                frames,
                values,
                last_frame: Arc::new(Mutex::new(Instant::now())),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn protocol(&self) -> Option<ObdProtocol> {
        *self.inner.protocol.lock()
    }

    /// Raw frames as they are sniffed
    pub fn subscribe_frames(&self) -> broadcast::Receiver<RawFrame> {
        self.inner.frames.subscribe()
    }

    /// Values decoded from sniffed frames
    pub fn subscribe_values(&self) -> broadcast::Receiver<DecodedValue> {
        self.inner.values.subscribe()
    }

    /// Time since the last frame was seen
    pub fn idle_for(&self) -> Duration {
        self.inner.last_frame.lock().elapsed()
    }
}

managed_session!(MonitorSession);

impl MonitorInner {
    fn sink(&self) -> FrameSink {
        let protocol = self.protocol.lock().map_or(0, |p| p.number());
        FrameSink {
            lookup: Arc::clone(&self.lookup),
            network: self.core.config.monitor.network.clone(),
            decoder: Decoder::new(protocol),
            frames: self.frames.clone(),
            values: self.values.clone(),
            last_frame: Arc::clone(&self.last_frame),
        }
    }

    /// Issue the monitor command until it is echoed
    async fn open_monitor(&self) -> bool {
        let config = &self.core.config.monitor;
        let engine = &self.core.engine;
        for attempt in 0..=config.monitor_retries {
            if self.core.stop.is_triggered() {
                return false;
            }
            if attempt > 0 {
                debug!(attempt, "Monitor echo missing, cancelling and reissuing");
                engine.stop_stream().await;
            }
            let echo = engine
                .start_stream(&config.monitor_command, config.frame_wait())
                .await;
            if echo.eq_ignore_ascii_case(&config.monitor_command) {
                return true;
            }
        }
        warn!(retries = config.monitor_retries, "Monitor command never echoed");
        engine.stop_stream().await;
        false
    }

    /// Sample frames; `false` rejects the session
    async fn sample(&self, sink: &FrameSink) -> bool {
        let config = &self.core.config.monitor;
        let mut errors = 0u32;
        for sampled in 0..config.sample_frames {
            let line = self.core.engine.next_line(config.frame_wait()).await;
            if line.is_empty() {
                warn!(sampled, "Monitor sample timed out");
                return false;
            }
            if has_error_marker(&line) {
                errors += 1;
                debug!(line = %line, errors, "Error frame while sampling");
                if errors >= config.max_error_frames {
                    warn!(errors, "Too many error frames while sampling");
                    return false;
                }
                continue;
            }
            sink.publish(&line);
        }
        true
    }

    async fn start_sniffing(&self) -> Rung {
        if !self.open_monitor().await {
            return Rung::ProtocolConfirmed;
        }
        let sink = self.sink();
        if !self.sample(&sink).await {
            self.core.engine.stop_stream().await;
            warn!("Monitor session rejected, back to rung 0");
            return Rung::Uninitialized;
        }

        *self.last_frame.lock() = Instant::now();
        let stop = StopSignal::new();
        let handle = tokio::spawn(read_frames(
            Arc::clone(&self.core.engine),
            sink,
            stop.clone(),
            self.core.config.monitor.frame_wait(),
        ));
        if let Some(previous) = self.reader.lock().replace(FrameReader { stop, handle }) {
            previous.stop.trigger();
        }
        info!("Monitor session sniffing");
        Rung::Ready
    }

    async fn stop_reader(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.stop.trigger();
            let _ = reader.handle.await;
        }
    }

    fn reader_alive(&self) -> bool {
        self.reader
            .lock()
            .as_ref()
            .is_some_and(|reader| !reader.handle.is_finished())
    }
}

#[async_trait]
impl LadderDriver for MonitorInner {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn init_sequence(&self) -> &[String] {
        &self.core.config.monitor.init
    }

    fn uninit_sequence(&self) -> &[String] {
        &self.core.config.monitor.uninit
    }

    async fn advance(&self, from: Rung) -> Rung {
        let config = &self.core.config.monitor;
        match from {
            Rung::LinkUp => {
                if self.core.configure(&config.init).await {
                    Rung::Configured
                } else {
                    Rung::LinkUp
                }
            }
            Rung::Configured => match self.core.confirm_protocol(config.expected_protocol, true).await {
                Some(protocol) => {
                    *self.protocol.lock() = Some(protocol);
                    Rung::ProtocolConfirmed
                }
                None => Rung::Configured,
            },
            Rung::ProtocolConfirmed => self.start_sniffing().await,
            other => other,
        }
    }

    async fn maintain(&self) -> Rung {
        let idle = self.last_frame.lock().elapsed();
        if idle < self.core.config.monitor.idle_rebuild() && self.reader_alive() {
            return Rung::Ready;
        }
        warn!(idle_ms = idle.as_millis() as u64, "Monitor idle, rebuilding");
        self.stop_reader().await;
        self.core.engine.stop_stream().await;
        Rung::ProtocolConfirmed
    }

    async fn on_link_lost(&self) {
        self.stop_reader().await;
    }

    async fn on_suspend(&self) -> Rung {
        self.stop_reader().await;
        if self.core.link_up() {
            self.core.engine.stop_stream().await;
        }
        // Sniffing has to be restarted on resume
        Rung::ProtocolConfirmed
    }
}
