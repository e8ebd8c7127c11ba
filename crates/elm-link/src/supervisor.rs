//! Reconnect supervision
//!
//! A background loop that re-opens the transport whenever it reads as
//! disconnected, rate limited by a minimum period between attempts and
//! standing down after too many consecutive failures.

use crate::signal::StopSignal;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 16;

/// Link transitions, published once per change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

/// Result of one supervisor pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Link was fine, nothing to do
    AlreadyConnected,
    /// Too soon after the previous attempt; no I/O performed
    Backoff,
    /// Too many consecutive failures; waiting for `resume`
    StoodDown,
    /// Reconnected
    Connected,
    /// Tried and failed
    Failed,
}

#[derive(Debug, Default)]
struct SupervisorState {
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
    lifetime_failures: u64,
    stood_down: bool,
    reported_connected: bool,
}

/// Keeps one transport connected to one peer address
pub struct ReconnectSupervisor {
    transport: Arc<Transport>,
    address: String,
    state: parking_lot::Mutex<SupervisorState>,
    events: broadcast::Sender<LinkEvent>,
    stop: StopSignal,
    shut_down: AtomicBool,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectSupervisor {
    pub fn new(transport: Arc<Transport>, address: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            address: address.into(),
            state: parking_lot::Mutex::new(SupervisorState::default()),
            events,
            stop: StopSignal::new(),
            shut_down: AtomicBool::new(false),
            handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn lifetime_failures(&self) -> u64 {
        self.state.lock().lifetime_failures
    }

    pub fn is_stood_down(&self) -> bool {
        self.state.lock().stood_down
    }

    /// Allow attempts again after standing down
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.stood_down {
            info!(address = %self.address, "Reconnect supervisor resumed");
        }
        state.stood_down = false;
        state.consecutive_failures = 0;
    }

    /// One supervisor pass
    pub async fn attempt(&self) -> AttemptOutcome {
        if self.transport.is_connected() {
            self.report(true);
            return AttemptOutcome::AlreadyConnected;
        }
        self.report(false);

        {
            let mut state = self.state.lock();
            if state.stood_down {
                return AttemptOutcome::StoodDown;
            }
            let period = self.transport.config().minimum_reconnect_period();
            if let Some(last) = state.last_attempt {
                if last.elapsed() < period {
                    debug!(address = %self.address, "Reconnect skipped, inside minimum period");
                    return AttemptOutcome::Backoff;
                }
            }
            state.last_attempt = Some(Instant::now());
        }

        let stats = self.transport.stats_handle();
        stats.reconnect_attempted();
        info!(address = %self.address, "Attempting adapter reconnect");

        if self.transport.open(&self.address).await {
            stats.reconnect_succeeded();
            self.state.lock().consecutive_failures = 0;
            self.report(true);
            return AttemptOutcome::Connected;
        }

        stats.reconnect_failed();
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.lifetime_failures += 1;
        warn!(
            address = %self.address,
            consecutive = state.consecutive_failures,
            lifetime = state.lifetime_failures,
            "Reconnect attempt failed"
        );
        let limit = self.transport.config().max_consecutive_failures;
        if state.consecutive_failures >= limit {
            state.stood_down = true;
            warn!(address = %self.address, limit, "Reconnect supervisor standing down");
        }
        AttemptOutcome::Failed
    }

    fn report(&self, connected: bool) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.reported_connected != connected;
            state.reported_connected = connected;
            changed
        };
        if changed {
            let event = if connected {
                LinkEvent::Connected
            } else {
                LinkEvent::Disconnected
            };
            info!(address = %self.address, ?event, "Link state changed");
            let _ = self.events.send(event);
        }
    }

    /// Spawn the supervisor loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let supervisor = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { supervisor.run().await }));
    }

    async fn run(&self) {
        let tick = self.transport.config().supervisor_tick();
        loop {
            self.attempt().await;
            if !self.stop.sleep(tick).await {
                break;
            }
        }
        debug!(address = %self.address, "Reconnect supervisor loop exited");
    }

    /// Stop the loop. Idempotent, safe before `start`.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.trigger();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::mock::{MockAdapter, MockConnector};
    use std::time::Duration;

    fn supervised(config: LinkConfig) -> (Arc<ReconnectSupervisor>, MockConnector, Arc<Transport>) {
        let connector = MockConnector::new(MockAdapter::echoing());
        let transport = Arc::new(Transport::new(Arc::new(connector.clone()), config));
        let supervisor = Arc::new(ReconnectSupervisor::new(transport.clone(), "mock://elm"));
        (supervisor, connector, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_inside_minimum_period_are_skipped() {
        let (supervisor, connector, _transport) = supervised(LinkConfig::default());
        connector.set_refuse(true);

        assert_eq!(supervisor.attempt().await, AttemptOutcome::Failed);
        assert_eq!(connector.connect_count(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(supervisor.attempt().await, AttemptOutcome::Backoff);
        assert_eq!(connector.connect_count(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(supervisor.attempt().await, AttemptOutcome::Failed);
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(supervisor.consecutive_failures(), 2);
        assert_eq!(supervisor.lifetime_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stands_down_after_consecutive_failures() {
        let config = LinkConfig {
            max_consecutive_failures: 2,
            minimum_reconnect_period_secs: 1,
            ..LinkConfig::default()
        };
        let (supervisor, connector, _transport) = supervised(config);
        connector.set_refuse(true);

        assert_eq!(supervisor.attempt().await, AttemptOutcome::Failed);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(supervisor.attempt().await, AttemptOutcome::Failed);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(supervisor.attempt().await, AttemptOutcome::StoodDown);
        assert_eq!(connector.connect_count(), 2);

        connector.set_refuse(false);
        supervisor.resume();
        assert_eq!(supervisor.attempt().await, AttemptOutcome::Connected);
        assert_eq!(supervisor.consecutive_failures(), 0);
        assert_eq!(supervisor.lifetime_failures(), 2);
    }

    #[tokio::test]
    async fn test_connected_event_fires_once_per_transition() {
        let (supervisor, connector, transport) = supervised(LinkConfig::fast());
        let mut events = supervisor.subscribe();

        assert_eq!(supervisor.attempt().await, AttemptOutcome::Connected);
        assert_eq!(supervisor.attempt().await, AttemptOutcome::AlreadyConnected);
        assert_eq!(events.try_recv().unwrap(), LinkEvent::Connected);
        assert!(events.try_recv().is_err());

        connector.hang_up();
        transport.close().await;
        supervisor.attempt().await;
        assert_eq!(events.try_recv().unwrap(), LinkEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_background_loop_reconnects() {
        let (supervisor, _connector, transport) = supervised(LinkConfig::fast());
        supervisor.start();

        for _ in 0..50 {
            if transport.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(transport.is_connected());

        supervisor.shutdown().await;
        supervisor.shutdown().await;
    }
}
