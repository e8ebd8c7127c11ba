//! Bridge orchestration
//!
//! Owns the link, the three sessions and the switchboard. Decoded values
//! and link events leave as SVIP messages on an outbound channel; consumer
//! requests come back in through [`Bridge::serve`].

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::lookup::{CacheScope, CachedLookup};
use elm_link::{CommandEngine, Connector, LinkEvent, ReconnectSupervisor, StopSignal, Transport};
use obd_session::{
    ControlSession, Lookup, ManagedSession, MonitorSession, Obd2Session, Rung, SessionError,
    SessionKind, Switchboard,
};
use std::sync::Arc;
use svip_wire::{Message, MessageReader};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 512;
const LINK_EVENT: &str = "link";
const SESSION_EVENT: &str = "session";

pub struct Bridge {
    config: BridgeConfig,
    transport: Arc<Transport>,
    supervisor: Arc<ReconnectSupervisor>,
    lookup: Arc<CachedLookup>,
    obd2: Obd2Session,
    monitor: MonitorSession,
    control: ControlSession,
    switchboard: Switchboard,
    stop: StopSignal,
}

impl Bridge {
    pub fn new(config: BridgeConfig, connector: Arc<dyn Connector>) -> Result<Self, BridgeError> {
        connector.validate(&config.address)?;

        let transport = Arc::new(Transport::new(connector, config.link.clone()));
        let supervisor = Arc::new(ReconnectSupervisor::new(
            Arc::clone(&transport),
            config.address.clone(),
        ));
        let engine = Arc::new(CommandEngine::new(Arc::clone(&transport)));

        let lookup = Arc::new(CachedLookup::new(Arc::new(config.catalog())));
        let shared: Arc<dyn Lookup> = lookup.clone();
        let obd2 = Obd2Session::new(Arc::clone(&engine), Arc::clone(&shared), config.session.clone());
        let monitor =
            MonitorSession::new(Arc::clone(&engine), Arc::clone(&shared), config.session.clone());
        let control = ControlSession::new(engine, shared, config.session.clone());

        let sessions: Vec<Arc<dyn ManagedSession>> = vec![
            Arc::new(obd2.clone()),
            Arc::new(monitor.clone()),
            Arc::new(control.clone()),
        ];

        Ok(Self {
            config,
            transport,
            supervisor,
            lookup,
            obd2,
            monitor,
            control,
            switchboard: Switchboard::new(sessions),
            stop: StopSignal::new(),
        })
    }

    pub fn switchboard(&self) -> &Switchboard {
        &self.switchboard
    }

    pub fn obd2(&self) -> &Obd2Session {
        &self.obd2
    }

    pub fn lookup(&self) -> &CachedLookup {
        &self.lookup
    }

    /// Start link supervision and hand the link to the configured session
    pub async fn start(&self) -> Result<(), BridgeError> {
        info!(
            address = %self.config.address,
            session = %self.config.active_session,
            "Starting bridge"
        );
        self.supervisor.start();
        self.switchboard.switch_to(self.config.active_session).await?;
        Ok(())
    }

    /// Publish values and link events until [`shutdown`](Self::shutdown).
    ///
    /// While the OBD2 session owns the link, the configured data points are
    /// requested every poll interval.
    pub async fn run(&self, outbound: mpsc::Sender<Message>) -> Result<(), BridgeError> {
        let mut obd2_values = self.obd2.subscribe();
        let mut monitor_values = self.monitor.subscribe_values();
        let mut link_events = self.supervisor.subscribe();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let poll_names = self.config.poll_names();

        let state = if self.transport.is_connected() {
            LinkEvent::Connected
        } else {
            LinkEvent::Disconnected
        };
        emit(&outbound, link_message(state)).await?;

        loop {
            tokio::select! {
                _ = self.stop.triggered() => break,
                _ = ticker.tick() => self.poll(&poll_names).await,
                value = obd2_values.recv() => {
                    if let Some(value) = received(value) {
                        emit(&outbound, Message::dpn(&value.name, &value.value)).await?;
                    }
                }
                value = monitor_values.recv() => {
                    if let Some(value) = received(value) {
                        emit(&outbound, Message::dpn(&value.name, &value.value)).await?;
                    }
                }
                event = link_events.recv() => {
                    if let Some(event) = received(event) {
                        emit(&outbound, link_message(event)).await?;
                    }
                }
            }
        }
        debug!("Bridge publish loop exited");
        Ok(())
    }

    async fn poll(&self, names: &[String]) {
        if self.switchboard.active().await != Some(SessionKind::Obd2)
            || self.obd2.current_rung() != Rung::Ready
        {
            return;
        }
        for name in names {
            // Values reach the consumer through the session's broadcast
            if let Err(e) = self.obd2.request(name).await {
                debug!(name = %name, error = %e, "Poll request failed");
            }
        }
    }

    /// Answer one consumer message
    pub async fn handle(&self, message: Message) -> Message {
        if let Some(pong) = message.reply_to_ping() {
            return pong;
        }
        let Message::Request { verb, args } = message else {
            return Message::Nack;
        };
        let arg = args.first().map(String::as_str).unwrap_or_default();

        let outcome = match verb.to_ascii_uppercase().as_str() {
            "GET" => self
                .obd2
                .request(arg)
                .await
                .map(|value| Message::Ack(vec![value.name, value.value])),
            "CMD" => self
                .control
                .send_named_command(arg)
                .await
                .map(|_| Message::ack(&[arg])),
            "WAKE" => self.control.wake_network().await.map(|_| Message::ack(&[])),
            "MODE" => match parse_kind(arg) {
                Some(kind) => self
                    .switchboard
                    .switch_to(kind)
                    .await
                    .map(|_| Message::Ack(vec![SESSION_EVENT.to_string(), kind.to_string()])),
                None => Err(SessionError::UnknownCommand(arg.to_string())),
            },
            "RESET" => match parse_scope(arg) {
                Some(scope) => {
                    self.lookup.invalidate(scope);
                    Ok(Message::ack(&[]))
                }
                None => Err(SessionError::UnknownCommand(arg.to_string())),
            },
            "STATS" => {
                let stats = self.transport.stats();
                Ok(Message::Ack(
                    [
                        stats.bytes_in,
                        stats.bytes_out,
                        stats.commands_sent,
                        stats.reconnect_attempts,
                    ]
                    .iter()
                    .map(u64::to_string)
                    .collect(),
                ))
            }
            _ => Err(SessionError::UnknownCommand(verb.clone())),
        };

        outcome.unwrap_or_else(|e| {
            debug!(verb = %verb, error = %e, "Consumer request refused");
            Message::Nack
        })
    }

    /// Read SVIP requests from `input` and queue the replies, until end of
    /// input or shutdown.
    pub async fn serve<R>(&self, mut input: R, outbound: mpsc::Sender<Message>) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = MessageReader::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = tokio::select! {
                _ = self.stop.triggered() => return Ok(()),
                n = input.read(&mut chunk) => n?,
            };
            if n == 0 {
                debug!("Consumer input closed");
                return Ok(());
            }
            reader.push(&chunk[..n]);
            while let Some(parsed) = reader.next_message() {
                let reply = match parsed {
                    Ok(message) => self.handle(message).await,
                    Err(e) => {
                        warn!(error = %e, "Malformed consumer message");
                        Message::Nack
                    }
                };
                emit(&outbound, reply).await?;
            }
        }
    }

    /// Stop publishing, suspend every session and close the link.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.stop.trigger();
        self.switchboard.shutdown().await;
        self.supervisor.shutdown().await;
        self.transport.shutdown().await;
        info!("Bridge stopped");
    }
}

async fn emit(outbound: &mpsc::Sender<Message>, message: Message) -> Result<(), BridgeError> {
    outbound.send(message).await.map_err(|_| BridgeError::ChannelClosed)
}

/// Unwrap a broadcast receive, tolerating lag
fn received<T>(result: Result<T, broadcast::error::RecvError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, "Publisher lagged, values dropped");
            None
        }
        Err(broadcast::error::RecvError::Closed) => None,
    }
}

fn link_message(event: LinkEvent) -> Message {
    let state = match event {
        LinkEvent::Connected => "connected",
        LinkEvent::Disconnected => "disconnected",
    };
    Message::oob(LINK_EVENT, state)
}

fn parse_kind(text: &str) -> Option<SessionKind> {
    SessionKind::ALL
        .into_iter()
        .find(|kind| kind.to_string().eq_ignore_ascii_case(text))
}

fn parse_scope(text: &str) -> Option<CacheScope> {
    let (scope, network) = match text.split_once(':') {
        Some((scope, network)) => (scope, Some(network)),
        None => (text, None),
    };
    match (scope.to_ascii_lowercase().as_str(), network) {
        ("" | "all", None) => Some(CacheScope::All),
        ("datapoints", None) => Some(CacheScope::DataPoints),
        ("sniff", None) => Some(CacheScope::SniffRules),
        ("macros", None) => Some(CacheScope::Macros),
        ("network", Some(network)) if !network.is_empty() => {
            Some(CacheScope::Network(network.to_string()))
        }
        _ => None,
    }
}
