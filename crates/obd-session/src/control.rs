//! Command/control session
//!
//! Reaching the terminal rung programs adapter parameters once per link
//! lifetime, then applies a lighter resume sequence. Named macros from the
//! lookup are run against the ready adapter.

use crate::config::{SessionConfig, WakeConfig};
use crate::error::SessionError;
use crate::ladder::{managed_session, LadderDriver, Rung, SessionCore};
use crate::lookup::Lookup;
use crate::session::SessionKind;
use async_trait::async_trait;
use elm_link::CommandEngine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Width of a `AA BB CC DD ` header prefix on a macro segment
const HEADER_WIDTH: usize = 12;
/// Unit of an `S<n>` sleep directive
const SLEEP_UNIT: Duration = Duration::from_millis(100);
const WAKE_DIRECTIVE: &str = "WAKEALL";

/// One parsed macro segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroStep {
    /// `S<n>`: wait n tenths of a second
    Sleep(Duration),
    /// Run the wake-all-nodes sequence
    WakeNetwork,
    /// Optionally set the bus header, then send
    Send {
        header: Option<String>,
        command: String,
    },
}

/// Parse semicolon-delimited macro text
pub fn parse_macro(text: &str) -> Result<Vec<MacroStep>, SessionError> {
    let steps = text
        .split(';')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(parse_segment)
        .collect::<Result<Vec<_>, _>>()?;
    if steps.is_empty() {
        return Err(SessionError::InvalidMacro {
            segment: text.to_string(),
            reason: "empty macro",
        });
    }
    Ok(steps)
}

fn parse_segment(segment: &str) -> Result<MacroStep, SessionError> {
    if segment.eq_ignore_ascii_case(WAKE_DIRECTIVE) {
        return Ok(MacroStep::WakeNetwork);
    }
    if let Some(count) = segment.strip_prefix(['S', 's']) {
        let tenths: u32 = count.parse().map_err(|_| SessionError::InvalidMacro {
            segment: segment.to_string(),
            reason: "sleep directive needs a decimal count",
        })?;
        return Ok(MacroStep::Sleep(SLEEP_UNIT * tenths));
    }
    if let Some((header, command)) = split_header(segment) {
        return Ok(MacroStep::Send {
            header: Some(header),
            command: command.to_string(),
        });
    }
    Ok(MacroStep::Send {
        header: None,
        command: segment.to_string(),
    })
}

/// Split `AA BB CC DD <command>` into a compact header and the command
fn split_header(segment: &str) -> Option<(String, &str)> {
    let prefix = segment.as_bytes().get(..HEADER_WIDTH)?;
    let well_formed = prefix.iter().enumerate().all(|(i, b)| {
        if i % 3 == 2 {
            *b == b' '
        } else {
            b.is_ascii_hexdigit()
        }
    });
    if !well_formed {
        return None;
    }
    let command = segment[HEADER_WIDTH..].trim();
    if command.is_empty() {
        return None;
    }
    let header = segment[..HEADER_WIDTH].split_whitespace().collect();
    Some((header, command))
}

/// Proprietary command/control mode
#[derive(Clone)]
pub struct ControlSession {
    inner: Arc<ControlInner>,
}

struct ControlInner {
    core: SessionCore,
    lookup: Arc<dyn Lookup>,
    /// Link generation the parameters were programmed on, 0 for none
    programmed_on: AtomicU64,
    /// Last header a macro selected with `ATSH`
    header: parking_lot::Mutex<Option<String>>,
    wake_lock: Mutex<()>,
}

impl ControlSession {
    pub fn new(engine: Arc<CommandEngine>, lookup: Arc<dyn Lookup>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                core: SessionCore::new(SessionKind::Control, engine, config),
                lookup,
                programmed_on: AtomicU64::new(0),
                header: parking_lot::Mutex::new(None),
                wake_lock: Mutex::new(()),
            }),
        }
    }

    /// Run the named macro; returns the response to its last command.
    pub async fn send_named_command(&self, name: &str) -> Result<String, SessionError> {
        let inner = &self.inner;
        inner.core.check_ready()?;
        let text = inner
            .lookup
            .command_macro(name)
            .ok_or_else(|| SessionError::UnknownCommand(name.to_string()))?;
        let steps = parse_macro(&text)?;
        info!(name, steps = steps.len(), "Running command macro");
        inner.run(&steps).await
    }

    /// Rouse a dormant bus: 11-bit wake frame, then back to 29-bit and the
    /// header the last macro selected
    pub async fn wake_network(&self) -> Result<(), SessionError> {
        self.inner.core.check_ready()?;
        self.inner.wake_network().await
    }

    pub fn is_programmed(&self) -> bool {
        self.inner.is_programmed()
    }
}

managed_session!(ControlSession);

impl ControlInner {
    fn is_programmed(&self) -> bool {
        let generation = self.programmed_on.load(Ordering::SeqCst);
        generation != 0 && generation == self.core.link_generation()
    }

    async fn send_checked(&self, command: &str) -> Result<String, SessionError> {
        let response = self.core.engine.send_with_retry(command).await;
        if response.is_empty() {
            return Err(SessionError::NoResponse(command.to_string()));
        }
        Ok(response)
    }

    async fn run(&self, steps: &[MacroStep]) -> Result<String, SessionError> {
        let mut last = String::new();
        for step in steps {
            match step {
                MacroStep::Sleep(duration) => {
                    if !self.core.stop.sleep(*duration).await {
                        return Err(SessionError::Interrupted);
                    }
                }
                MacroStep::WakeNetwork => self.wake_network().await?,
                MacroStep::Send { header, command } => {
                    if let Some(header) = header {
                        self.send_checked(&format!("ATSH{header}")).await?;
                        *self.header.lock() = Some(header.clone());
                    }
                    last = self.send_checked(command).await?;
                }
            }
        }
        Ok(last)
    }

    async fn wake_network(&self) -> Result<(), SessionError> {
        let _wake = self.wake_lock.lock().await;
        let wake = &self.core.config.control.wake;
        let sent = self.transmit_wake(wake).await;
        // Always back to 29-bit, even after a failed wake
        let restored = self
            .send_checked(&format!("ATSP{:X}", wake.restore_protocol))
            .await;
        if let Err(e) = &sent {
            warn!(error = %e, "Wake sequence failed");
        }
        sent?;
        restored?;
        let previous = self.header.lock().clone();
        if let Some(header) = previous {
            self.send_checked(&format!("ATSH{header}")).await?;
        }
        Ok(())
    }

    async fn transmit_wake(&self, wake: &WakeConfig) -> Result<(), SessionError> {
        self.send_checked(&format!("ATSP{:X}", wake.wake_protocol)).await?;
        let header: String = wake.header.split_whitespace().collect();
        self.send_checked(&format!("ATSH{header}")).await?;
        // Sleeping nodes do not answer
        let reply = self.core.engine.send(&wake.frame).await;
        debug!(reply = %reply, "Wake frame sent");
        Ok(())
    }
}

#[async_trait]
impl LadderDriver for ControlInner {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn init_sequence(&self) -> &[String] {
        &self.core.config.control.resume
    }

    fn uninit_sequence(&self) -> &[String] {
        &self.core.config.control.uninit
    }

    async fn advance(&self, from: Rung) -> Rung {
        let config = &self.core.config.control;
        match from {
            Rung::LinkUp => {
                // Reconfiguring from here leaves the adapter on its default header
                self.header.lock().take();
                if !self.is_programmed() {
                    let generation = self.core.link_generation();
                    if !self.core.configure(&config.programming).await {
                        return Rung::LinkUp;
                    }
                    self.programmed_on.store(generation, Ordering::SeqCst);
                    info!(generation, "Adapter parameters programmed");
                }
                if self.core.configure(&config.resume).await {
                    Rung::Configured
                } else {
                    Rung::LinkUp
                }
            }
            Rung::Configured => {
                if self
                    .core
                    .confirm_protocol(config.expected_protocol, true)
                    .await
                    .is_some()
                {
                    Rung::ProtocolConfirmed
                } else {
                    Rung::Configured
                }
            }
            Rung::ProtocolConfirmed => {
                info!("Control session ready");
                Rung::Ready
            }
            other => other,
        }
    }

    async fn on_link_lost(&self) {
        self.programmed_on.store(0, Ordering::SeqCst);
        self.header.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::StaticLookup;
    use crate::session::ManagedSession;
    use elm_link::mock::{elm327_reply, MockAdapter, MockConnector, MockReply};
    use elm_link::{LinkConfig, Transport};
    use tokio::time::Instant;

    /// Mock that remembers the last `ATSPn` and reports it through `ATDPN`
    fn control_adapter() -> MockAdapter {
        let protocol = Arc::new(parking_lot::Mutex::new("0".to_string()));
        MockAdapter::new(move |command| {
            if let Some(number) = command.strip_prefix("ATSP") {
                *protocol.lock() = number.trim().to_string();
            }
            match command {
                "ATDPN" => MockReply::echoed(command, &[protocol.lock().as_str()]),
                c if c.starts_with("22") => {
                    MockReply::echoed(c, &["18 DA F1 10 05 62 F1 90 41 42"])
                }
                other => elm327_reply(other),
            }
        })
    }

    fn lookup() -> Arc<dyn Lookup> {
        Arc::new(
            StaticLookup::new()
                .with_macro("read_id", "S5;18 DA 10 F1 22 F1 90")
                .with_macro("wake", "WAKEALL")
                .with_macro("nap", "S100"),
        )
    }

    async fn session_with(adapter: MockAdapter) -> (ControlSession, Arc<Transport>) {
        let connector = MockConnector::new(adapter);
        let transport = Arc::new(Transport::new(Arc::new(connector), LinkConfig::fast()));
        assert!(transport.open("mock://elm").await);
        let engine = Arc::new(CommandEngine::new(Arc::clone(&transport)));
        (ControlSession::new(engine, lookup(), SessionConfig::fast()), transport)
    }

    async fn climb(session: &ControlSession) {
        session.inner.core.unsuspend_for_test();
        for _ in 0..4 {
            session.tick().await;
        }
    }

    #[test]
    fn test_parse_macro() {
        let steps = parse_macro("S5; 18 DA 10 F1 22 F1 90 ;wakeall;;ATRV").unwrap();
        assert_eq!(
            steps,
            vec![
                MacroStep::Sleep(Duration::from_millis(500)),
                MacroStep::Send {
                    header: Some("18DA10F1".to_string()),
                    command: "22 F1 90".to_string(),
                },
                MacroStep::WakeNetwork,
                MacroStep::Send {
                    header: None,
                    command: "ATRV".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_macro_errors() {
        assert!(parse_macro("").is_err());
        assert!(parse_macro(" ; ").is_err());
        assert!(parse_macro("S").is_err());
        assert!(parse_macro("S1.5").is_err());
    }

    #[test]
    fn test_header_prefix_must_be_well_formed() {
        assert_eq!(split_header("7E0 22 F1 90"), None);
        assert_eq!(split_header("18 DA 10 F1"), None);
        assert_eq!(
            split_header("18 da 10 f1 3E 00"),
            Some(("18da10f1".to_string(), "3E 00"))
        );
    }

    #[tokio::test]
    async fn test_reaches_ready_after_programming() {
        let adapter = control_adapter();
        let (session, _transport) = session_with(adapter.clone()).await;
        climb(&session).await;
        assert_eq!(session.current_rung(), Rung::Ready);
        assert!(session.is_programmed());
        assert_eq!(adapter.count("ATPP 2C ON"), 1);
    }

    #[tokio::test]
    async fn test_wrong_protocol_blocks_confirmation() {
        let adapter = MockAdapter::echoing();
        let (session, _transport) = session_with(adapter).await;
        climb(&session).await;
        assert_eq!(session.current_rung(), Rung::Configured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_programming_sent_once_per_link() {
        let adapter = control_adapter();
        let (session, transport) = session_with(adapter.clone()).await;
        climb(&session).await;

        session.suspend(false).await;
        climb(&session).await;
        assert_eq!(session.current_rung(), Rung::Ready);
        assert_eq!(adapter.count("ATPP 2C ON"), 1);

        transport.close().await;
        session.tick().await;
        assert!(!session.is_programmed());

        assert!(transport.open("mock://elm").await);
        climb(&session).await;
        assert_eq!(session.current_rung(), Rung::Ready);
        assert_eq!(adapter.count("ATPP 2C ON"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_reopened_while_suspended_reprograms() {
        let adapter = control_adapter();
        let (session, transport) = session_with(adapter.clone()).await;
        climb(&session).await;
        assert_eq!(adapter.count("ATPP 2C ON"), 1);

        session.suspend(false).await;
        transport.close().await;
        assert!(transport.open("mock://elm").await);
        assert!(!session.is_programmed());

        climb(&session).await;
        assert_eq!(adapter.count("ATPP 2C ON"), 2);
        assert!(session.is_programmed());
        climb(&session).await;
        assert_eq!(session.current_rung(), Rung::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_command_sets_header_and_sleeps() {
        let adapter = control_adapter();
        let (session, _transport) = session_with(adapter.clone()).await;
        climb(&session).await;

        let started = Instant::now();
        let response = session.send_named_command("read_id").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(response.contains("62 F1 90"));

        let received = adapter.received();
        let header = received.iter().position(|c| c == "ATSH18DA10F1").unwrap();
        assert_eq!(received[header + 1], "22 F1 90");
    }

    #[tokio::test]
    async fn test_wake_network_sequence() {
        let adapter = control_adapter();
        let (session, _transport) = session_with(adapter.clone()).await;
        climb(&session).await;

        session.send_named_command("wake").await.unwrap();
        let received = adapter.received();
        assert_eq!(
            received[received.len() - 4..],
            ["ATSP6", "ATSH7DF", "3E 80", "ATSP7"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_restores_macro_header() {
        let adapter = control_adapter();
        let (session, _transport) = session_with(adapter.clone()).await;
        climb(&session).await;

        session.send_named_command("read_id").await.unwrap();
        session.wake_network().await.unwrap();
        let received = adapter.received();
        assert_eq!(
            received[received.len() - 5..],
            ["ATSP6", "ATSH7DF", "3E 80", "ATSP7", "ATSH18DA10F1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_wake_still_restores_protocol() {
        let adapter = MockAdapter::new(|command| match command {
            "ATSH7DF" => MockReply::echoed(command, &["?"]),
            "ATDPN" => MockReply::echoed(command, &["7"]),
            other => elm327_reply(other),
        });
        let (session, _transport) = session_with(adapter.clone()).await;
        climb(&session).await;

        let result = session.wake_network().await;
        assert!(matches!(result, Err(SessionError::NoResponse(ref c)) if c == "ATSH7DF"));
        assert_eq!(adapter.received().last().map(String::as_str), Some("ATSP7"));
    }

    #[tokio::test]
    async fn test_command_preconditions() {
        let (session, _transport) = session_with(control_adapter()).await;
        assert!(matches!(
            session.send_named_command("read_id").await,
            Err(SessionError::Suspended)
        ));

        climb(&session).await;
        assert!(matches!(
            session.send_named_command("missing").await,
            Err(SessionError::UnknownCommand(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_interrupts_macro_sleep() {
        let (session, _transport) = session_with(control_adapter()).await;
        climb(&session).await;

        let runner = session.clone();
        let nap = tokio::spawn(async move { runner.send_named_command("nap").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.suspend(false).await;

        assert!(matches!(nap.await.unwrap(), Err(SessionError::Interrupted)));
    }
}
