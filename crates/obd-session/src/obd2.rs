//! OBD2 request/response session

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::ladder::{managed_session, LadderDriver, Rung, SessionCore};
use crate::lookup::Lookup;
use crate::session::SessionKind;
use async_trait::async_trait;
use elm_link::{CommandEngine, ObdProtocol};
use packet_decoder::{ack_signature, DecodedValue, Decoder};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

const VALUE_CAPACITY: usize = 256;

/// Polls named data points once the adapter is configured and a liveness
/// probe has been acknowledged
#[derive(Clone)]
pub struct Obd2Session {
    inner: Arc<Obd2Inner>,
}

struct Obd2Inner {
    core: SessionCore,
    lookup: Arc<dyn Lookup>,
    protocol: Mutex<Option<ObdProtocol>>,
    values: broadcast::Sender<DecodedValue>,
}

impl Obd2Session {
    pub fn new(engine: Arc<CommandEngine>, lookup: Arc<dyn Lookup>, config: SessionConfig) -> Self {
        let (values, _) = broadcast::channel(VALUE_CAPACITY);
        Self {
            inner: Arc::new(Obd2Inner {
                core: SessionCore::new(SessionKind::Obd2, engine, config),
                lookup,
                protocol: Mutex::new(None),
                values,
            }),
        }
    }

    /// Protocol recorded on reaching the terminal rung
    pub fn protocol(&self) -> Option<ObdProtocol> {
        *self.inner.protocol.lock()
    }

    /// Every value decoded by [`request`](Self::request)
    pub fn subscribe(&self) -> broadcast::Receiver<DecodedValue> {
        self.inner.values.subscribe()
    }

    /// Request a data point by name, decode it and publish the value.
    pub async fn request(&self, name: &str) -> Result<DecodedValue, SessionError> {
        let inner = &self.inner;
        inner.core.check_ready()?;
        let def = inner
            .lookup
            .data_point(name)
            .ok_or_else(|| SessionError::UnknownDataPoint(name.to_string()))?;

        let response = inner.core.engine.send_with_retry(&def.request).await;
        if response.is_empty() {
            return Err(SessionError::NoResponse(def.request));
        }
        let protocol = self.protocol().map_or(0, |p| p.number());
        let value = Decoder::new(protocol).try_decode(&def, &response)?;
        debug!(name, value = %value.value, "Data point decoded");
        // No subscribers is fine
        let _ = inner.values.send(value.clone());
        Ok(value)
    }
}

managed_session!(Obd2Session);

/// Does the response carry the acknowledgement for `probe`?
fn acknowledged(probe: &str, response: &str) -> bool {
    let Some(signature) = ack_signature(probe) else {
        return false;
    };
    let expected: String = signature.iter().map(|b| format!("{b:02X}")).collect();
    let compact: String = response
        .split('|')
        .skip(1)
        .flat_map(|line| line.split_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    compact.contains(&expected)
}

impl Obd2Inner {
    async fn probe_liveness(&self) -> bool {
        for probe in &self.core.config.obd2.liveness_probes {
            let response = self.core.engine.send_with_retry(probe).await;
            if acknowledged(probe, &response) {
                debug!(probe = %probe, "Liveness probe acknowledged");
                return true;
            }
            debug!(probe = %probe, response = %response, "Liveness probe not acknowledged");
        }
        false
    }
}

#[async_trait]
impl LadderDriver for Obd2Inner {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn init_sequence(&self) -> &[String] {
        &self.core.config.obd2.init
    }

    fn uninit_sequence(&self) -> &[String] {
        &self.core.config.obd2.uninit
    }

    async fn advance(&self, from: Rung) -> Rung {
        let config = &self.core.config.obd2;
        match from {
            Rung::LinkUp => {
                if self.core.configure(&config.init).await {
                    Rung::Configured
                } else {
                    Rung::LinkUp
                }
            }
            Rung::Configured => match self.core.confirm_protocol(config.expected_protocol, false).await {
                Some(protocol) => {
                    *self.protocol.lock() = Some(protocol);
                    Rung::ProtocolConfirmed
                }
                None => Rung::Configured,
            },
            Rung::ProtocolConfirmed => {
                if !self.probe_liveness().await {
                    return Rung::ProtocolConfirmed;
                }
                // Auto-detection settles on the first request; record what it chose
                if let Some(protocol) = self.core.confirm_protocol(config.expected_protocol, false).await {
                    *self.protocol.lock() = Some(protocol);
                }
                info!(protocol = ?*self.protocol.lock(), "OBD2 session ready");
                Rung::Ready
            }
            other => other,
        }
    }

    async fn on_link_lost(&self) {
        *self.protocol.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::StaticLookup;
    use crate::session::ManagedSession;
    use elm_link::mock::{elm327_reply, MockAdapter, MockConnector, MockReply};
    use elm_link::{LinkConfig, Transport};
    use packet_decoder::{DataPointDef, FormulaProgram};
    use std::time::Duration;

    fn lookup() -> Arc<dyn Lookup> {
        let formula = |text: &str| FormulaProgram::parse(text).unwrap();
        Arc::new(
            StaticLookup::new()
                .with_data_point(DataPointDef::new("rpm", "010C", formula("A*256,X+B,X/4")))
                .with_data_point(DataPointDef::new("vin", "0902", formula("VIN")))
                .with_data_point(DataPointDef::new("dtc", "03", formula("DTC")))
                .with_data_point(DataPointDef::new("voltage", "ATRV", formula("AT"))),
        )
    }

    async fn session_with(adapter: MockAdapter) -> (Obd2Session, Arc<Transport>) {
        let connector = MockConnector::new(adapter);
        let transport = Arc::new(Transport::new(Arc::new(connector), LinkConfig::fast()));
        assert!(transport.open("mock://elm").await);
        let engine = Arc::new(CommandEngine::new(Arc::clone(&transport)));
        (Obd2Session::new(engine, lookup(), SessionConfig::fast()), transport)
    }

    async fn climb(session: &Obd2Session, ticks: usize) {
        session.inner.core.unsuspend_for_test();
        for _ in 0..ticks {
            session.tick().await;
        }
    }

    #[test]
    fn test_acknowledgement_check() {
        assert!(acknowledged("010C", "010C|7E8 04 41 0C 1A F8 |"));
        assert!(acknowledged("0100", "0100|7E8064100BE3FA813|"));
        assert!(!acknowledged("010C", "010C|NO DATA|"));
        assert!(!acknowledged("010C", ""));
    }

    #[tokio::test]
    async fn test_reaches_ready_and_records_protocol() {
        let (session, _transport) = session_with(MockAdapter::echoing()).await;
        climb(&session, 4).await;
        assert_eq!(session.current_rung(), Rung::Ready);
        assert_eq!(session.protocol(), Some(ObdProtocol::Iso15765_4Can11bit500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_falls_back_to_supported_pids() {
        let adapter = MockAdapter::new(|command| match command {
            "010C" => MockReply::echoed(command, &["NO DATA"]),
            other => elm327_reply(other),
        });
        let (session, _transport) = session_with(adapter.clone()).await;
        climb(&session, 4).await;
        assert_eq!(session.current_rung(), Rung::Ready);
        assert!(adapter.count("0100") >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_bus_stays_below_ready() {
        let adapter = MockAdapter::new(|command| match command {
            "010C" | "0100" => MockReply::echoed(command, &["UNABLE TO CONNECT"]),
            other => elm327_reply(other),
        });
        let (session, _transport) = session_with(adapter).await;
        climb(&session, 6).await;
        assert_eq!(session.current_rung(), Rung::ProtocolConfirmed);
    }

    #[tokio::test]
    async fn test_request_decodes_and_publishes() {
        let (session, _transport) = session_with(MockAdapter::echoing()).await;
        let mut values = session.subscribe();
        climb(&session, 4).await;

        let rpm = session.request("rpm").await.unwrap();
        assert_eq!(rpm.value, "1726");
        assert_eq!(values.recv().await.unwrap(), rpm);

        assert_eq!(session.request("vin").await.unwrap().value, "1D4GP00R55B123456");
        assert_eq!(session.request("dtc").await.unwrap().value, "P0133,U0100");
        assert_eq!(session.request("voltage").await.unwrap().value, "12.6V");
    }

    #[tokio::test]
    async fn test_request_preconditions() {
        let (session, _transport) = session_with(MockAdapter::echoing()).await;
        assert!(matches!(session.request("rpm").await, Err(SessionError::Suspended)));

        session.inner.core.unsuspend_for_test();
        assert!(matches!(
            session.request("rpm").await,
            Err(SessionError::NotReady(Rung::Uninitialized))
        ));

        climb(&session, 4).await;
        assert!(matches!(
            session.request("boost").await,
            Err(SessionError::UnknownDataPoint(_))
        ));
    }

    #[tokio::test]
    async fn test_link_loss_clears_protocol() {
        let (session, transport) = session_with(MockAdapter::echoing()).await;
        climb(&session, 4).await;

        transport.close().await;
        session.tick().await;
        assert_eq!(session.current_rung(), Rung::Uninitialized);
        assert_eq!(session.protocol(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_and_idempotent_shutdown() {
        let (session, _transport) = session_with(MockAdapter::echoing()).await;
        session.resume();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while session.current_rung() != Rung::Ready && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(session.current_rung(), Rung::Ready);

        session.shutdown().await;
        let rung = session.current_rung();
        session.shutdown().await;
        assert_eq!(session.current_rung(), rung);
        assert!(session.is_suspended());
        assert!(matches!(session.request("rpm").await, Err(SessionError::ShutDown)));
    }
}
