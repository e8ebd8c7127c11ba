//! Ladder bookkeeping shared by the session state machines
//!
//! Each session climbs the same rungs: link up, configured, protocol
//! confirmed, ready. A tick runs the next unmet step; failure leaves the
//! rung unchanged so the next tick retries from there. Only link loss
//! drops back to rung 0, including a link that was lost and reopened while
//! the session was suspended. Suspension keeps the rung unless the adapter
//! is handed over, in which case the session falls back to `LinkUp` and
//! reconfigures on resume.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::SessionKind;
use async_trait::async_trait;
use elm_link::{CommandEngine, ObdProtocol, StopSignal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ladder position. Values leave room between rungs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Rung {
    Uninitialized = 0,
    LinkUp = 10,
    Configured = 20,
    ProtocolConfirmed = 30,
    Ready = 40,
}

/// State every session embeds
pub(crate) struct SessionCore {
    kind: SessionKind,
    pub(crate) engine: Arc<CommandEngine>,
    pub(crate) config: SessionConfig,
    rung: Mutex<Rung>,
    /// Link generation the ladder climbed on
    climbed_on: AtomicU64,
    suspended: AtomicBool,
    loop_active: AtomicBool,
    shut_down: AtomicBool,
    /// Interrupts the management loop and any wait a session step makes
    pub(crate) stop: StopSignal,
    task: Mutex<Option<JoinHandle<()>>>,
    tick_lock: tokio::sync::Mutex<()>,
}

impl SessionCore {
    pub(crate) fn new(kind: SessionKind, engine: Arc<CommandEngine>, config: SessionConfig) -> Self {
        Self {
            kind,
            engine,
            config,
            rung: Mutex::new(Rung::Uninitialized),
            climbed_on: AtomicU64::new(0),
            suspended: AtomicBool::new(true),
            loop_active: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            stop: StopSignal::new(),
            task: Mutex::new(None),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn kind(&self) -> SessionKind {
        self.kind
    }

    pub(crate) fn rung(&self) -> Rung {
        *self.rung.lock()
    }

    pub(crate) fn set_rung(&self, rung: Rung) {
        let mut current = self.rung.lock();
        if *current != rung {
            info!(session = %self.kind, from = ?*current, to = ?rung, "Ladder transition");
            *current = rung;
        }
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn link_up(&self) -> bool {
        self.engine.transport().is_connected()
    }

    pub(crate) fn link_generation(&self) -> u64 {
        self.engine.transport().link_generation()
    }

    /// Whether the stream the ladder climbed on has since been replaced
    fn link_replaced(&self) -> bool {
        self.climbed_on.load(Ordering::SeqCst) != self.link_generation()
    }

    /// Preconditions for operations that need the terminal rung
    pub(crate) fn check_ready(&self) -> Result<(), SessionError> {
        if self.is_shut_down() {
            return Err(SessionError::ShutDown);
        }
        if self.is_suspended() {
            return Err(SessionError::Suspended);
        }
        match self.rung() {
            Rung::Ready => Ok(()),
            other => Err(SessionError::NotReady(other)),
        }
    }

    /// Send a configuration sequence; `true` when every command validated
    pub(crate) async fn configure(&self, commands: &[String]) -> bool {
        let ok = self.engine.send_init_sequence(commands).await;
        if !ok {
            debug!(session = %self.kind, "Configuration sequence failed");
        }
        ok
    }

    /// Ask the adapter which protocol it is on and check it against the
    /// expectation
    pub(crate) async fn confirm_protocol(
        &self,
        expected: Option<u8>,
        require_can: bool,
    ) -> Option<ObdProtocol> {
        let reply = self.engine.send_with_retry("ATDPN").await;
        let Some(protocol) = ObdProtocol::from_dpn_reply(&reply) else {
            debug!(session = %self.kind, reply = %reply, "No protocol number in reply");
            return None;
        };
        if let Some(number) = expected {
            if protocol.number() != number {
                warn!(
                    session = %self.kind,
                    expected = number,
                    reported = protocol.number(),
                    "Adapter is on an unexpected protocol"
                );
                return None;
            }
        }
        if require_can && !protocol.is_can() {
            warn!(session = %self.kind, ?protocol, "Adapter is not on a CAN protocol");
            return None;
        }
        Some(protocol)
    }

    #[cfg(test)]
    pub(crate) fn unsuspend_for_test(&self) {
        self.stop.rearm();
        self.suspended.store(false, Ordering::SeqCst);
    }
}

/// What a session variant adds on top of the shared ladder
#[async_trait]
pub(crate) trait LadderDriver: Send + Sync + 'static {
    fn core(&self) -> &SessionCore;

    /// Commands that take the adapter into this session's mode. Empty is a
    /// configuration error that keeps the session at rung 0.
    fn init_sequence(&self) -> &[String];

    fn uninit_sequence(&self) -> &[String];

    /// Try to climb one rung from `from` (never `Uninitialized` or
    /// `Ready`); returns the resulting rung
    async fn advance(&self, from: Rung) -> Rung;

    /// Called on ticks at the terminal rung
    async fn maintain(&self) -> Rung {
        Rung::Ready
    }

    async fn on_link_lost(&self) {}

    /// Called once the management loop has exited on suspension. Returns
    /// the highest rung that still holds afterwards.
    async fn on_suspend(&self) -> Rung {
        Rung::Ready
    }
}

pub(crate) async fn tick<D: LadderDriver + ?Sized>(driver: &D) {
    let core = driver.core();
    let _tick = core.tick_lock.lock().await;
    if core.is_suspended() || core.is_shut_down() {
        return;
    }

    let rung = core.rung();
    let link_up = core.link_up();
    if !link_up || (rung != Rung::Uninitialized && core.link_replaced()) {
        if rung != Rung::Uninitialized {
            warn!(session = %core.kind, ?rung, link_up, "Link lost, ladder reset");
            core.set_rung(Rung::Uninitialized);
            driver.on_link_lost().await;
        }
        return;
    }

    let next = match rung {
        Rung::Uninitialized => {
            if driver.init_sequence().is_empty() {
                error!(session = %core.kind, "No init command set configured");
                Rung::Uninitialized
            } else {
                core.climbed_on.store(core.link_generation(), Ordering::SeqCst);
                Rung::LinkUp
            }
        }
        Rung::Ready => driver.maintain().await,
        other => driver.advance(other).await,
    };
    core.set_rung(next);
}

async fn run_loop<D: LadderDriver>(driver: Arc<D>) {
    let core = driver.core();
    debug!(session = %core.kind, "Management loop started");
    loop {
        tick(driver.as_ref()).await;
        if !core.stop.sleep(core.config.tick_period()).await {
            break;
        }
    }
    core.loop_active.store(false, Ordering::SeqCst);
    debug!(session = %core.kind, "Management loop exited");
}

pub(crate) fn resume<D: LadderDriver>(driver: &Arc<D>) {
    let core = driver.core();
    if core.is_shut_down() {
        warn!(session = %core.kind, "Resume after shutdown ignored");
        return;
    }
    let mut task = core.task.lock();
    let was_suspended = core.suspended.swap(false, Ordering::SeqCst);
    if !was_suspended && core.loop_active.load(Ordering::SeqCst) {
        return;
    }
    core.stop.rearm();
    core.loop_active.store(true, Ordering::SeqCst);
    *task = Some(tokio::spawn(run_loop(Arc::clone(driver))));
    info!(session = %core.kind, "Session resumed");
}

pub(crate) async fn suspend<D: LadderDriver + ?Sized>(driver: &D, send_uninit: bool) {
    let core = driver.core();
    let was_suspended = core.suspended.swap(true, Ordering::SeqCst);
    core.stop.trigger();

    let mut polls = 0u32;
    while core.loop_active.load(Ordering::SeqCst) {
        tokio::time::sleep(core.config.suspend_poll()).await;
        polls += 1;
        if polls == core.config.suspend_warn_polls {
            warn!(session = %core.kind, polls, "Management loop slow to exit");
        }
    }
    core.task.lock().take();
    if was_suspended {
        return;
    }

    // Wait out a tick started outside the loop
    let _tick = core.tick_lock.lock().await;
    let mut ceiling = driver.on_suspend().await;
    if send_uninit {
        // The adapter changes hands; the next owner reconfigures it
        ceiling = ceiling.min(Rung::LinkUp);
        let uninit = driver.uninit_sequence();
        if !uninit.is_empty() && core.link_up() && !core.configure(uninit).await {
            warn!(session = %core.kind, "Uninit sequence failed");
        }
    }
    if core.rung() > ceiling {
        core.set_rung(ceiling);
    }
    info!(session = %core.kind, rung = ?core.rung(), "Session suspended");
}

pub(crate) async fn shutdown<D: LadderDriver + ?Sized>(driver: &D) {
    let core = driver.core();
    if core.shut_down.swap(true, Ordering::SeqCst) {
        return;
    }
    suspend(driver, false).await;
    info!(session = %core.kind, "Session shut down");
}

/// Implement [`ManagedSession`](crate::ManagedSession) for a handle type
/// with an `inner: Arc<impl LadderDriver>` field
macro_rules! managed_session {
    ($session:ty) => {
        #[async_trait::async_trait]
        impl $crate::session::ManagedSession for $session {
            fn kind(&self) -> $crate::session::SessionKind {
                $crate::ladder::LadderDriver::core(self.inner.as_ref()).kind()
            }

            async fn tick(&self) {
                $crate::ladder::tick(self.inner.as_ref()).await
            }

            async fn suspend(&self, send_uninit: bool) {
                $crate::ladder::suspend(self.inner.as_ref(), send_uninit).await
            }

            fn resume(&self) {
                $crate::ladder::resume(&self.inner)
            }

            fn current_rung(&self) -> $crate::ladder::Rung {
                $crate::ladder::LadderDriver::core(self.inner.as_ref()).rung()
            }

            fn is_suspended(&self) -> bool {
                $crate::ladder::LadderDriver::core(self.inner.as_ref()).is_suspended()
            }

            async fn shutdown(&self) {
                $crate::ladder::shutdown(self.inner.as_ref()).await
            }
        }
    };
}

pub(crate) use managed_session;

#[cfg(test)]
mod tests {
    use super::*;
    use elm_link::mock::{MockAdapter, MockConnector};
    use elm_link::{LinkConfig, Transport};
    use std::sync::atomic::AtomicUsize;

    /// Minimal driver: every advance succeeds immediately
    struct Stepper {
        core: SessionCore,
        init: Vec<String>,
        suspends: AtomicUsize,
    }

    #[async_trait]
    impl LadderDriver for Stepper {
        fn core(&self) -> &SessionCore {
            &self.core
        }

        fn init_sequence(&self) -> &[String] {
            &self.init
        }

        fn uninit_sequence(&self) -> &[String] {
            &[]
        }

        async fn advance(&self, from: Rung) -> Rung {
            match from {
                Rung::LinkUp => Rung::Configured,
                Rung::Configured => Rung::ProtocolConfirmed,
                _ => Rung::Ready,
            }
        }

        async fn on_suspend(&self) -> Rung {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Rung::Ready
        }
    }

    async fn stepper(init: &[&str]) -> (Arc<Stepper>, Arc<Transport>) {
        let connector = MockConnector::new(MockAdapter::echoing());
        let transport = Arc::new(Transport::new(Arc::new(connector), LinkConfig::fast()));
        assert!(transport.open("mock://elm").await);
        let engine = Arc::new(CommandEngine::new(Arc::clone(&transport)));
        let driver = Arc::new(Stepper {
            core: SessionCore::new(SessionKind::Obd2, engine, SessionConfig::fast()),
            init: init.iter().map(|c| c.to_string()).collect(),
            suspends: AtomicUsize::new(0),
        });
        (driver, transport)
    }

    #[tokio::test]
    async fn test_ticks_climb_one_rung_at_a_time() {
        let (driver, _transport) = stepper(&["ATE1"]).await;
        driver.core().unsuspend_for_test();

        let mut seen = Vec::new();
        for _ in 0..5 {
            tick(driver.as_ref()).await;
            seen.push(driver.core().rung());
        }
        assert_eq!(
            seen,
            vec![
                Rung::LinkUp,
                Rung::Configured,
                Rung::ProtocolConfirmed,
                Rung::Ready,
                Rung::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_suspended_session_does_not_tick() {
        let (driver, _transport) = stepper(&["ATE1"]).await;
        tick(driver.as_ref()).await;
        assert_eq!(driver.core().rung(), Rung::Uninitialized);
    }

    #[tokio::test]
    async fn test_missing_init_set_stays_at_rung_zero() {
        let (driver, _transport) = stepper(&[]).await;
        driver.core().unsuspend_for_test();
        for _ in 0..3 {
            tick(driver.as_ref()).await;
        }
        assert_eq!(driver.core().rung(), Rung::Uninitialized);
    }

    #[tokio::test]
    async fn test_link_loss_resets_ladder() {
        let (driver, transport) = stepper(&["ATE1"]).await;
        driver.core().unsuspend_for_test();
        for _ in 0..4 {
            tick(driver.as_ref()).await;
        }
        assert_eq!(driver.core().rung(), Rung::Ready);

        transport.close().await;
        tick(driver.as_ref()).await;
        assert_eq!(driver.core().rung(), Rung::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_runs_loop_and_suspend_waits_for_exit() {
        let (driver, _transport) = stepper(&["ATE1"]).await;
        resume(&driver);
        assert!(!driver.core().is_suspended());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(driver.core().rung(), Rung::Ready);

        suspend(driver.as_ref(), true).await;
        assert!(driver.core().is_suspended());
        assert!(!driver.core().loop_active.load(Ordering::SeqCst));
        assert_eq!(driver.core().rung(), Rung::LinkUp);
        assert_eq!(driver.suspends.load(Ordering::SeqCst), 1);

        // Suspending again is a no-op
        suspend(driver.as_ref(), true).await;
        assert_eq!(driver.suspends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_without_handover_keeps_rung() {
        let (driver, _transport) = stepper(&["ATE1"]).await;
        resume(&driver);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(driver.core().rung(), Rung::Ready);

        suspend(driver.as_ref(), false).await;
        assert!(driver.core().is_suspended());
        assert_eq!(driver.core().rung(), Rung::Ready);

        // Suspended at Ready, resumed straight into maintenance
        resume(&driver);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(driver.core().rung(), Rung::Ready);
        suspend(driver.as_ref(), false).await;
    }

    #[tokio::test]
    async fn test_link_replaced_while_suspended_resets_ladder() {
        let (driver, transport) = stepper(&["ATE1"]).await;
        driver.core().unsuspend_for_test();
        for _ in 0..4 {
            tick(driver.as_ref()).await;
        }
        suspend(driver.as_ref(), false).await;
        assert_eq!(driver.core().rung(), Rung::Ready);

        transport.close().await;
        assert!(transport.open("mock://elm").await);
        driver.core().unsuspend_for_test();
        tick(driver.as_ref()).await;
        assert_eq!(driver.core().rung(), Rung::Uninitialized);
        tick(driver.as_ref()).await;
        assert_eq!(driver.core().rung(), Rung::LinkUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let (driver, _transport) = stepper(&["ATE1"]).await;
        shutdown(driver.as_ref()).await;
        shutdown(driver.as_ref()).await;
        assert!(driver.core().is_shut_down());

        resume(&driver);
        assert!(driver.core().is_suspended());
        assert!(!driver.core().loop_active.load(Ordering::SeqCst));
    }
}
