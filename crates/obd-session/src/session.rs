//! Session trait and kinds

use crate::ladder::Rung;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three mutually exclusive ways of using the vehicle bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Request/response OBD2 polling
    Obd2,
    /// Passive bus sniffing
    Monitor,
    /// Proprietary command/control
    Control,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [SessionKind::Obd2, SessionKind::Monitor, SessionKind::Control];
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionKind::Obd2 => "obd2",
            SessionKind::Monitor => "monitor",
            SessionKind::Control => "control",
        };
        f.write_str(name)
    }
}

/// Common surface of every session state machine.
///
/// Sessions start suspended. Exactly one session may be un-suspended at a
/// time; callers must suspend the previous owner before resuming the next
/// (see [`Switchboard`](crate::Switchboard)). Nothing here enforces it.
#[async_trait]
pub trait ManagedSession: Send + Sync {
    fn kind(&self) -> SessionKind;

    /// Run one ladder step. Ticks never overlap.
    async fn tick(&self);

    /// Stop the management loop and wait until it has exited, optionally
    /// leaving the adapter in a neutral mode.
    async fn suspend(&self, send_uninit: bool);

    /// Re-arm and start the management loop
    fn resume(&self);

    fn current_rung(&self) -> Rung;

    fn is_suspended(&self) -> bool;

    /// Stop for good. Safe to call repeatedly, and before any `resume`.
    async fn shutdown(&self);
}
