//! Session Error Types

use crate::ladder::Rung;
use crate::session::SessionKind;
use packet_decoder::DecodeError;
use thiserror::Error;

/// Errors from session-level operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session does not currently own the link
    #[error("Session is suspended")]
    Suspended,

    /// Session has not reached its terminal rung
    #[error("Session not ready (at {0:?})")]
    NotReady(Rung),

    /// Session was shut down
    #[error("Session has been shut down")]
    ShutDown,

    /// Lookup has no definition for this data point
    #[error("Unknown data point: {0}")]
    UnknownDataPoint(String),

    /// Lookup has no macro with this name
    #[error("Unknown command macro: {0}")]
    UnknownCommand(String),

    /// Macro text could not be parsed
    #[error("Invalid macro segment {segment:?}: {reason}")]
    InvalidMacro {
        segment: String,
        reason: &'static str,
    },

    /// Adapter gave no valid response before the retry deadline
    #[error("No valid response to {0:?}")]
    NoResponse(String),

    /// Response arrived but could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A wait was cut short by suspension or shutdown
    #[error("Interrupted")]
    Interrupted,

    /// Switchboard has no session of the requested kind
    #[error("No {0} session registered")]
    UnknownSession(SessionKind),
}
