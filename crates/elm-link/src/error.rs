//! Link Error Types

use thiserror::Error;

/// Errors raised inside the link layer.
///
/// These never cross the [`Transport`](crate::Transport) or
/// [`CommandEngine`](crate::CommandEngine) primitives: they are logged and
/// turned into error-counter increments, `false`, or an empty response there.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Peer address rejected before any I/O was attempted
    #[error("Invalid adapter address: {0:?}")]
    InvalidAddress(String),

    /// Serial port could not be opened
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Socket or stream level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for the adapter
    #[error("Timeout waiting for adapter after {0}ms")]
    Timeout(u64),

    /// Operation needs an open stream
    #[error("Adapter link is not connected")]
    NotConnected,

    /// Connector was told to refuse the connection (mock only)
    #[error("Connection refused: {0}")]
    Refused(String),
}

impl From<tokio_serial::Error> for LinkError {
    fn from(err: tokio_serial::Error) -> Self {
        LinkError::SerialError(err.to_string())
    }
}
