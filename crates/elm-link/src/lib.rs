//! ELM327 Link Layer
//!
//! Owns the duplex byte stream to an ELM327-class adapter (a Bluetooth
//! RFCOMM serial TTY, a WiFi adapter socket, or the scripted mock), tracks
//! I/O error counts to derive the connected state, supervises reconnection,
//! and frames AT/OBD command exchanges on top of it.
//!
//! Only one logical command may be outstanding on the link at a time. The
//! [`CommandEngine`] serializes its own exchanges, but the callers above it
//! (the session state machines) are expected to hand the link over
//! cooperatively: at most one session drives it at any moment.

mod command;
mod config;
mod connector;
mod error;
pub mod mock;
mod protocol;
mod signal;
mod stats;
mod supervisor;
mod transport;

pub use command::{has_error_marker, has_ok_marker, validate_response, CommandEngine};
pub use config::LinkConfig;
pub use connector::{connector_for, AdapterStream, Connector, SerialConnector, TcpConnector};
pub use error::LinkError;
pub use protocol::ObdProtocol;
pub use signal::StopSignal;
pub use stats::{LinkStats, LinkStatsSnapshot};
pub use supervisor::{AttemptOutcome, LinkEvent, ReconnectSupervisor};
pub use transport::{LinkState, Transport};

/// Framing constants shared by every layer that parses adapter output
pub mod framing {
    /// Terminator appended to every command line
    pub const COMMAND_TERMINATOR: &str = "\r";
    /// Prompt byte the adapter prints when it is ready for the next command
    pub const PROMPT: u8 = b'>';
    /// Raw carriage return, used as the stop byte while sniffing
    pub const CARRIAGE_RETURN: u8 = b'\r';
    /// Delimiter that replaces CR/LF runs in collected responses
    pub const FRAME_DELIMITER: char = '|';
    /// Marker the adapter prints while auto-detecting the bus protocol
    pub const SEARCHING: &str = "SEARCHING...";
}
