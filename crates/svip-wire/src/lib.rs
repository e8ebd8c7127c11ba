//! SVIP Wire Framing
//!
//! Messages are pipe-delimited fields terminated by `>`:
//!
//! ```text
//! ACK|PONG|>
//! NACK|>
//! DPN_ARRIVED|rpm|1726|>
//! OOB_ARRIVED|link|connected|>
//! ```
//!
//! A literal `|`, `>` or `\` inside a field is escaped with a backslash.

mod error;
mod message;
mod reader;

pub use error::WireError;
pub use message::{escape, unescape, Message};
pub use reader::MessageReader;

/// Field separator
pub const FIELD_SEPARATOR: char = '|';
/// Message terminator
pub const TERMINATOR: char = '>';
/// Escape prefix
pub const ESCAPE: char = '\\';
