//! Wire Error Types

use thiserror::Error;

/// Errors while parsing SVIP messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Message had no fields
    #[error("Empty message")]
    Empty,

    /// A known message kind lacked fields
    #[error("{kind} needs {expected} field(s), got {actual}")]
    MissingField {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Message ended in the middle of an escape
    #[error("Dangling escape at end of message")]
    DanglingEscape,

    /// Bytes were not UTF-8
    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    /// Buffered input grew past the limit without a terminator
    #[error("No terminator within {0} bytes")]
    Overflow(usize),
}
