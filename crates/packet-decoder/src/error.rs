//! Decode Error Types

use thiserror::Error;

/// Errors while parsing or decoding adapter output
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// A byte token was not two hex digits
    #[error("Invalid hex byte: {0:?}")]
    InvalidHex(String),

    /// Formula text could not be parsed
    #[error("Invalid formula step {step:?}: {reason}")]
    InvalidFormula { step: String, reason: &'static str },

    /// Bit range text could not be parsed or is reversed
    #[error("Invalid bit range: {0:?}")]
    InvalidBitRange(String),

    /// Requested bits lie beyond the available data
    #[error("Bit range {start}-{end} exceeds {available} available bits")]
    OutOfRange {
        start: u16,
        end: u16,
        available: usize,
    },

    /// Variable still unresolved after substitution
    #[error("Unresolved variable {0}")]
    UnresolvedVariable(char),

    /// Division by zero in a formula step
    #[error("Division by zero")]
    DivisionByZero,

    /// Decoded value outside the configured plausibility window
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    ValueOutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Nothing in the response matched the request
    #[error("No data in response")]
    NoData,
}
