//! CAN/OBD-II Packet Decode Engine
//!
//! Turns the ASCII lines an ELM327 prints into named engineering values:
//!
//! 1. [`split_frame`] separates a transmitter header from its data bytes,
//! 2. [`reassemble`] folds the frames of one response into one byte string
//!    per transmitter (ISO-TP multi-frame aware),
//! 3. [`extract_bits`] cuts an arbitrary bit range out of those bytes,
//! 4. [`FormulaProgram`] evaluates the small arithmetic language or one of
//!    the named special decoders, and
//! 5. [`decode_dtcs`] renders diagnostic trouble codes.
//!
//! Every entry point is stateless. Malformed input yields an empty result
//! for that one field or frame and never aborts sibling fields.

mod bits;
mod decoder;
mod dtc;
mod error;
mod formula;
mod frame;
mod reassembly;

pub use bits::{extract_bits, extract_bits_aligned, extract_bits_general, BitRange};
pub use decoder::{DataPointDef, DecodedValue, Decoder, SniffRule};
pub use dtc::{decode_dtc, decode_dtcs, DtcCategory, DtcCode};
pub use error::DecodeError;
pub use formula::{FormulaProgram, Operator, Operand, SpecialDecoder, Step};
pub use frame::{split_frame, split_legacy_frame, HeaderKind, RawFrame};
pub use reassembly::{ack_signature, reassemble, ReassembledResponse};

/// Protocol numbers at or above this value are CAN (ISO 15765-4 and up)
pub const FIRST_CAN_PROTOCOL: u8 = 6;

/// Check whether an ELM327 protocol number denotes a CAN bus
pub fn is_can_protocol(protocol: u8) -> bool {
    protocol >= FIRST_CAN_PROTOCOL
}
