//! Frame splitting
//!
//! One adapter line (headers and spaces on) is a transmitter header followed
//! by data bytes. CAN headers are told apart by where the first space falls:
//! `7E8 04 41 0C 1A F8` carries an 11-bit header, `18 DA F1 10 03 41 0D 28`
//! a 29-bit one.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

/// 3 header chars, a space, one data byte
const MIN_11BIT_LINE: usize = 6;
/// 11 header chars, a space, one data byte
const MIN_29BIT_LINE: usize = 14;
/// 3 header bytes, one data byte and the checksum
const MIN_LEGACY_LINE: usize = 14;

const HEADER_11BIT_LEN: usize = 3;
const HEADER_29BIT_LEN: usize = 11;
const HEADER_LEGACY_LEN: usize = 8;

/// Which header layout a frame used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderKind {
    /// 11-bit CAN identifier, `7E8`
    Can11,
    /// 29-bit CAN identifier, `18 DA F1 10`
    Can29,
    /// J1850 / ISO 9141 / KWP three-byte header, `48 6B 10`
    Legacy,
}

/// One line split into transmitter header and data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub header: String,
    pub data: String,
    pub kind: HeaderKind,
}

impl RawFrame {
    /// Data bytes as text tokens
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.data.split_whitespace()
    }

    /// Parse the data bytes. Any malformed token fails the whole frame.
    pub fn bytes(&self) -> Result<Vec<u8>, DecodeError> {
        parse_hex_bytes(&self.data)
    }
}

/// Split a CAN line into header and data, or `None` when it cannot be a
/// frame (no header-shaped prefix, or too short for its kind).
pub fn split_frame(line: &str) -> Option<RawFrame> {
    let line = line.trim();
    let (kind, header_len, min_len) = match line.find(' ')? {
        3 => (HeaderKind::Can11, HEADER_11BIT_LEN, MIN_11BIT_LINE),
        2 => (HeaderKind::Can29, HEADER_29BIT_LEN, MIN_29BIT_LINE),
        _ => return None,
    };
    if line.len() < min_len {
        return None;
    }
    let header = line.get(..header_len)?;
    let data = line.get(header_len..)?.trim();
    if data.is_empty() {
        return None;
    }
    Some(RawFrame {
        header: header.to_string(),
        data: data.to_string(),
        kind,
    })
}

/// Split a non-CAN line (`48 6B 10 41 0C 1A F8 C4`) into its three-byte
/// header and the remaining bytes, checksum included.
pub fn split_legacy_frame(line: &str) -> Option<RawFrame> {
    let line = line.trim();
    if line.len() < MIN_LEGACY_LINE || line.find(' ')? != 2 {
        return None;
    }
    let header = line.get(..HEADER_LEGACY_LEN)?;
    let data = line.get(HEADER_LEGACY_LEN..)?.trim();
    Some(RawFrame {
        header: header.to_string(),
        data: data.to_string(),
        kind: HeaderKind::Legacy,
    })
}

/// Parse a single two-digit hex token
pub(crate) fn parse_hex_byte(token: &str) -> Result<u8, DecodeError> {
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidHex(token.to_string()));
    }
    u8::from_str_radix(token, 16).map_err(|_| DecodeError::InvalidHex(token.to_string()))
}

/// Parse whitespace-separated hex bytes; compact runs (`1AF8`) are accepted
/// too as long as they have an even number of digits.
pub(crate) fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    for token in text.split_whitespace() {
        if token.len() % 2 != 0 {
            return Err(DecodeError::InvalidHex(token.to_string()));
        }
        for i in (0..token.len()).step_by(2) {
            let pair = token
                .get(i..i + 2)
                .ok_or_else(|| DecodeError::InvalidHex(token.to_string()))?;
            out.push(parse_hex_byte(pair)?);
        }
    }
    Ok(out)
}

/// Render bytes as `41 0C 1A F8`
pub(crate) fn to_spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_11bit() {
        let frame = split_frame("7E8 04 41 0C 1A F8").unwrap();
        assert_eq!(frame.header, "7E8");
        assert_eq!(frame.data, "04 41 0C 1A F8");
        assert_eq!(frame.kind, HeaderKind::Can11);
        assert_eq!(frame.bytes().unwrap(), vec![0x04, 0x41, 0x0C, 0x1A, 0xF8]);
    }

    #[test]
    fn test_split_29bit() {
        let frame = split_frame("18 DA F1 10 03 41 0D 28 ").unwrap();
        assert_eq!(frame.header, "18 DA F1 10");
        assert_eq!(frame.data, "03 41 0D 28");
        assert_eq!(frame.kind, HeaderKind::Can29);
    }

    #[test]
    fn test_short_and_non_frames_are_discarded() {
        assert!(split_frame("7E8 ").is_none());
        assert!(split_frame("7E8 0").is_none());
        assert!(split_frame("18 DA F1 10").is_none());
        assert!(split_frame("NO DATA").is_none());
        assert!(split_frame("SEARCHING...").is_none());
        assert!(split_frame("ELM327 v1.5").is_none());
    }

    #[test]
    fn test_split_legacy() {
        let frame = split_legacy_frame("48 6B 10 41 0C 1A F8 C4").unwrap();
        assert_eq!(frame.header, "48 6B 10");
        assert_eq!(frame.data, "41 0C 1A F8 C4");
        assert!(split_legacy_frame("48 6B 10 41").is_none());
    }

    #[test]
    fn test_hex_parsing() {
        assert_eq!(parse_hex_bytes("1AF8 00").unwrap(), vec![0x1A, 0xF8, 0x00]);
        assert!(parse_hex_bytes("1AF").is_err());
        assert!(parse_hex_bytes("ZZ").is_err());
        assert_eq!(to_spaced_hex(&[0x41, 0x0C]), "41 0C");
    }
}
