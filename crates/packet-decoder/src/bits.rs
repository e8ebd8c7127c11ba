//! Bit-range extraction
//!
//! Bits are numbered MSB-first from the first data byte: bit 0 is the top
//! bit of byte 0, bit 15 the bottom bit of byte 1. Ranges are inclusive.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inclusive bit range `start-end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BitRange {
    pub start: u16,
    pub end: u16,
}

impl BitRange {
    pub fn new(start: u16, end: u16) -> Result<Self, DecodeError> {
        if end < start {
            return Err(DecodeError::InvalidBitRange(format!("{start}-{end}")));
        }
        Ok(Self { start, end })
    }

    /// Whole bytes `first..=last`
    pub fn bytes(first: u16, last: u16) -> Result<Self, DecodeError> {
        let start = first.checked_mul(8);
        let end = last.checked_mul(8).and_then(|bit| bit.checked_add(7));
        match (start, end) {
            (Some(start), Some(end)) => Self::new(start, end),
            _ => Err(DecodeError::InvalidBitRange(format!("bytes {first}-{last}"))),
        }
    }

    pub fn width(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Starts on a byte boundary and ends on one
    pub fn is_byte_aligned(&self) -> bool {
        self.start % 8 == 0 && self.end % 8 == 7
    }

    fn check_fits(&self, data: &[u8]) -> Result<(), DecodeError> {
        let available = data.len() * 8;
        if usize::from(self.end) >= available {
            return Err(DecodeError::OutOfRange {
                start: self.start,
                end: self.end,
                available,
            });
        }
        Ok(())
    }
}

impl fmt::Display for BitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for BitRange {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DecodeError::InvalidBitRange(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse().map_err(|_| invalid())?;
        let end = end.trim().parse().map_err(|_| invalid())?;
        Self::new(start, end)
    }
}

impl TryFrom<String> for BitRange {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BitRange> for String {
    fn from(range: BitRange) -> Self {
        range.to_string()
    }
}

/// Extract `range` from `data`, returned big-endian in the fewest bytes
/// that hold its width.
pub fn extract_bits(data: &[u8], range: BitRange) -> Result<Vec<u8>, DecodeError> {
    if range.is_byte_aligned() {
        extract_bits_aligned(data, range)
    } else {
        extract_bits_general(data, range)
    }
}

/// Byte-aligned fast path: a plain sub-slice
pub fn extract_bits_aligned(data: &[u8], range: BitRange) -> Result<Vec<u8>, DecodeError> {
    if !range.is_byte_aligned() {
        return Err(DecodeError::InvalidBitRange(range.to_string()));
    }
    range.check_fits(data)?;
    let first = usize::from(range.start / 8);
    let last = usize::from(range.end / 8);
    Ok(data[first..=last].to_vec())
}

/// General extractor: treat the covering bytes as one big-endian unsigned
/// integer, shift off the bits past the end of the range, mask to width.
pub fn extract_bits_general(data: &[u8], range: BitRange) -> Result<Vec<u8>, DecodeError> {
    range.check_fits(data)?;
    let first = usize::from(range.start / 8);
    let last = usize::from(range.end / 8);
    let window = &data[first..=last];

    let shift = 7 - u32::from(range.end % 8);
    let mut shifted = vec![0u8; window.len()];
    for (i, byte) in window.iter().enumerate() {
        let carry = if i > 0 && shift > 0 {
            window[i - 1] << (8 - shift)
        } else {
            0
        };
        shifted[i] = (byte >> shift) | carry;
    }

    let width = range.width();
    let out_len = width.div_ceil(8);
    let mut out = shifted.split_off(shifted.len() - out_len);
    let top_bits = width % 8;
    if top_bits != 0 {
        out[0] &= (1u8 << top_bits) - 1;
    }
    Ok(out)
}

/// Big-endian value of `bytes` as a float (exact up to 2^53)
pub(crate) fn bytes_to_f64(bytes: &[u8]) -> f64 {
    bytes.iter().fold(0.0, |acc, &b| acc * 256.0 + f64::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_range() {
        assert_eq!("8-15".parse::<BitRange>().unwrap(), BitRange { start: 8, end: 15 });
        assert!("15-8".parse::<BitRange>().is_err());
        assert!("x-8".parse::<BitRange>().is_err());
        assert_eq!(BitRange::bytes(1, 2).unwrap().to_string(), "8-23");
    }

    #[test]
    fn test_sub_byte_extraction() {
        // 0xBE = 1011_1110; bits 2..=5 -> 1111
        let range = BitRange::new(2, 5).unwrap();
        assert_eq!(extract_bits(&[0xBE], range).unwrap(), vec![0x0F]);
        // single bit 0 of 0x80
        assert_eq!(extract_bits(&[0x80], BitRange::new(0, 0).unwrap()).unwrap(), vec![1]);
    }

    #[test]
    fn test_cross_byte_extraction() {
        // 0x1A 0xF8 = 0001_1010 1111_1000; bits 4..=11 -> 1010_1111
        let range = BitRange::new(4, 11).unwrap();
        assert_eq!(extract_bits(&[0x1A, 0xF8], range).unwrap(), vec![0xAF]);
        // bits 3..=13 -> 110_1011_1110 (11 bits)
        let range = BitRange::new(3, 13).unwrap();
        assert_eq!(extract_bits(&[0x1A, 0xF8], range).unwrap(), vec![0x06, 0xBE]);
    }

    #[test]
    fn test_byte_range_beyond_bit_numbering() {
        // Byte 8191 ends on bit 65535, the last one a u16 can number
        assert_eq!(BitRange::bytes(8191, 8191).unwrap().end, u16::MAX);
        assert!(matches!(
            BitRange::bytes(0, 8192),
            Err(DecodeError::InvalidBitRange(_))
        ));
        assert!(BitRange::bytes(u16::MAX, u16::MAX).is_err());
    }

    #[test]
    fn test_out_of_range() {
        let range = BitRange::new(8, 15).unwrap();
        assert!(matches!(
            extract_bits(&[0x01], range),
            Err(DecodeError::OutOfRange { available: 8, .. })
        ));
    }

    proptest! {
        #[test]
        fn test_general_matches_aligned(
            data in proptest::collection::vec(any::<u8>(), 1..40),
            first in 0usize..40,
            len in 1usize..40,
        ) {
            let first = first % data.len();
            let last = (first + len - 1).min(data.len() - 1);
            let range = BitRange::bytes(first as u16, last as u16).unwrap();
            prop_assert_eq!(
                extract_bits_general(&data, range).unwrap(),
                extract_bits_aligned(&data, range).unwrap()
            );
        }

        #[test]
        fn test_single_bits_match_shift(byte in any::<u8>(), bit in 0u16..8) {
            let range = BitRange::new(bit, bit).unwrap();
            let expected = (byte >> (7 - bit)) & 1;
            prop_assert_eq!(extract_bits(&[byte], range).unwrap(), vec![expected]);
        }
    }
}
