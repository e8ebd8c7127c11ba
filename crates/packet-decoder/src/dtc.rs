//! Diagnostic trouble code decoding

use crate::frame::parse_hex_bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// DTC system letter, selected by the top two bits of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    /// P - powertrain
    Powertrain,
    /// C - chassis
    Chassis,
    /// B - body
    Body,
    /// U - network
    Network,
}

impl DtcCategory {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}

/// One decoded trouble code, e.g. `P0133`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtcCode {
    pub category: DtcCategory,
    /// First digit, 0-3
    pub digit: u8,
    /// Remaining three characters, taken verbatim from the nibbles
    pub body: String,
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.category.letter(), self.digit, self.body)
    }
}

impl DtcCode {
    /// Decode from the 4-hex-digit form (`"0133"`, spaces allowed)
    pub fn from_hex(text: &str) -> Option<Self> {
        match parse_hex_bytes(text).ok()?.as_slice() {
            [a, b] => decode_dtc([*a, *b]),
            _ => None,
        }
    }
}

/// Decode one 2-byte code. `00 00` means "no code".
pub fn decode_dtc(pair: [u8; 2]) -> Option<DtcCode> {
    let [high, low] = pair;
    if high == 0 && low == 0 {
        return None;
    }
    let nibble = high >> 4;
    Some(DtcCode {
        category: DtcCategory::from_bits(nibble >> 2),
        digit: nibble & 0x03,
        body: format!("{:X}{:02X}", high & 0x0F, low),
    })
}

/// Decode every complete 2-byte group; zero pairs and a trailing odd byte
/// are skipped.
pub fn decode_dtcs(bytes: &[u8]) -> Vec<DtcCode> {
    bytes
        .chunks_exact(2)
        .filter_map(|pair| decode_dtc([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_category_examples() {
        assert_eq!(decode_dtc([0x01, 0x00]).unwrap().to_string(), "P0100");
        assert_eq!(decode_dtc([0x43, 0x00]).unwrap().to_string(), "C0300");
        assert_eq!(decode_dtc([0x82, 0x00]).unwrap().to_string(), "B0200");
        assert_eq!(decode_dtc([0xC1, 0x00]).unwrap().to_string(), "U0100");
        assert!(decode_dtc([0x00, 0x00]).is_none());
    }

    #[test]
    fn test_multiple_codes() {
        let codes: Vec<String> = decode_dtcs(&[0x01, 0x33, 0x00, 0x00, 0xC1, 0x00, 0x07])
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(codes, vec!["P0133", "U0100"]);
    }

    #[test]
    fn test_from_hex() {
        assert_eq!(DtcCode::from_hex("01 33").unwrap().to_string(), "P0133");
        assert_eq!(DtcCode::from_hex("0133").unwrap().to_string(), "P0133");
        assert!(DtcCode::from_hex("0000").is_none());
        assert!(DtcCode::from_hex("01").is_none());
    }

    proptest! {
        #[test]
        fn test_code_shape(high in any::<u8>(), low in any::<u8>()) {
            prop_assume!(high != 0 || low != 0);
            let code = decode_dtc([high, low]).unwrap();
            let text = code.to_string();
            prop_assert_eq!(text.len(), 5);
            prop_assert!("PCBU".contains(&text[..1]));
            prop_assert!(code.digit <= 3);
            prop_assert_eq!(&text[2..], format!("{:X}{:02X}", high & 0x0F, low));
        }
    }
}
