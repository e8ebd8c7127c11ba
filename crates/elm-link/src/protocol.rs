//! OBD-II Protocol Definitions

use serde::{Deserialize, Serialize};

/// Bus protocols an ELM327 reports through `ATDPN`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObdProtocol {
    /// Automatic protocol detection
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (10.4 kbaud, 5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (slow init, 10.4 kbaud)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init, 10.4 kbaud)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
    /// SAE J1939 CAN (29 bit ID, 250 kbaud)
    SaeJ1939,
    /// User-defined CAN 1 (11 bit ID, 125 kbaud)
    UserCan1,
    /// User-defined CAN 2 (11 bit ID, 50 kbaud)
    UserCan2,
}

impl ObdProtocol {
    /// Get the ELM327 AT command that selects this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{:X}", self.number())
    }

    /// Protocol number as printed by `ATDPN`
    pub fn number(&self) -> u8 {
        match self {
            ObdProtocol::Auto => 0,
            ObdProtocol::J1850Pwm => 1,
            ObdProtocol::J1850Vpw => 2,
            ObdProtocol::Iso9141_2 => 3,
            ObdProtocol::Iso14230_4Kwp => 4,
            ObdProtocol::Iso14230_4KwpFast => 5,
            ObdProtocol::Iso15765_4Can11bit500 => 6,
            ObdProtocol::Iso15765_4Can29bit500 => 7,
            ObdProtocol::Iso15765_4Can11bit250 => 8,
            ObdProtocol::Iso15765_4Can29bit250 => 9,
            ObdProtocol::SaeJ1939 => 0xA,
            ObdProtocol::UserCan1 => 0xB,
            ObdProtocol::UserCan2 => 0xC,
        }
    }

    /// Look up a protocol by number
    pub fn from_number(number: u8) -> Option<Self> {
        let protocol = match number {
            0 => ObdProtocol::Auto,
            1 => ObdProtocol::J1850Pwm,
            2 => ObdProtocol::J1850Vpw,
            3 => ObdProtocol::Iso9141_2,
            4 => ObdProtocol::Iso14230_4Kwp,
            5 => ObdProtocol::Iso14230_4KwpFast,
            6 => ObdProtocol::Iso15765_4Can11bit500,
            7 => ObdProtocol::Iso15765_4Can29bit500,
            8 => ObdProtocol::Iso15765_4Can11bit250,
            9 => ObdProtocol::Iso15765_4Can29bit250,
            0xA => ObdProtocol::SaeJ1939,
            0xB => ObdProtocol::UserCan1,
            0xC => ObdProtocol::UserCan2,
            _ => return None,
        };
        Some(protocol)
    }

    /// Parse an `ATDPN` reply such as `A6` (auto, currently 6) or `7`.
    ///
    /// Echo and delimiters are tolerated: the last non-empty segment wins.
    pub fn from_dpn_reply(reply: &str) -> Option<Self> {
        let segment = reply
            .split(crate::framing::FRAME_DELIMITER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .last()?;
        // `A` alone is J1939; as a prefix it marks automatic selection
        let digits = match segment.len() {
            2 => segment.strip_prefix('A')?,
            _ => segment,
        };
        if digits.len() != 1 {
            return None;
        }
        let number = u8::from_str_radix(digits, 16).ok()?;
        Self::from_number(number)
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        self.number() >= 6
    }

    /// Check if frames on this protocol carry 29-bit identifiers
    pub fn is_29bit(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can29bit250
                | ObdProtocol::SaeJ1939
        )
    }
}

impl Default for ObdProtocol {
    fn default() -> Self {
        ObdProtocol::Auto
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpn_reply_parsing() {
        assert_eq!(
            ObdProtocol::from_dpn_reply("ATDPN|A6|"),
            Some(ObdProtocol::Iso15765_4Can11bit500)
        );
        assert_eq!(ObdProtocol::from_dpn_reply("7"), Some(ObdProtocol::Iso15765_4Can29bit500));
        assert_eq!(ObdProtocol::from_dpn_reply("ATDPN|A|"), Some(ObdProtocol::SaeJ1939));
        assert_eq!(ObdProtocol::from_dpn_reply("AAB"), None);
        assert_eq!(ObdProtocol::from_dpn_reply("B6"), None);
        assert_eq!(ObdProtocol::from_dpn_reply(""), None);
    }

    #[test]
    fn test_can_classification() {
        assert!(!ObdProtocol::Iso14230_4KwpFast.is_can());
        assert!(ObdProtocol::Iso15765_4Can11bit500.is_can());
        assert!(ObdProtocol::SaeJ1939.is_29bit());
        assert_eq!(ObdProtocol::SaeJ1939.to_elm_command(), "ATSPA");
    }
}
