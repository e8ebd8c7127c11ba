//! Response reassembly
//!
//! Folds the lines of one adapter response into one payload per
//! transmitter. On CAN the ISO-TP PCI byte of each frame is honored: single
//! frames carry their length, first frames (`10 nn`) carry the total size
//! and open a multi-frame transfer, and consecutive frames (`21`, `22`, ...)
//! from the same transmitter are appended in arrival order. On the older
//! buses each line ends with a checksum byte that is trimmed.
//!
//! Frames that do not fit (wrong acknowledgement, bad offsets, orphan
//! continuations, malformed hex) are dropped one by one; partial results
//! are normal.

use crate::frame::{parse_hex_bytes, split_frame, split_legacy_frame, to_spaced_hex, RawFrame};
use crate::is_can_protocol;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Added to the request mode to form the positive response mode
const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;

/// Reassembled payloads keyed by transmitter header, in address order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassembledResponse {
    payloads: BTreeMap<String, Vec<u8>>,
}

impl ReassembledResponse {
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn get(&self, header: &str) -> Option<&[u8]> {
        self.payloads.get(header).map(Vec::as_slice)
    }

    /// Payload of the lowest transmitter address that sent any data
    pub fn first(&self) -> Option<(&str, &[u8])> {
        self.iter().find(|(_, bytes)| !bytes.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.payloads
            .iter()
            .map(|(header, bytes)| (header.as_str(), bytes.as_slice()))
    }

    /// Payload of one transmitter as `41 0C` style text
    pub fn hex(&self, header: &str) -> Option<String> {
        self.get(header).map(to_spaced_hex)
    }
}

/// Acknowledgement signature a positive response to `request` starts with:
/// the response mode (request mode + 0x40) followed by the echoed PID bytes.
///
/// Returns `None` for requests that are not hex OBD/UDS requests (AT
/// commands, empty text).
pub fn ack_signature(request: &str) -> Option<Vec<u8>> {
    let compact: String = request.split_whitespace().collect();
    let bytes = parse_hex_bytes(&compact).ok()?;
    let (&mode, params) = bytes.split_first()?;
    if mode >= POSITIVE_RESPONSE_OFFSET {
        return None;
    }
    let echoed = match mode {
        0x03 | 0x04 | 0x07 | 0x0A => 0,
        0x01 | 0x05 | 0x06 | 0x08 | 0x09 => 1,
        _ => 2,
    };
    let mut signature = vec![mode + POSITIVE_RESPONSE_OFFSET];
    signature.extend(params.iter().take(echoed));
    Some(signature)
}

/// Modes whose CAN responses carry a DTC count byte before the codes
fn has_count_byte(signature: &[u8]) -> bool {
    matches!(signature.first(), Some(0x43 | 0x47 | 0x4A))
}

/// Transfer state for a transmitter that sent a first frame
#[derive(Debug)]
struct Transfer {
    remaining: usize,
}

/// Reassemble the response to `request` (lines separated by `|`).
///
/// `protocol` is the ELM327 protocol number; 6 and above are CAN.
pub fn reassemble(request: &str, response: &str, protocol: u8) -> ReassembledResponse {
    let mut result = ReassembledResponse::default();
    let Some(signature) = ack_signature(request) else {
        return result;
    };
    let echo: String = request.split_whitespace().collect();
    let can = is_can_protocol(protocol);
    let mut transfers: HashMap<String, Transfer> = HashMap::new();

    for line in response.split('|').map(str::trim) {
        if line.is_empty() || line.split_whitespace().collect::<String>() == echo {
            continue;
        }
        let folded = if can {
            split_frame(line).and_then(|frame| fold_can_frame(&frame, &signature, &mut transfers))
        } else {
            split_legacy_frame(line).and_then(|frame| fold_legacy_frame(&frame, &signature))
        };
        match folded {
            Some((header, data)) => result.payloads.entry(header).or_default().extend(data),
            None => trace!(line, "Dropped frame"),
        }
    }
    result
}

fn fold_can_frame(
    frame: &RawFrame,
    signature: &[u8],
    transfers: &mut HashMap<String, Transfer>,
) -> Option<(String, Vec<u8>)> {
    let bytes = frame.bytes().ok()?;
    let (&pci, rest) = bytes.split_first()?;

    match pci >> 4 {
        PCI_SINGLE => {
            let length = usize::from(pci & 0x0F);
            let body = rest.get(..length)?;
            let mut data = strip_signature(body, signature)?;
            if has_count_byte(signature) && !data.is_empty() {
                data.remove(0);
            }
            transfers.remove(&frame.header);
            Some((frame.header.clone(), data))
        }
        PCI_FIRST => {
            let (&size_low, body) = rest.split_first()?;
            let size = (usize::from(pci & 0x0F) << 8) | usize::from(size_low);
            let mut data = strip_signature(body, signature)?;
            let mut remaining = size.checked_sub(signature.len())?;
            if has_count_byte(signature) && !data.is_empty() {
                data.remove(0);
                remaining = remaining.saturating_sub(1);
            }
            data.truncate(remaining);
            remaining -= data.len();
            transfers.insert(frame.header.clone(), Transfer { remaining });
            Some((frame.header.clone(), data))
        }
        PCI_CONSECUTIVE => {
            let transfer = transfers.get_mut(&frame.header)?;
            let take = rest.len().min(transfer.remaining);
            transfer.remaining -= take;
            Some((frame.header.clone(), rest[..take].to_vec()))
        }
        _ => None,
    }
}

fn fold_legacy_frame(frame: &RawFrame, signature: &[u8]) -> Option<(String, Vec<u8>)> {
    let bytes = frame.bytes().ok()?;
    let (_checksum, body) = bytes.split_last()?;
    let data = strip_signature(body, signature)?;
    Some((frame.header.clone(), data))
}

/// Data following the signature, or `None` if the signature is absent
fn strip_signature(body: &[u8], signature: &[u8]) -> Option<Vec<u8>> {
    body.strip_prefix(signature).map(<[u8]>::to_vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAN_11: u8 = 6;

    #[test]
    fn test_ack_signature() {
        assert_eq!(ack_signature("010C"), Some(vec![0x41, 0x0C]));
        assert_eq!(ack_signature("01 0C"), Some(vec![0x41, 0x0C]));
        assert_eq!(ack_signature("22F190"), Some(vec![0x62, 0xF1, 0x90]));
        assert_eq!(ack_signature("03"), Some(vec![0x43]));
        assert_eq!(ack_signature("0902"), Some(vec![0x49, 0x02]));
        assert_eq!(ack_signature("ATRV"), None);
        assert_eq!(ack_signature(""), None);
    }

    #[test]
    fn test_single_frame() {
        let result = reassemble("010C", "010C|7E8 04 41 0C 1A F8 |", CAN_11);
        assert_eq!(result.get("7E8"), Some(&[0x1A, 0xF8][..]));
    }

    #[test]
    fn test_multiple_transmitters_in_address_order() {
        let response = "0100|7E9 06 41 00 98 18 80 11 |7E8 06 41 00 BE 3F A8 13 |";
        let result = reassemble("0100", response, CAN_11);
        let headers: Vec<&str> = result.iter().map(|(h, _)| h).collect();
        assert_eq!(headers, vec!["7E8", "7E9"]);
        assert_eq!(result.first().unwrap().1, &[0xBE, 0x3F, 0xA8, 0x13]);
    }

    #[test]
    fn test_two_frame_transfer_skips_sequence_byte() {
        let response = "0902|7E8 10 0A 49 02 01 31 44 34 |7E8 21 47 50 30 00 00 00 00 |";
        let result = reassemble("0902", response, CAN_11);
        // size 0x0A covers 49 02 + 8 data bytes; padding after that is dropped
        assert_eq!(
            result.hex("7E8").unwrap(),
            "01 31 44 34 47 50 30 00"
        );
    }

    #[test]
    fn test_vin_transfer() {
        let response = "0902|7E8 10 14 49 02 01 31 44 34 |7E8 21 47 50 30 30 52 35 35 |7E8 22 42 31 32 33 34 35 36 |";
        let result = reassemble("0902", response, CAN_11);
        let payload = result.get("7E8").unwrap();
        assert_eq!(payload.len(), 0x14 - 2);
        assert_eq!(&payload[1..], b"1D4GP00R55B123456");
    }

    #[test]
    fn test_orphan_continuation_and_bad_frames_are_dropped() {
        let response = "010C|7E9 21 00 11 22|7E8 04 41 0C 1A F8|7EA 09 41 0C|7EB 04 41 0D 10 20|7EC 04 41 0C ZZ 00|";
        let result = reassemble("010C", response, CAN_11);
        assert_eq!(result.len(), 1);
        assert_eq!(result.get("7E8"), Some(&[0x1A, 0xF8][..]));
    }

    #[test]
    fn test_dtc_count_byte_skipped_on_can() {
        let result = reassemble("03", "03|7E8 06 43 02 01 33 C1 00 |", CAN_11);
        assert_eq!(result.get("7E8"), Some(&[0x01, 0x33, 0xC1, 0x00][..]));
    }

    #[test]
    fn test_legacy_checksum_trimmed() {
        let result = reassemble("010C", "010C|48 6B 10 41 0C 1A F8 C4|", 3);
        assert_eq!(result.get("48 6B 10"), Some(&[0x1A, 0xF8][..]));
    }

    #[test]
    fn test_no_data_yields_empty() {
        assert!(reassemble("010C", "010C|NO DATA|", CAN_11).is_empty());
        assert!(reassemble("ATRV", "ATRV|12.6V|", CAN_11).is_empty());
    }
}
