//! Data-point decoding
//!
//! Combines reassembly, bit extraction, formula evaluation and a
//! plausibility window into one step from adapter text to a named value.

use crate::bits::{extract_bits, BitRange};
use crate::error::DecodeError;
use crate::formula::{FormulaProgram, SpecialDecoder};
use crate::frame::RawFrame;
use crate::reassembly::reassemble;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Definition of a requestable data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointDef {
    /// Published name
    pub name: String,
    /// Request sent to the adapter (`010C`, `ATRV`, ...)
    pub request: String,
    pub formula: FormulaProgram,
    /// Optional bit window applied before the formula
    #[serde(default)]
    pub bits: Option<BitRange>,
    /// Lower plausibility bound
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper plausibility bound
    #[serde(default)]
    pub max: Option<f64>,
}

impl DataPointDef {
    pub fn new(name: &str, request: &str, formula: FormulaProgram) -> Self {
        Self {
            name: name.to_string(),
            request: request.to_string(),
            formula,
            bits: None,
            min: None,
            max: None,
        }
    }

    pub fn with_bits(mut self, bits: BitRange) -> Self {
        self.bits = Some(bits);
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    fn check_range(&self, value: &str) -> Result<(), DecodeError> {
        if self.min.is_none() && self.max.is_none() {
            return Ok(());
        }
        // Non-numeric values carry no range
        let Ok(number) = value.parse::<f64>() else {
            return Ok(());
        };
        let min = self.min.unwrap_or(f64::NEG_INFINITY);
        let max = self.max.unwrap_or(f64::INFINITY);
        if number < min || number > max {
            return Err(DecodeError::ValueOutOfRange {
                field: self.name.clone(),
                value: number,
                min,
                max,
            });
        }
        Ok(())
    }
}

/// Rule matching sniffed frames of one header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SniffRule {
    /// Hex the frame data must start with (spaces ignored, may be empty)
    #[serde(default)]
    pub prefix: String,
    pub name: String,
    pub formula: FormulaProgram,
    #[serde(default)]
    pub bits: Option<BitRange>,
}

impl SniffRule {
    pub fn new(prefix: &str, name: &str, formula: FormulaProgram) -> Self {
        Self {
            prefix: prefix.to_string(),
            name: name.to_string(),
            formula,
            bits: None,
        }
    }

    pub fn with_bits(mut self, bits: BitRange) -> Self {
        self.bits = Some(bits);
        self
    }

    /// Whether the frame data starts with this rule's prefix
    pub fn matches(&self, frame: &RawFrame) -> bool {
        let prefix: String = self.prefix.split_whitespace().collect();
        let data: String = frame.data.split_whitespace().collect();
        data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(&prefix)
    }
}

/// A decoded value ready for publishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedValue {
    pub name: String,
    pub value: String,
    /// Header of the transmitter the value came from, if any
    pub transmitter: Option<String>,
}

/// Decoder bound to the protocol number the adapter reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    protocol: u8,
}

impl Decoder {
    pub fn new(protocol: u8) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Decode the adapter's reply to `def.request`; `None` if nothing usable.
    pub fn decode(&self, def: &DataPointDef, response: &str) -> Option<DecodedValue> {
        match self.try_decode(def, response) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(name = %def.name, error = %e, "Data point not decoded");
                None
            }
        }
    }

    pub fn try_decode(&self, def: &DataPointDef, response: &str) -> Result<DecodedValue, DecodeError> {
        match def.formula.special() {
            Some(SpecialDecoder::PassThrough) => {
                let value = strip_echo(&def.request, response);
                if value.is_empty() {
                    return Err(DecodeError::NoData);
                }
                return Ok(DecodedValue {
                    name: def.name.clone(),
                    value,
                    transmitter: None,
                });
            }
            Some(SpecialDecoder::Dtc) => {
                let reassembled = reassemble(&def.request, response, self.protocol);
                if reassembled.is_empty() {
                    return Err(DecodeError::NoData);
                }
                let codes: Vec<String> = reassembled
                    .iter()
                    .map(|(_, bytes)| def.formula.evaluate(bytes))
                    .filter(|codes| !codes.is_empty())
                    .collect();
                return Ok(DecodedValue {
                    name: def.name.clone(),
                    value: codes.join(","),
                    transmitter: None,
                });
            }
            _ => {}
        }

        let reassembled = reassemble(&def.request, response, self.protocol);
        let (header, bytes) = reassembled.first().ok_or(DecodeError::NoData)?;
        let value = evaluate(&def.formula, def.bits, bytes)?;
        def.check_range(&value)?;
        Ok(DecodedValue {
            name: def.name.clone(),
            value,
            transmitter: Some(header.to_string()),
        })
    }

    /// Decode one sniffed frame against a rule that matched its header.
    pub fn decode_frame(&self, rule: &SniffRule, frame: &RawFrame) -> Option<DecodedValue> {
        if !rule.matches(frame) {
            return None;
        }
        let bytes = frame.bytes().ok()?;
        match evaluate(&rule.formula, rule.bits, &bytes) {
            Ok(value) => Some(DecodedValue {
                name: rule.name.clone(),
                value,
                transmitter: Some(frame.header.clone()),
            }),
            Err(e) => {
                debug!(name = %rule.name, header = %frame.header, error = %e, "Sniffed frame not decoded");
                None
            }
        }
    }
}

fn evaluate(formula: &FormulaProgram, bits: Option<BitRange>, bytes: &[u8]) -> Result<String, DecodeError> {
    let value = match bits {
        Some(range) => formula.try_evaluate(&extract_bits(bytes, range)?)?,
        None => formula.try_evaluate(bytes)?,
    };
    if value.is_empty() {
        return Err(DecodeError::NoData);
    }
    Ok(value)
}

/// Reply text with the echoed request line removed, segments joined by spaces
fn strip_echo(request: &str, response: &str) -> String {
    let echo: String = request.split_whitespace().collect();
    response
        .split('|')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.split_whitespace().collect::<String>().eq_ignore_ascii_case(&echo))
        .collect::<Vec<_>>()
        .join(" ")
}
