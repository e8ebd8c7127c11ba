//! Formula language
//!
//! A formula is either one of the named special decoders or a
//! comma-separated chain of single-operator steps such as `A*256,X+B,X/4`.
//! Data bytes bind to `A`, `B`, `C`, ... in order; `X` is the accumulator,
//! seeded with the big-endian value of all target bytes, and every step
//! stores its result back into it. Division rounds to 4 fractional digits.

use crate::bits::bytes_to_f64;
use crate::dtc::decode_dtcs;
use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

const DIVISION_SCALE: f64 = 10_000.0;

/// Decoders that bypass the arithmetic language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialDecoder {
    /// Bytes as VIN characters
    Vin,
    /// Two-byte trouble codes
    Dtc,
    /// Each byte as 8 zero-padded binary digits
    Binary,
    /// Bytes as printable ASCII
    Ascii,
    /// Bytes as uppercase hex
    Hex,
    /// `1` if any bit is set, else `0`
    Bit,
    /// Raw adapter reply text (AT commands)
    PassThrough,
}

impl SpecialDecoder {
    fn from_name(name: &str) -> Option<Self> {
        let decoder = match name.to_ascii_uppercase().as_str() {
            "VIN" => SpecialDecoder::Vin,
            "DTC" => SpecialDecoder::Dtc,
            "BINARY" => SpecialDecoder::Binary,
            "ASCII" => SpecialDecoder::Ascii,
            "HEX" => SpecialDecoder::Hex,
            "BIT" => SpecialDecoder::Bit,
            "AT" => SpecialDecoder::PassThrough,
            _ => return None,
        };
        Some(decoder)
    }

    fn name(&self) -> &'static str {
        match self {
            SpecialDecoder::Vin => "VIN",
            SpecialDecoder::Dtc => "DTC",
            SpecialDecoder::Binary => "BINARY",
            SpecialDecoder::Ascii => "ASCII",
            SpecialDecoder::Hex => "HEX",
            SpecialDecoder::Bit => "BIT",
            SpecialDecoder::PassThrough => "AT",
        }
    }

    fn apply(&self, bytes: &[u8]) -> String {
        match self {
            SpecialDecoder::Vin => bytes
                .iter()
                .filter(|b| b.is_ascii_alphanumeric())
                .map(|&b| b as char)
                .collect(),
            SpecialDecoder::Dtc => decode_dtcs(bytes)
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            SpecialDecoder::Binary => bytes.iter().map(|b| format!("{b:08b}")).collect(),
            SpecialDecoder::Ascii | SpecialDecoder::PassThrough => bytes
                .iter()
                .filter(|b| (0x20..=0x7E).contains(*b))
                .map(|&b| b as char)
                .collect(),
            SpecialDecoder::Hex => bytes.iter().map(|b| format!("{b:02X}")).collect(),
            SpecialDecoder::Bit => {
                if bytes.iter().any(|&b| b != 0) {
                    "1".to_string()
                } else {
                    "0".to_string()
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
}

impl Operator {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Operator::Add),
            '-' => Some(Operator::Sub),
            '*' => Some(Operator::Mul),
            '/' => Some(Operator::Div),
            _ => None,
        }
    }

    fn symbol(&self) -> char {
        match self {
            Operator::Add => '+',
            Operator::Sub => '-',
            Operator::Mul => '*',
            Operator::Div => '/',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// `X`
    Accumulator,
    /// `A`..`Z` except `X`, bound to the byte at the letter's alphabet index
    Byte(char),
    Literal(f64),
}

impl Operand {
    fn parse(token: &str, step: &str) -> Result<Self, DecodeError> {
        let invalid = |reason| DecodeError::InvalidFormula {
            step: step.to_string(),
            reason,
        };
        let mut chars = token.chars();
        match (chars.next(), chars.next()) {
            (None, _) => Err(invalid("missing operand")),
            (Some('X'), None) => Ok(Operand::Accumulator),
            (Some(c), None) if c.is_ascii_uppercase() => Ok(Operand::Byte(c)),
            _ => token
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Operand::Literal)
                .ok_or_else(|| invalid("operand is neither a variable nor a number")),
        }
    }

    fn resolve(&self, accumulator: f64, bytes: &[u8]) -> Result<f64, DecodeError> {
        match *self {
            Operand::Accumulator => Ok(accumulator),
            Operand::Literal(v) => Ok(v),
            Operand::Byte(letter) => {
                // Deserialized operands skip the parser's letter check
                if !letter.is_ascii_uppercase() {
                    return Err(DecodeError::UnresolvedVariable(letter));
                }
                let index = usize::from(letter as u8 - b'A');
                bytes
                    .get(index)
                    .map(|&b| f64::from(b))
                    .ok_or(DecodeError::UnresolvedVariable(letter))
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Accumulator => write!(f, "X"),
            Operand::Byte(c) => write!(f, "{c}"),
            Operand::Literal(v) => write!(f, "{v}"),
        }
    }
}

/// One `left op right` step; the result becomes the new accumulator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub left: Operand,
    pub op: Operator,
    pub right: Operand,
}

impl Step {
    fn parse(text: &str) -> Result<Self, DecodeError> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let Some(split) = find_operator(&compact) else {
            // A bare operand just loads the accumulator
            return Ok(Step {
                left: Operand::parse(&compact, text)?,
                op: Operator::Add,
                right: Operand::Literal(0.0),
            });
        };
        let (left, rest) = compact.split_at(split);
        let mut rest_chars = rest.chars();
        let op = rest_chars
            .next()
            .and_then(Operator::from_char)
            .ok_or_else(|| DecodeError::InvalidFormula {
                step: text.to_string(),
                reason: "missing operator",
            })?;
        let right = rest_chars.as_str();
        if find_operator(right).is_some() {
            return Err(DecodeError::InvalidFormula {
                step: text.to_string(),
                reason: "more than one operator",
            });
        }
        Ok(Step {
            left: Operand::parse(left, text)?,
            op,
            right: Operand::parse(right, text)?,
        })
    }

    fn apply(&self, accumulator: f64, bytes: &[u8]) -> Result<f64, DecodeError> {
        let left = self.left.resolve(accumulator, bytes)?;
        let right = self.right.resolve(accumulator, bytes)?;
        let value = match self.op {
            Operator::Add => left + right,
            Operator::Sub => left - right,
            Operator::Mul => left * right,
            Operator::Div => {
                if right == 0.0 {
                    return Err(DecodeError::DivisionByZero);
                }
                (left / right * DIVISION_SCALE).round() / DIVISION_SCALE
            }
        };
        Ok(value)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.left, self.op.symbol(), self.right)
    }
}

/// Byte index of the binary operator in a step. A sign directly at the
/// start, or right after another operator, belongs to a number.
fn find_operator(step: &str) -> Option<usize> {
    let mut previous: Option<char> = None;
    for (i, c) in step.char_indices() {
        let is_sign_position = previous.map_or(true, |p| Operator::from_char(p).is_some());
        if Operator::from_char(c).is_some() && !is_sign_position {
            return Some(i);
        }
        previous = Some(c);
    }
    None
}

/// A parsed, immutable formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FormulaProgram {
    Special(SpecialDecoder),
    Arithmetic(Vec<Step>),
}

impl FormulaProgram {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let text = text.trim();
        if let Some(decoder) = SpecialDecoder::from_name(text) {
            return Ok(FormulaProgram::Special(decoder));
        }
        let steps = text
            .split(',')
            .map(Step::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FormulaProgram::Arithmetic(steps))
    }

    pub fn special(&self) -> Option<SpecialDecoder> {
        match self {
            FormulaProgram::Special(decoder) => Some(*decoder),
            FormulaProgram::Arithmetic(_) => None,
        }
    }

    /// Numeric result of an arithmetic program
    pub fn evaluate_number(&self, bytes: &[u8]) -> Result<f64, DecodeError> {
        let FormulaProgram::Arithmetic(steps) = self else {
            return Err(DecodeError::InvalidFormula {
                step: self.to_string(),
                reason: "special decoders have no numeric value",
            });
        };
        steps
            .iter()
            .try_fold(bytes_to_f64(bytes), |acc, step| step.apply(acc, bytes))
    }

    /// Evaluate against the target bytes; any failure is an empty string.
    pub fn evaluate(&self, bytes: &[u8]) -> String {
        match self.try_evaluate(bytes) {
            Ok(value) => value,
            Err(e) => {
                trace!(formula = %self, error = %e, "Formula evaluation failed");
                String::new()
            }
        }
    }

    pub fn try_evaluate(&self, bytes: &[u8]) -> Result<String, DecodeError> {
        match self {
            FormulaProgram::Special(decoder) => Ok(decoder.apply(bytes)),
            FormulaProgram::Arithmetic(_) => self.evaluate_number(bytes).map(format_number),
        }
    }
}

impl fmt::Display for FormulaProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaProgram::Special(decoder) => write!(f, "{}", decoder.name()),
            FormulaProgram::Arithmetic(steps) => {
                let text: Vec<String> = steps.iter().map(ToString::to_string).collect();
                write!(f, "{}", text.join(","))
            }
        }
    }
}

impl FromStr for FormulaProgram {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FormulaProgram {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FormulaProgram> for String {
    fn from(program: FormulaProgram) -> Self {
        program.to_string()
    }
}

/// Integers without a fraction, everything else with up to 4 digits
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }
    let text = format!("{value:.4}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
