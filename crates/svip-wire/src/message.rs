//! Message encoding and parsing

use crate::error::WireError;
use crate::{ESCAPE, FIELD_SEPARATOR, TERMINATOR};
use std::fmt;

const ACK: &str = "ACK";
const NACK: &str = "NACK";
const DPN_ARRIVED: &str = "DPN_ARRIVED";
const OOB_ARRIVED: &str = "OOB_ARRIVED";
const PING: &str = "PING";
const PONG: &str = "PONG";

/// Escape separator, terminator and escape characters in a field value
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if c == FIELD_SEPARATOR || c == TERMINATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

/// Reverse [`escape`]
pub fn unescape(field: &str) -> Result<String, WireError> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            out.push(chars.next().ok_or(WireError::DanglingEscape)?);
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Split on separators that are not escaped; fields stay escaped
pub(crate) fn split_fields(body: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
        } else if c == ESCAPE {
            escaped = true;
        } else if c == FIELD_SEPARATOR {
            fields.push(&body[start..i]);
            start = i + c.len_utf8();
        }
    }
    if start < body.len() {
        fields.push(&body[start..]);
    }
    fields
}

/// One SVIP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Positive command response with optional payload fields
    Ack(Vec<String>),
    /// Negative command response
    Nack,
    /// Decoded data point
    DpnArrived { name: String, value: String },
    /// Out-of-band event
    OobArrived { name: String, value: String },
    /// Liveness check
    Ping,
    /// Any other command from a consumer
    Request { verb: String, args: Vec<String> },
}

impl Message {
    pub fn ack(fields: &[&str]) -> Self {
        Message::Ack(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn dpn(name: &str, value: &str) -> Self {
        Message::DpnArrived {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    pub fn oob(name: &str, value: &str) -> Self {
        Message::OobArrived {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// `ACK|PONG|>` for a ping, nothing otherwise
    pub fn reply_to_ping(&self) -> Option<Message> {
        match self {
            Message::Ping => Some(Message::ack(&[PONG])),
            _ => None,
        }
    }

    fn fields(&self) -> Vec<&str> {
        match self {
            Message::Ack(payload) => {
                let mut fields = vec![ACK];
                fields.extend(payload.iter().map(String::as_str));
                fields
            }
            Message::Nack => vec![NACK],
            Message::DpnArrived { name, value } => vec![DPN_ARRIVED, name, value],
            Message::OobArrived { name, value } => vec![OOB_ARRIVED, name, value],
            Message::Ping => vec![PING],
            Message::Request { verb, args } => {
                let mut fields = vec![verb.as_str()];
                fields.extend(args.iter().map(String::as_str));
                fields
            }
        }
    }

    /// Wire form, terminator included
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for field in self.fields() {
            out.push_str(&escape(field));
            out.push(FIELD_SEPARATOR);
        }
        out.push(TERMINATOR);
        out
    }

    /// Parse one message body (with or without its terminator)
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let body = strip_terminator(text.trim_start());
        let fields = split_fields(body)
            .into_iter()
            .map(unescape)
            .collect::<Result<Vec<_>, _>>()?;
        let Some((verb, args)) = fields.split_first() else {
            return Err(WireError::Empty);
        };

        let message = match verb.as_str() {
            ACK => Message::Ack(args.to_vec()),
            NACK => Message::Nack,
            PING => Message::Ping,
            DPN_ARRIVED | OOB_ARRIVED => {
                let [name, value, ..] = args else {
                    return Err(WireError::MissingField {
                        kind: if verb == DPN_ARRIVED { DPN_ARRIVED } else { OOB_ARRIVED },
                        expected: 2,
                        actual: args.len(),
                    });
                };
                if verb == DPN_ARRIVED {
                    Message::DpnArrived {
                        name: name.clone(),
                        value: value.clone(),
                    }
                } else {
                    Message::OobArrived {
                        name: name.clone(),
                        value: value.clone(),
                    }
                }
            }
            "" => return Err(WireError::Empty),
            _ => Message::Request {
                verb: verb.clone(),
                args: args.to_vec(),
            },
        };
        Ok(message)
    }
}

/// Drop an unescaped trailing terminator
fn strip_terminator(text: &str) -> &str {
    let Some(body) = text.strip_suffix(TERMINATOR) else {
        return text;
    };
    let escapes = body.chars().rev().take_while(|c| *c == ESCAPE).count();
    if escapes % 2 == 0 {
        body
    } else {
        text
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
