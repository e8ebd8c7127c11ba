//! Incremental message reader

use crate::error::WireError;
use crate::message::Message;
use crate::{ESCAPE, TERMINATOR};
use tracing::trace;

const DEFAULT_LIMIT: usize = 64 * 1024;

/// Buffers bytes from a stream and yields each message once its
/// unescaped terminator has arrived
#[derive(Debug)]
pub struct MessageReader {
    buffer: Vec<u8>,
    limit: usize,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_LIMIT)
    }

    /// Reader that fails once `limit` bytes are buffered without a
    /// terminator
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete message, if any
    pub fn next_message(&mut self) -> Option<Result<Message, WireError>> {
        let Some(end) = self.terminator_position() else {
            if self.buffer.len() > self.limit {
                let size = self.buffer.len();
                self.buffer.clear();
                return Some(Err(WireError::Overflow(size)));
            }
            return None;
        };

        let frame: Vec<u8> = self.buffer.drain(..=end).collect();
        let parsed = match std::str::from_utf8(&frame) {
            Ok(text) if text.trim_end_matches(TERMINATOR).trim().is_empty() => {
                // Stray terminator between messages
                return self.next_message();
            }
            Ok(text) => Message::parse(text),
            Err(_) => Err(WireError::InvalidUtf8),
        };
        trace!(?parsed, "Wire message");
        Some(parsed)
    }

    fn terminator_position(&self) -> Option<usize> {
        let mut escaped = false;
        for (i, &byte) in self.buffer.iter().enumerate() {
            if escaped {
                escaped = false;
            } else if byte == ESCAPE as u8 {
                escaped = true;
            } else if byte == TERMINATOR as u8 {
                return Some(i);
            }
        }
        None
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for MessageReader {
    type Item = Result<Message, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_split_across_pushes() {
        let mut reader = MessageReader::new();
        reader.push(b"PI");
        assert!(reader.next_message().is_none());
        reader.push(b"NG|>DPN_ARRIVED|note|a\\>b|>GET|");
        assert_eq!(reader.next_message(), Some(Ok(Message::Ping)));
        assert_eq!(
            reader.next_message(),
            Some(Ok(Message::dpn("note", "a>b")))
        );
        assert!(reader.next_message().is_none());
        assert_eq!(reader.pending(), 4);
    }

    #[test]
    fn test_stray_terminators_are_skipped() {
        let mut reader = MessageReader::new();
        reader.push(b">\r\n>NACK|>");
        assert_eq!(reader.collect::<Vec<_>>(), vec![Ok(Message::Nack)]);
    }

    #[test]
    fn test_overflow_resets_buffer() {
        let mut reader = MessageReader::with_limit(8);
        reader.push(b"DPN_ARRIVED|rpm");
        assert_eq!(reader.next_message(), Some(Err(WireError::Overflow(15))));
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = MessageReader::new();
        reader.push(&[0xFF, b'|', b'>']);
        assert_eq!(reader.next_message(), Some(Err(WireError::InvalidUtf8)));
    }
}
