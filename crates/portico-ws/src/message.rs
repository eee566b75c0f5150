//! WebSocket message records.
//!
//! A [`Message`] is what the connection archives and hands to callbacks:
//! the reassembly of one or more frames, stamped with the time its final
//! frame completed.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::{CloseCode, WsError, WsResult};
use crate::frame::OpCode;

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// When the message was completed (received) or queued (sent).
    pub timestamp: DateTime<Utc>,
    /// Opcode of the first frame.
    pub opcode: OpCode,
    /// Whether the first frame was masked.
    pub masked: bool,
    /// Masking key of the first frame.
    pub mask: Option<[u8; 4]>,
    /// Reassembled payload, after extension decoding.
    pub payload: Bytes,
}

impl Message {
    /// Creates an unmasked message stamped with the current time.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp: Utc::now(),
            opcode,
            masked: false,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Records the masking key of the first frame.
    pub fn with_mask(mut self, mask: Option<[u8; 4]>) -> Self {
        self.masked = mask.is_some();
        self.mask = mask;
        self
    }

    /// Check if this is a text message.
    pub fn is_text(&self) -> bool {
        self.opcode == OpCode::Text
    }

    /// Check if this is a binary message.
    pub fn is_binary(&self) -> bool {
        self.opcode == OpCode::Binary
    }

    /// Check if this is a close message.
    pub fn is_close(&self) -> bool {
        self.opcode == OpCode::Close
    }

    /// Returns the payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Parses the payload of a close message.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        if self.is_close() {
            CloseFrame::parse(&self.payload).ok().flatten()
        } else {
            None
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Status code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code.
    pub code: u16,
    /// Human readable reason.
    pub reason: String,
}

impl CloseFrame {
    /// Creates a close frame.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: reason.into(),
        }
    }

    /// Returns the well-known close code, if this is one.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_u16(self.code)
    }

    /// Encodes the close payload: a big-endian code followed by the reason.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.reason.len());
        buf.put_u16(self.code);
        buf.put_slice(self.reason.as_bytes());
        buf.freeze()
    }

    /// Parses a close payload. An empty payload carries no status.
    pub fn parse(payload: &[u8]) -> WsResult<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(WsError::protocol_error("close payload of one byte")),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseCode::is_sendable(code) {
                    return Err(WsError::protocol_error(format!("invalid close code {code}")));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WsError::protocol_error("close reason is not UTF-8"))?;
                Ok(Some(Self {
                    code,
                    reason: reason.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text() {
        let msg = Message::new(OpCode::Text, "hello");
        assert!(msg.is_text());
        assert_eq!(msg.as_text(), Some("hello"));
        assert_eq!(msg.len(), 5);
        assert!(!msg.masked);
    }

    #[test]
    fn test_message_mask_flag() {
        let msg = Message::new(OpCode::Binary, vec![1, 2]).with_mask(Some([9, 9, 9, 9]));
        assert!(msg.masked);
        assert_eq!(msg.mask, Some([9, 9, 9, 9]));
    }

    #[test]
    fn test_message_json() {
        #[derive(serde::Deserialize)]
        struct Ping {
            seq: u32,
        }
        let msg = Message::new(OpCode::Text, r#"{"seq":4}"#);
        assert_eq!(msg.json::<Ping>().unwrap().seq, 4);
    }

    #[test]
    fn test_close_frame_encode_parse() {
        let frame = CloseFrame::new(CloseCode::GoingAway, "bye");
        let encoded = frame.encode();
        assert_eq!(&encoded[..2], &[0x03, 0xE9]);
        assert_eq!(CloseFrame::parse(&encoded).unwrap(), Some(frame));
    }

    #[test]
    fn test_close_frame_parse_edge_cases() {
        assert_eq!(CloseFrame::parse(&[]).unwrap(), None);
        assert!(CloseFrame::parse(&[0x03]).is_err());
        assert!(CloseFrame::parse(&[0x03, 0xED]).is_err()); // 1005
        assert!(CloseFrame::parse(&[0x03, 0xE8, 0xFF]).is_err());
    }

    #[test]
    fn test_message_close_frame() {
        let payload = CloseFrame::new(CloseCode::Normal, "").encode();
        let msg = Message::new(OpCode::Close, payload);
        assert_eq!(msg.close_frame().unwrap().close_code(), Some(CloseCode::Normal));
        assert!(Message::new(OpCode::Text, "x").close_frame().is_none());
    }
}
