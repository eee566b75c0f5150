//! WebSocket frame encoding and decoding.
//!
//! Implements the RFC 6455 wire format: a two byte header carrying FIN,
//! the reserved bits and the opcode, an optional 16 or 64 bit extended
//! length, an optional masking key and the payload.
//!
//! Decoding works on a growing [`BytesMut`] and never consumes bytes until a
//! whole frame is available, so the read loop can be cancelled between
//! reads without losing data.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{WsError, WsResult};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const FIN_BIT: u8 = 0x80;
const RSV_MASK: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;

/// Which end of the connection we are. Decides the masking policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted connection: receives masked frames, sends unmasked ones.
    Server,
    /// Initiated connection: receives unmasked frames, masks what it sends.
    Client,
}

impl Role {
    /// Returns true if frames sent by this role must be masked.
    pub fn masks_outgoing(self) -> bool {
        self == Self::Client
    }
}

/// WebSocket opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Returns the wire value.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a control frame.
    pub fn is_control(self) -> bool {
        self.as_u8() >= 0x8
    }

    /// Check if this opcode starts a data message.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// One of the three reserved header bits an extension may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedBit {
    /// RSV1 (0x40), used by permessage-deflate
    Rsv1,
    /// RSV2 (0x20)
    Rsv2,
    /// RSV3 (0x10)
    Rsv3,
}

impl ReservedBit {
    /// The bit's mask within the first header byte.
    pub fn mask(self) -> u8 {
        match self {
            Self::Rsv1 => 0x40,
            Self::Rsv2 => 0x20,
            Self::Rsv3 => 0x10,
        }
    }
}

/// A single WebSocket frame. The payload is always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Reserved bits, as they appear in the first header byte
    pub rsv: u8,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key, if the frame is (to be) masked
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final, unmasked frame.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Sets the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets a masking key.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Sets reserved bits (only the RSV1-3 bits are kept).
    pub fn with_rsv(mut self, rsv: u8) -> Self {
        self.rsv = rsv & RSV_MASK;
        self
    }

    /// Returns true if the given reserved bit is set.
    pub fn has_rsv(&self, bit: ReservedBit) -> bool {
        self.rsv & bit.mask() != 0
    }

    /// Size of the header for a payload of `len` bytes.
    fn header_len(len: usize, masked: bool) -> usize {
        let extended = match len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        };
        2 + extended + if masked { 4 } else { 0 }
    }

    /// Total encoded size of the frame.
    pub fn encoded_len(&self) -> usize {
        Self::header_len(self.payload.len(), self.mask.is_some()) + self.payload.len()
    }

    /// Appends the wire encoding of the frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());

        let mut b0 = self.opcode.as_u8() | self.rsv;
        if self.fin {
            b0 |= FIN_BIT;
        }
        dst.put_u8(b0);

        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };
        let len = self.payload.len();
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if let Ok(short) = u16::try_from(len) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(short);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match self.mask {
            Some(mask) => {
                dst.put_slice(&mask);
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask(&mut dst[start..], mask);
            }
            None => dst.put_slice(&self.payload),
        }
    }
}

/// XORs `buf` with the masking key, in place. Applying it twice is the
/// identity.
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Generates a fresh random masking key.
pub fn generate_mask() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

/// Splits a payload into the data frames of one message.
///
/// A `fragment_size` of 0, or a payload no larger than it, yields a single
/// frame. Otherwise the payload is cut into `ceil(len / fragment_size)`
/// frames: the first carries `opcode`, the rest are continuations, and
/// only the last has FIN set.
pub fn fragment(opcode: OpCode, payload: &Bytes, fragment_size: usize) -> Vec<Frame> {
    if fragment_size == 0 || payload.len() <= fragment_size {
        return vec![Frame::new(opcode, payload.clone())];
    }

    let count = payload.len().div_ceil(fragment_size);
    (0..count)
        .map(|i| {
            let start = i * fragment_size;
            let end = (start + fragment_size).min(payload.len());
            let opcode = if i == 0 { opcode } else { OpCode::Continuation };
            Frame::new(opcode, payload.slice(start..end)).with_fin(i + 1 == count)
        })
        .collect()
}

/// Incremental frame decoder enforcing the masking policy of a role.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a decoder for frames received by `role`.
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
        }
    }

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `src` is left
    /// untouched in that case.
    pub fn decode(&self, src: &mut BytesMut) -> WsResult<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];

        let fin = b0 & FIN_BIT != 0;
        let rsv = b0 & RSV_MASK;
        let opcode = OpCode::from_u8(b0 & OPCODE_MASK).ok_or_else(|| {
            WsError::protocol_error(format!("unknown opcode {:#x}", b0 & OPCODE_MASK))
        })?;

        let masked = b1 & MASK_BIT != 0;
        match (self.role, masked) {
            (Role::Server, false) => {
                return Err(WsError::protocol_error("client frame is not masked"));
            }
            (Role::Client, true) => {
                return Err(WsError::protocol_error("server frame is masked"));
            }
            _ => {}
        }

        let (declared, mut offset) = match b1 & LEN_MASK {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0_u8; 8];
                raw.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(WsError::protocol_error("payload length has the high bit set"));
                }
                (len, 10)
            }
            short => (u64::from(short), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(WsError::protocol_error("fragmented control frame"));
            }
            if declared > MAX_CONTROL_PAYLOAD as u64 {
                return Err(WsError::protocol_error("control frame payload over 125 bytes"));
            }
        }

        let len = usize::try_from(declared).unwrap_or(usize::MAX);
        if len > self.max_frame_size {
            return Err(WsError::MessageTooBig {
                size: len,
                limit: self.max_frame_size,
            });
        }

        let mask = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < offset + len {
            src.reserve(offset + len - src.len());
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            rsv,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(OpCode::from_u8(0x2), Some(OpCode::Binary));
        assert_eq!(OpCode::from_u8(0x3), None);
        assert!(OpCode::Ping.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Binary.is_data());
        assert!(!OpCode::Continuation.is_data());
    }

    #[test]
    fn test_round_trip_length_classes() {
        let server = FrameCodec::new(Role::Server, usize::MAX);
        let client = FrameCodec::new(Role::Client, usize::MAX);

        for len in [0_usize, 1, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            // Client to server: masked on the wire.
            let frame = Frame::new(OpCode::Binary, payload.clone()).with_mask([1, 2, 3, 4]);
            let mut buf = encode(&frame);
            assert_eq!(buf.len(), frame.encoded_len());
            let decoded = server.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.opcode, OpCode::Binary);
            assert_eq!(&decoded.payload[..], &payload[..]);
            assert!(buf.is_empty());

            // Server to client: unmasked.
            let frame = Frame::new(OpCode::Text, payload.clone());
            let mut buf = encode(&frame);
            let decoded = client.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.opcode, OpCode::Text);
            assert_eq!(&decoded.payload[..], &payload[..]);
        }
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(&Frame::new(OpCode::Text, vec![0_u8; 126]));
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 126);
        assert_eq!(&buf[2..4], &[0, 126]);

        let buf = encode(&Frame::new(OpCode::Binary, vec![0_u8; 65536]).with_fin(false));
        assert_eq!(buf[0], 0x02);
        assert_eq!(buf[1], 127);
        assert_eq!(&buf[2..10], &65536_u64.to_be_bytes());
    }

    #[test]
    fn test_masked_payload_on_wire() {
        let buf = encode(&Frame::new(OpCode::Text, &b"Hello"[..]).with_mask([0x37, 0xfa, 0x21, 0x3d]));
        // Example from RFC 6455 section 5.7.
        assert_eq!(
            &buf[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_partial_input_needs_more() {
        let codec = FrameCodec::new(Role::Client, usize::MAX);
        let full = encode(&Frame::new(OpCode::Binary, vec![7_u8; 300]));

        for cut in [0, 1, 3, 100, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let codec = FrameCodec::new(Role::Client, usize::MAX);
        let mut buf = encode(&Frame::new(OpCode::Text, &b"a"[..]));
        buf.extend_from_slice(&encode(&Frame::new(OpCode::Ping, &b""[..])));

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opcode, OpCode::Text);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opcode, OpCode::Ping);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_mask_policy() {
        let unmasked = encode(&Frame::new(OpCode::Text, &b"x"[..]));
        let err = FrameCodec::new(Role::Server, 1024)
            .decode(&mut unmasked.clone())
            .unwrap_err();
        assert!(matches!(err, WsError::ProtocolError(_)));

        let masked = encode(&Frame::new(OpCode::Text, &b"x"[..]).with_mask(generate_mask()));
        assert!(FrameCodec::new(Role::Client, 1024)
            .decode(&mut masked.clone())
            .is_err());
    }

    #[test]
    fn test_control_frame_limits() {
        let codec = FrameCodec::new(Role::Client, usize::MAX);
        let mut long_ping = encode(&Frame::new(OpCode::Ping, vec![0_u8; 126]));
        assert!(codec.decode(&mut long_ping).is_err());

        let mut fragmented_close = encode(&Frame::new(OpCode::Close, &b""[..]).with_fin(false));
        assert!(codec.decode(&mut fragmented_close).is_err());
    }

    #[test]
    fn test_frame_size_limit() {
        let codec = FrameCodec::new(Role::Client, 10);
        let mut buf = encode(&Frame::new(OpCode::Binary, vec![0_u8; 11]));
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WsError::MessageTooBig { size: 11, limit: 10 })
        ));
    }

    #[test]
    fn test_unknown_opcode() {
        let codec = FrameCodec::new(Role::Client, 1024);
        let mut buf = BytesMut::from(&[0x83_u8, 0x00][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_rsv_bits_survive() {
        let codec = FrameCodec::new(Role::Client, 1024);
        let mut buf = encode(&Frame::new(OpCode::Text, &b"z"[..]).with_rsv(0x40));
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.has_rsv(ReservedBit::Rsv1));
        assert!(!frame.has_rsv(ReservedBit::Rsv2));
    }

    #[test]
    fn test_fragment_layout() {
        let payload = Bytes::from(vec![1_u8; 10]);
        let frames = fragment(OpCode::Text, &payload, 4);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert_eq!(frames[1].opcode, OpCode::Continuation);
        assert_eq!(frames[2].opcode, OpCode::Continuation);
        assert_eq!(
            frames.iter().map(|f| f.fin).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(frames[2].payload.len(), 2);

        assert_eq!(fragment(OpCode::Binary, &Bytes::new(), 4).len(), 1);
        assert_eq!(fragment(OpCode::Binary, &payload, 0).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_fragment_reassembles(len in 1_usize..2048, size in 1_usize..512) {
            let payload: Bytes = (0..len).map(|i| (i % 256) as u8).collect::<Vec<_>>().into();
            let frames = fragment(OpCode::Binary, &payload, size);

            prop_assert_eq!(frames.len(), len.div_ceil(size).max(1));
            prop_assert_eq!(frames.iter().filter(|f| f.fin).count(), 1);
            prop_assert!(frames.last().unwrap().fin);

            let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.iter().copied()).collect();
            prop_assert_eq!(&joined[..], &payload[..]);
        }

        #[test]
        fn prop_mask_is_involution(data in prop::collection::vec(any::<u8>(), 0..256), key in any::<[u8; 4]>()) {
            let mut buf = data.clone();
            apply_mask(&mut buf, key);
            apply_mask(&mut buf, key);
            prop_assert_eq!(buf, data);
        }
    }
}
