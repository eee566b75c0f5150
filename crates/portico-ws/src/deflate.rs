//! The `permessage-deflate` extension (RFC 7692).
//!
//! Messages are compressed with raw DEFLATE using a sync flush, and the
//! trailing `00 00 ff ff` marker is stripped before sending (and restored
//! before inflating). Windows are always 15 bits, so offers that ask the
//! server to use a smaller window are declined.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{WsError, WsResult};
use crate::extension::{Extension, ExtensionCodec, ExtensionOffer, Negotiated};
use crate::frame::{OpCode, ReservedBit, Role};

/// Extension token.
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const MAX_WINDOW_BITS: u8 = 15;

/// Configuration and factory for `permessage-deflate`.
#[derive(Debug, Clone)]
pub struct PerMessageDeflate {
    role: Role,
    level: u32,
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    max_decompressed_size: usize,
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self::server()
    }
}

impl PerMessageDeflate {
    /// Creates the extension for use on accepted connections.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            level: 6,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            max_decompressed_size: 64 * 1024 * 1024,
        }
    }

    /// Creates the extension for use by the client.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            ..Self::server()
        }
    }

    /// Sets the compression level (0-9).
    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    /// Requires the server to reset its compressor after every message.
    pub fn server_no_context_takeover(mut self, enabled: bool) -> Self {
        self.server_no_context_takeover = enabled;
        self
    }

    /// Requires the client to reset its compressor after every message.
    pub fn client_no_context_takeover(mut self, enabled: bool) -> Self {
        self.client_no_context_takeover = enabled;
        self
    }

    /// Caps the size of an inflated message.
    pub fn max_decompressed_size(mut self, size: usize) -> Self {
        self.max_decompressed_size = size;
        self
    }

    fn codec(&self, server_reset: bool, client_reset: bool) -> Box<dyn ExtensionCodec> {
        let (compress_reset, decompress_reset) = match self.role {
            Role::Server => (server_reset, client_reset),
            Role::Client => (client_reset, server_reset),
        };
        Box::new(DeflateCodec::new(
            Compression::new(self.level),
            compress_reset,
            decompress_reset,
            self.max_decompressed_size,
        ))
    }
}

/// Negotiated parameters of one offer or response.
#[derive(Debug, Default, PartialEq, Eq)]
struct DeflateParams {
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
}

/// Validates the parameters of an offer or response.
///
/// Returns `None` for anything this implementation cannot honour.
fn parse_params(offer: &ExtensionOffer, is_response: bool) -> Option<DeflateParams> {
    if offer.name() != PERMESSAGE_DEFLATE {
        return None;
    }

    let mut params = DeflateParams::default();
    for (name, value) in offer.params() {
        match name.as_str() {
            "server_no_context_takeover" if value.is_none() => {
                params.server_no_context_takeover = true;
            }
            "client_no_context_takeover" if value.is_none() => {
                params.client_no_context_takeover = true;
            }
            "server_max_window_bits" => {
                let bits: u8 = value.as_deref()?.parse().ok()?;
                if bits != MAX_WINDOW_BITS {
                    return None;
                }
            }
            "client_max_window_bits" => match value.as_deref() {
                // The client only advertises support; we keep 15 bits.
                None if !is_response => {}
                Some(v) => {
                    let bits: u8 = v.parse().ok()?;
                    if !(8..=MAX_WINDOW_BITS).contains(&bits) {
                        return None;
                    }
                    if is_response && bits != MAX_WINDOW_BITS {
                        return None;
                    }
                }
                None => return None,
            },
            _ => return None,
        }
    }
    Some(params)
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn reserved_bit(&self) -> ReservedBit {
        ReservedBit::Rsv1
    }

    fn negotiate(&self, offer: &ExtensionOffer) -> Option<Negotiated> {
        let requested = parse_params(offer, false)?;
        let server_reset = requested.server_no_context_takeover || self.server_no_context_takeover;
        let client_reset = requested.client_no_context_takeover || self.client_no_context_takeover;

        let mut response = String::from(PERMESSAGE_DEFLATE);
        if server_reset {
            response.push_str("; server_no_context_takeover");
        }
        if client_reset {
            response.push_str("; client_no_context_takeover");
        }

        Some(Negotiated {
            response,
            codec: self.codec(server_reset, client_reset),
        })
    }

    fn offer(&self) -> String {
        let mut offer = String::from(PERMESSAGE_DEFLATE);
        if self.server_no_context_takeover {
            offer.push_str("; server_no_context_takeover");
        }
        if self.client_no_context_takeover {
            offer.push_str("; client_no_context_takeover");
        }
        offer
    }

    fn accept(&self, response: &ExtensionOffer) -> Option<Box<dyn ExtensionCodec>> {
        let chosen = parse_params(response, true)?;
        if self.server_no_context_takeover && !chosen.server_no_context_takeover {
            return None;
        }
        Some(self.codec(
            chosen.server_no_context_takeover,
            chosen.client_no_context_takeover || self.client_no_context_takeover,
        ))
    }
}

/// Per-connection compression state.
pub struct DeflateCodec {
    compressor: Compress,
    decompressor: Decompress,
    reset_compressor: bool,
    reset_decompressor: bool,
    max_size: usize,
}

impl DeflateCodec {
    /// Creates a codec. The reset flags select no-context-takeover for our
    /// compressor and the peer's compressor respectively.
    pub fn new(level: Compression, reset_compressor: bool, reset_decompressor: bool, max_size: usize) -> Self {
        Self {
            compressor: Compress::new(level, false),
            decompressor: Decompress::new(false),
            reset_compressor,
            reset_decompressor,
            max_size,
        }
    }

    fn compress(&mut self, input: &[u8]) -> WsResult<Bytes> {
        let start = self.compressor.total_in();
        let mut out = Vec::with_capacity(input.len() / 2 + 64);

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(256));
            }
            let consumed = (self.compressor.total_in() - start) as usize;
            self.compressor
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| WsError::extension(PERMESSAGE_DEFLATE, e))?;
            let consumed = (self.compressor.total_in() - start) as usize;
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        if out.ends_with(&TRAILER) {
            out.truncate(out.len() - TRAILER.len());
        }
        if self.reset_compressor {
            self.compressor.reset();
        }
        Ok(out.into())
    }

    fn decompress(&mut self, payload: &[u8]) -> WsResult<Bytes> {
        let mut input = Vec::with_capacity(payload.len() + TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&TRAILER);

        let start = self.decompressor.total_in();
        let mut out = Vec::with_capacity((payload.len() * 3).max(256));

        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity());
            }
            let consumed = (self.decompressor.total_in() - start) as usize;
            let status = self
                .decompressor
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| WsError::extension(PERMESSAGE_DEFLATE, e))?;

            if out.len() > self.max_size {
                return Err(WsError::MessageTooBig {
                    size: out.len(),
                    limit: self.max_size,
                });
            }

            let consumed = (self.decompressor.total_in() - start) as usize;
            let done = consumed == input.len() && out.len() < out.capacity();
            if status == Status::StreamEnd || done {
                break;
            }
        }

        if self.reset_decompressor {
            self.decompressor.reset(false);
        }
        Ok(out.into())
    }
}

impl ExtensionCodec for DeflateCodec {
    fn encode(&mut self, _opcode: OpCode, payload: Bytes) -> WsResult<Bytes> {
        self.compress(&payload)
    }

    fn decode(&mut self, _opcode: OpCode, payload: Bytes) -> WsResult<Bytes> {
        self.decompress(&payload)
    }
}
