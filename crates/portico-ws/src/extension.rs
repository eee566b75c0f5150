//! Negotiated payload transforms.
//!
//! An [`Extension`] is registered on a server upgrade or a client request.
//! During the handshake each one is asked whether it accepts an offered
//! `Sec-WebSocket-Extensions` token; the ones that do produce an
//! [`ExtensionCodec`] owned by the connection for its whole lifetime, plus
//! the reserved header bit that marks transformed frames.
//!
//! A reserved bit may be owned by at most one extension per connection.
//! Negotiating two extensions that claim the same bit fails the handshake.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{WsError, WsResult};
use crate::frame::{OpCode, ReservedBit};

/// Whether an extension transforms whole messages or individual frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtensionScope {
    /// Runs once per message, before fragmentation and after reassembly.
    /// Only the first frame carries the reserved bit.
    #[default]
    Message,
    /// Runs on every data frame independently.
    Frame,
}

/// One parsed entry of a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    raw: String,
    name: String,
    params: Vec<(String, Option<String>)>,
}

impl ExtensionOffer {
    /// Parses a single token such as `permessage-deflate; client_max_window_bits`.
    pub fn parse(token: &str) -> Option<Self> {
        let raw = token.trim();
        let mut parts = raw.split(';').map(str::trim);
        let name = parts.next().filter(|n| !n.is_empty())?.to_string();

        let params = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((key, value)) => (
                    key.trim().to_string(),
                    Some(value.trim().trim_matches('"').to_string()),
                ),
                None => (p.to_string(), None),
            })
            .collect();

        Some(Self {
            raw: raw.to_string(),
            name,
            params,
        })
    }

    /// Parses a comma separated header value.
    pub fn parse_list(header: &str) -> Vec<Self> {
        header.split(',').filter_map(Self::parse).collect()
    }

    /// The token exactly as offered, trimmed.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The extension name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All parameters in offer order.
    pub fn params(&self) -> &[(String, Option<String>)] {
        &self.params
    }

    /// Looks up a parameter. The outer option is presence, the inner one
    /// the value.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }
}

/// Per-connection transform state created by a successful negotiation.
///
/// Dropping the codec releases any per-connection context it holds.
pub trait ExtensionCodec: Send {
    /// Transforms an outgoing payload.
    fn encode(&mut self, opcode: OpCode, payload: Bytes) -> WsResult<Bytes>;

    /// Reverses the transform on an incoming payload.
    fn decode(&mut self, opcode: OpCode, payload: Bytes) -> WsResult<Bytes>;
}

/// Outcome of a server-side negotiation.
pub struct Negotiated {
    /// Token echoed back in the response `Sec-WebSocket-Extensions` header.
    pub response: String,
    /// Codec for the new connection.
    pub codec: Box<dyn ExtensionCodec>,
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

/// A registered extension.
pub trait Extension: Send + Sync {
    /// Extension name as used in the handshake.
    fn name(&self) -> &str;

    /// The reserved bit marking transformed frames.
    fn reserved_bit(&self) -> ReservedBit;

    /// Message or frame granularity.
    fn scope(&self) -> ExtensionScope {
        ExtensionScope::Message
    }

    /// Server side: decides whether to accept an offered token.
    fn negotiate(&self, offer: &ExtensionOffer) -> Option<Negotiated>;

    /// Client side: the token to offer in the upgrade request.
    fn offer(&self) -> String {
        self.name().to_string()
    }

    /// Client side: accepts the server's chosen parameters.
    fn accept(&self, response: &ExtensionOffer) -> Option<Box<dyn ExtensionCodec>>;
}

/// A transform function used by [`ExtensionBinding`].
pub type Transform = Arc<dyn Fn(OpCode, Bytes) -> WsResult<Bytes> + Send + Sync>;

/// Negotiation predicate: returns the response token to accept an offer.
pub type Predicate = Arc<dyn Fn(&ExtensionOffer) -> Option<String> + Send + Sync>;

/// An extension built from plain functions.
///
/// Without a predicate the binding accepts any offer whose name equals its
/// own and answers with its name. Missing transforms are the identity.
///
/// ```rust
/// use portico_ws::{ExtensionBinding, ReservedBit};
///
/// let upper = ExtensionBinding::new("x-upper", ReservedBit::Rsv2)
///     .encoder(|_, payload| Ok(payload.to_ascii_uppercase().into()))
///     .decoder(|_, payload| Ok(payload.to_ascii_lowercase().into()));
/// ```
#[derive(Clone)]
pub struct ExtensionBinding {
    name: String,
    bit: ReservedBit,
    scope: ExtensionScope,
    encode: Option<Transform>,
    decode: Option<Transform>,
    predicate: Option<Predicate>,
}

impl ExtensionBinding {
    /// Creates a binding owning `bit`.
    pub fn new(name: impl Into<String>, bit: ReservedBit) -> Self {
        Self {
            name: name.into(),
            bit,
            scope: ExtensionScope::Message,
            encode: None,
            decode: None,
            predicate: None,
        }
    }

    /// Sets the scope.
    pub fn scope(mut self, scope: ExtensionScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the outbound transform.
    pub fn encoder<F>(mut self, f: F) -> Self
    where
        F: Fn(OpCode, Bytes) -> WsResult<Bytes> + Send + Sync + 'static,
    {
        self.encode = Some(Arc::new(f));
        self
    }

    /// Sets the inbound transform.
    pub fn decoder<F>(mut self, f: F) -> Self
    where
        F: Fn(OpCode, Bytes) -> WsResult<Bytes> + Send + Sync + 'static,
    {
        self.decode = Some(Arc::new(f));
        self
    }

    /// Sets the negotiation predicate.
    pub fn predicate<F>(mut self, f: F) -> Self
    where
        F: Fn(&ExtensionOffer) -> Option<String> + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(f));
        self
    }

    fn codec(&self) -> Box<dyn ExtensionCodec> {
        Box::new(BindingCodec {
            encode: self.encode.clone(),
            decode: self.decode.clone(),
        })
    }
}

impl fmt::Debug for ExtensionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionBinding")
            .field("name", &self.name)
            .field("bit", &self.bit)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Extension for ExtensionBinding {
    fn name(&self) -> &str {
        &self.name
    }

    fn reserved_bit(&self) -> ReservedBit {
        self.bit
    }

    fn scope(&self) -> ExtensionScope {
        self.scope
    }

    fn negotiate(&self, offer: &ExtensionOffer) -> Option<Negotiated> {
        let response = match &self.predicate {
            Some(predicate) => predicate(offer)?,
            None if offer.name() == self.name => self.name.clone(),
            None => return None,
        };
        Some(Negotiated {
            response,
            codec: self.codec(),
        })
    }

    fn accept(&self, response: &ExtensionOffer) -> Option<Box<dyn ExtensionCodec>> {
        (response.name() == self.name).then(|| self.codec())
    }
}

struct BindingCodec {
    encode: Option<Transform>,
    decode: Option<Transform>,
}

impl ExtensionCodec for BindingCodec {
    fn encode(&mut self, opcode: OpCode, payload: Bytes) -> WsResult<Bytes> {
        match &self.encode {
            Some(f) => f(opcode, payload),
            None => Ok(payload),
        }
    }

    fn decode(&mut self, opcode: OpCode, payload: Bytes) -> WsResult<Bytes> {
        match &self.decode {
            Some(f) => f(opcode, payload),
            None => Ok(payload),
        }
    }
}

/// A negotiated extension bound to one connection.
pub struct ActiveExtension {
    name: String,
    bit: ReservedBit,
    scope: ExtensionScope,
    codec: Box<dyn ExtensionCodec>,
}

impl fmt::Debug for ActiveExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveExtension")
            .field("name", &self.name)
            .field("bit", &self.bit)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// The ordered set of extensions active on a connection.
#[derive(Debug, Default)]
pub struct ExtensionSet {
    active: Vec<ActiveExtension>,
}

impl ExtensionSet {
    /// An empty set: payloads pass through untouched.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        &mut self,
        ext: &dyn Extension,
        codec: Box<dyn ExtensionCodec>,
        on_conflict: impl FnOnce(String) -> WsError,
    ) -> WsResult<()> {
        let bit = ext.reserved_bit();
        if let Some(owner) = self.active.iter().find(|a| a.bit == bit) {
            return Err(on_conflict(format!(
                "extensions {} and {} both claim {:?}",
                owner.name,
                ext.name(),
                bit
            )));
        }
        self.active.push(ActiveExtension {
            name: ext.name().to_string(),
            bit,
            scope: ext.scope(),
            codec,
        });
        Ok(())
    }

    /// Number of active extensions.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Returns true if no extension is active.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Names of the active extensions in negotiation order.
    pub fn names(&self) -> Vec<String> {
        self.active.iter().map(|a| a.name.clone()).collect()
    }

    /// Reserved bits the peer may set on the first frame of a message.
    pub fn first_frame_bits(&self) -> u8 {
        self.active.iter().fold(0, |acc, a| acc | a.bit.mask())
    }

    /// Reserved bits the peer may set on continuation frames.
    pub fn continuation_bits(&self) -> u8 {
        self.active
            .iter()
            .filter(|a| a.scope == ExtensionScope::Frame)
            .fold(0, |acc, a| acc | a.bit.mask())
    }

    fn encode_scope(
        &mut self,
        scope: ExtensionScope,
        opcode: OpCode,
        mut payload: Bytes,
    ) -> WsResult<(Bytes, u8)> {
        let mut rsv = 0;
        for ext in self.active.iter_mut().filter(|a| a.scope == scope) {
            payload = ext.codec.encode(opcode, payload)?;
            rsv |= ext.bit.mask();
        }
        Ok((payload, rsv))
    }

    fn decode_scope(
        &mut self,
        scope: ExtensionScope,
        opcode: OpCode,
        rsv: u8,
        mut payload: Bytes,
    ) -> WsResult<Bytes> {
        for ext in self
            .active
            .iter_mut()
            .rev()
            .filter(|a| a.scope == scope && rsv & a.bit.mask() != 0)
        {
            payload = ext.codec.decode(opcode, payload)?;
        }
        Ok(payload)
    }

    /// Applies message-scoped encoders. Returns the payload and the bits to
    /// set on the first frame.
    pub fn encode_message(&mut self, opcode: OpCode, payload: Bytes) -> WsResult<(Bytes, u8)> {
        self.encode_scope(ExtensionScope::Message, opcode, payload)
    }

    /// Applies frame-scoped encoders to one frame payload.
    pub fn encode_frame(&mut self, opcode: OpCode, payload: Bytes) -> WsResult<(Bytes, u8)> {
        self.encode_scope(ExtensionScope::Frame, opcode, payload)
    }

    /// Applies frame-scoped decoders whose bit is set in `rsv`.
    pub fn decode_frame(&mut self, opcode: OpCode, rsv: u8, payload: Bytes) -> WsResult<Bytes> {
        self.decode_scope(ExtensionScope::Frame, opcode, rsv, payload)
    }

    /// Applies message-scoped decoders whose bit was set on the first frame.
    pub fn decode_message(&mut self, opcode: OpCode, rsv: u8, payload: Bytes) -> WsResult<Bytes> {
        self.decode_scope(ExtensionScope::Message, opcode, rsv, payload)
    }
}

/// Server-side negotiation.
///
/// Offers are visited in order; each is shown to every registered extension
/// not yet enabled until one accepts it. Returns the active set and the
/// comma-joined response header value, if any extension was enabled.
pub fn negotiate_server(
    offers: &[ExtensionOffer],
    registered: &[Arc<dyn Extension>],
) -> WsResult<(ExtensionSet, Option<String>)> {
    let mut set = ExtensionSet::new();
    let mut enabled = vec![false; registered.len()];
    let mut responses = Vec::new();

    for offer in offers {
        for (index, ext) in registered.iter().enumerate() {
            if enabled[index] {
                continue;
            }
            if let Some(negotiated) = ext.negotiate(offer) {
                set.push(ext.as_ref(), negotiated.codec, WsError::NegotiationFailed)?;
                enabled[index] = true;
                responses.push(negotiated.response);
                tracing::debug!(extension = ext.name(), "extension enabled");
                break;
            }
        }
    }

    let header = (!responses.is_empty()).then(|| responses.join(", "));
    Ok((set, header))
}

/// Client-side negotiation: every extension the server answered with must
/// be one we offered.
pub fn negotiate_client(
    response: Option<&str>,
    offered: &[Arc<dyn Extension>],
) -> WsResult<ExtensionSet> {
    let mut set = ExtensionSet::new();
    let Some(header) = response else {
        return Ok(set);
    };

    let mut enabled = vec![false; offered.len()];
    for chosen in ExtensionOffer::parse_list(header) {
        let accepted = offered.iter().enumerate().find_map(|(index, ext)| {
            if enabled[index] {
                return None;
            }
            ext.accept(&chosen).map(|codec| (index, codec))
        });

        match accepted {
            Some((index, codec)) => {
                set.push(offered[index].as_ref(), codec, WsError::HandshakeFailed)?;
                enabled[index] = true;
            }
            None => {
                return Err(WsError::handshake_failed(format!(
                    "server enabled unrequested extension {}",
                    chosen.name()
                )));
            }
        }
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(binding: ExtensionBinding) -> Arc<dyn Extension> {
        Arc::new(binding)
    }

    #[test]
    fn test_parse_offer() {
        let offer =
            ExtensionOffer::parse(" permessage-deflate; client_max_window_bits; server_max_window_bits=\"10\" ")
                .unwrap();
        assert_eq!(offer.name(), "permessage-deflate");
        assert_eq!(offer.param("client_max_window_bits"), Some(None));
        assert_eq!(offer.param("server_max_window_bits"), Some(Some("10")));
        assert_eq!(offer.param("missing"), None);
        assert!(offer.raw().starts_with("permessage-deflate;"));
    }

    #[test]
    fn test_parse_list() {
        let offers = ExtensionOffer::parse_list("a, b; x=1, , c");
        let names: Vec<_> = offers.iter().map(ExtensionOffer::name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_predicate_selects_extensions() {
        let registered = vec![
            shared(ExtensionBinding::new("a", ReservedBit::Rsv2).predicate(|_| Some("a".into()))),
            shared(ExtensionBinding::new("b", ReservedBit::Rsv3).predicate(|_| None)),
        ];
        let offers = ExtensionOffer::parse_list("a, b");

        let (set, header) = negotiate_server(&offers, &registered).unwrap();
        assert_eq!(set.names(), vec!["a"]);
        assert_eq!(header.as_deref(), Some("a"));
    }

    #[test]
    fn test_each_extension_enabled_once() {
        let registered = vec![shared(ExtensionBinding::new("a", ReservedBit::Rsv1))];
        let offers = ExtensionOffer::parse_list("a, a");
        let (set, header) = negotiate_server(&offers, &registered).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(header.as_deref(), Some("a"));
    }

    #[test]
    fn test_response_joined_in_match_order() {
        let registered = vec![
            shared(ExtensionBinding::new("a", ReservedBit::Rsv1)),
            shared(ExtensionBinding::new("b", ReservedBit::Rsv2)),
        ];
        let offers = ExtensionOffer::parse_list("b, a");
        let (set, header) = negotiate_server(&offers, &registered).unwrap();
        assert_eq!(set.names(), vec!["b", "a"]);
        assert_eq!(header.as_deref(), Some("b, a"));
    }

    #[test]
    fn test_overlapping_bits_rejected() {
        let registered = vec![
            shared(ExtensionBinding::new("a", ReservedBit::Rsv1)),
            shared(ExtensionBinding::new("b", ReservedBit::Rsv1)),
        ];
        let offers = ExtensionOffer::parse_list("a, b");
        let err = negotiate_server(&offers, &registered).unwrap_err();
        assert!(matches!(err, WsError::NegotiationFailed(_)));
        assert!(err.is_bad_request());
    }

    #[test]
    fn test_empty_offer_is_identity() {
        let registered = vec![shared(
            ExtensionBinding::new("a", ReservedBit::Rsv1).encoder(|_, _| Ok(Bytes::new())),
        )];
        let (mut set, header) = negotiate_server(&[], &registered).unwrap();
        assert!(set.is_empty());
        assert!(header.is_none());

        let (payload, rsv) = set
            .encode_message(OpCode::Text, Bytes::from_static(b"same"))
            .unwrap();
        assert_eq!(&payload[..], b"same");
        assert_eq!(rsv, 0);
    }

    #[test]
    fn test_transforms_and_bits() {
        let registered = vec![
            shared(
                ExtensionBinding::new("m", ReservedBit::Rsv1)
                    .encoder(|_, p| Ok(p.iter().rev().copied().collect::<Vec<_>>().into()))
                    .decoder(|_, p| Ok(p.iter().rev().copied().collect::<Vec<_>>().into())),
            ),
            shared(
                ExtensionBinding::new("f", ReservedBit::Rsv3)
                    .scope(ExtensionScope::Frame)
                    .encoder(|_, p| Ok(p.to_ascii_uppercase().into()))
                    .decoder(|_, p| Ok(p.to_ascii_lowercase().into())),
            ),
        ];
        let (mut set, _) =
            negotiate_server(&ExtensionOffer::parse_list("m, f"), &registered).unwrap();
        assert_eq!(set.first_frame_bits(), 0x50);
        assert_eq!(set.continuation_bits(), 0x10);

        let (msg, msg_bits) = set
            .encode_message(OpCode::Text, Bytes::from_static(b"abc"))
            .unwrap();
        assert_eq!(&msg[..], b"cba");
        assert_eq!(msg_bits, 0x40);

        let (frame, frame_bits) = set.encode_frame(OpCode::Text, msg).unwrap();
        assert_eq!(&frame[..], b"CBA");
        assert_eq!(frame_bits, 0x10);

        let decoded = set.decode_frame(OpCode::Text, 0x50, frame).unwrap();
        let decoded = set.decode_message(OpCode::Text, 0x50, decoded).unwrap();
        assert_eq!(&decoded[..], b"abc");

        // Without the bit the payload is left alone.
        let untouched = set
            .decode_message(OpCode::Text, 0, Bytes::from_static(b"xyz"))
            .unwrap();
        assert_eq!(&untouched[..], b"xyz");
    }

    #[test]
    fn test_client_rejects_unrequested_extension() {
        let offered = vec![shared(ExtensionBinding::new("a", ReservedBit::Rsv1))];
        assert!(negotiate_client(None, &offered).unwrap().is_empty());
        assert_eq!(negotiate_client(Some("a"), &offered).unwrap().len(), 1);
        assert!(matches!(
            negotiate_client(Some("zzz"), &offered),
            Err(WsError::HandshakeFailed(_))
        ));
    }
}
