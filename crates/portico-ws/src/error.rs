//! WebSocket errors and close codes.

use std::fmt;
use thiserror::Error;

/// Result alias used across the crate.
pub type WsResult<T> = Result<T, WsError>;

/// Failures from the handshake, the frame codec or a live connection.
#[derive(Debug, Error)]
pub enum WsError {
    /// Request is missing or has a malformed upgrade header.
    #[error("not a websocket upgrade: {reason}")]
    NotWebSocketRequest {
        /// Which check failed.
        reason: String,
    },

    /// Server side: no acceptable subprotocol, or extensions conflict.
    #[error("websocket negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Client side: the 101 response does not match what was sent.
    #[error("websocket handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server answered the upgrade with something other than 101.
    #[error("server refused upgrade with status {status}")]
    Rejected {
        /// HTTP status code received.
        status: u16,
    },

    /// URL is not `ws://host[:port]/path`.
    #[error("bad websocket url: {0}")]
    InvalidUrl(String),

    /// A caller passed an argument the protocol cannot carry.
    #[error("invalid argument: {0}")]
    InvalidParameter(String),

    /// The connection is closing or closed.
    #[error("connection closed ({reason})")]
    ConnectionClosed {
        /// Close code, when one was exchanged.
        code: Option<u16>,
        /// Why the connection went away.
        reason: String,
    },

    /// The peer broke RFC 6455 framing rules.
    #[error("websocket protocol violation: {0}")]
    ProtocolError(String),

    /// A frame or reassembled message is over the configured cap.
    #[error("{size} bytes is over the {limit} byte limit")]
    MessageTooBig {
        /// Observed size.
        size: usize,
        /// Configured cap.
        limit: usize,
    },

    /// An extension codec rejected a payload.
    #[error("extension {name}: {reason}")]
    Extension {
        /// Registered extension name.
        name: String,
        /// Codec error.
        reason: String,
    },

    /// The connection registry is full or shutting down.
    #[error("connection refused: {0}")]
    ConnectionLimitReached(String),

    /// `send_json` could not serialize its value.
    #[error("cannot encode message: {0}")]
    EncodeFailed(String),

    /// Transport failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WsError {
    pub(crate) fn not_websocket(reason: impl Into<String>) -> Self {
        Self::NotWebSocketRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn negotiation_failed(reason: impl Into<String>) -> Self {
        Self::NegotiationFailed(reason.into())
    }

    pub(crate) fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed(reason.into())
    }

    pub(crate) fn connection_closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter(reason.into())
    }

    /// Builds a framing violation error.
    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self::ProtocolError(reason.into())
    }

    /// Builds a codec failure for the extension `name`.
    pub fn extension(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Extension {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn connection_limit(reason: impl Into<String>) -> Self {
        Self::ConnectionLimitReached(reason.into())
    }

    /// True for upgrade failures the server answers with HTTP 400.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::NotWebSocketRequest { .. } | Self::NegotiationFailed(_)
        )
    }

    /// Code put in the close frame when this error ends a connection.
    pub fn to_close_code(&self) -> CloseCode {
        match self {
            Self::ProtocolError(_) => CloseCode::Protocol,
            Self::MessageTooBig { .. } => CloseCode::MessageTooBig,
            Self::Extension { .. } => CloseCode::InvalidPayload,
            Self::ConnectionLimitReached(_) => CloseCode::TryAgainLater,
            _ => CloseCode::InternalError,
        }
    }
}

/// Registered close status codes (RFC 6455 section 7.4).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    Protocol = 1002,
    Unsupported = 1003,
    /// Reserved; never sent on the wire.
    NoStatus = 1005,
    /// Reserved; never sent on the wire.
    Abnormal = 1006,
    InvalidPayload = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    ExtensionRequired = 1010,
    InternalError = 1011,
    ServiceRestart = 1012,
    TryAgainLater = 1013,
}

const CLOSE_CODES: [(CloseCode, &str); 13] = [
    (CloseCode::Normal, "normal"),
    (CloseCode::GoingAway, "going away"),
    (CloseCode::Protocol, "protocol error"),
    (CloseCode::Unsupported, "unsupported data"),
    (CloseCode::NoStatus, "no status"),
    (CloseCode::Abnormal, "abnormal closure"),
    (CloseCode::InvalidPayload, "invalid payload"),
    (CloseCode::PolicyViolation, "policy violation"),
    (CloseCode::MessageTooBig, "message too big"),
    (CloseCode::ExtensionRequired, "extension required"),
    (CloseCode::InternalError, "internal error"),
    (CloseCode::ServiceRestart, "service restart"),
    (CloseCode::TryAgainLater, "try again later"),
];

impl CloseCode {
    /// Looks up a registered code.
    pub fn from_u16(code: u16) -> Option<Self> {
        CLOSE_CODES
            .iter()
            .map(|(c, _)| *c)
            .find(|c| c.as_u16() == code)
    }

    /// Numeric value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether `code` may legally appear in a received close frame.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    fn label(self) -> &'static str {
        CLOSE_CODES
            .iter()
            .find(|(c, _)| *c == self)
            .map_or("unknown", |(_, label)| label)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.label())
    }
}
