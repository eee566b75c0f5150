//! WebSocket engine for Portico.
//!
//! This crate implements the server and client sides of RFC 6455 on top of
//! any `AsyncRead + AsyncWrite` transport: the opening handshake, the frame
//! codec, sub-protocol selection, pluggable extensions (including
//! `permessage-deflate`) and the connection actor that drives a live
//! socket.
//!
//! # Features
//!
//! - **Frame codec** with masking, fragmentation and size limits
//! - **Extensions** bound to a reserved bit, negotiated per connection
//! - **Callbacks** for a long-running manager, each incoming message and close
//! - **Message archives** of everything sent and received, drained on demand
//! - **Registry** of live connections with a limit and graceful shutdown
//! - **Client** connections over TCP or a caller supplied stream
//!
//! # Example
//!
//! ```ignore
//! use portico_ws::{ConnectionRegistry, RegistryConfig, WebSocketUpgrade};
//!
//! let registry = ConnectionRegistry::new(RegistryConfig::default());
//! let upgrade = WebSocketUpgrade::new()
//!     .protocol("chat")
//!     .on_message(|ws, msg, _| async move {
//!         let _ = ws.send_message(msg.opcode, msg.payload).await;
//!     }, None);
//!
//! // In the listener, after validating the request:
//! let accepted = upgrade.accept(&method, version, &headers)?;
//! let slot = registry.reserve()?; // refuse with 503 on error
//! // ... answer 101 with accepted.response_headers(), then:
//! let ws = upgrade.start(upgraded_io, accepted, Some(slot));
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! upgrade request ──► accept() ──► reserve() ──► 101 ──► start() ──► Open
//!                                                      │
//!                     close()/peer close/error ──► Closing
//!                                                      │
//!                 transport ends or close timeout ──► Closed
//!                                                      │
//!               manager joined ──► on_close ──► registry deregister
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod deflate;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod upgrade;

// Re-exports for convenience
pub use client::{connect, connect_with_stream, ClientRequest, WsUrl};
pub use config::{RegistryConfig, WebSocketConfig};
pub use connection::{ConnectionId, ConnectionStatus, WebSocketHandle};
pub use deflate::{PerMessageDeflate, PERMESSAGE_DEFLATE};
pub use error::{CloseCode, WsError, WsResult};
pub use extension::{
    Extension, ExtensionBinding, ExtensionCodec, ExtensionOffer, ExtensionScope, Negotiated,
};
pub use frame::{Frame, OpCode, ReservedBit, Role};
pub use handshake::{compute_accept_key, Accepted};
pub use message::{CloseFrame, Message};
pub use registry::{ConnectionRegistry, ConnectionSlot, RegistryStats};
pub use upgrade::{BoxFuture, Callbacks, UserData, WebSocketUpgrade};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports() {
        let _config = WebSocketConfig::default();
        let _registry = ConnectionRegistry::new(RegistryConfig::default());
        let _msg = Message::new(OpCode::Text, "hello");
        let _close = CloseCode::Normal;
        let _upgrade = WebSocketUpgrade::new().extension(PerMessageDeflate::server());
    }
}
