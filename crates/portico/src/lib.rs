//! # Portico
//!
//! **Embeddable HTTP and WebSocket server framework**
//!
//! Portico maps requests onto a registry of endpoints and runs every
//! matching handler as a chain:
//!
//! - **Multi-match routing** – `prefix` + `format` patterns with `:name`
//!   parameters and `*` wildcards, ordered by priority
//! - **Handler chains** – each handler returns a [`Signal`](prelude::Signal)
//!   deciding whether the chain continues, completes or fails
//! - **WebSockets** – RFC 6455 handshake, frame codec, fragmentation,
//!   extensions (permessage-deflate included) and a client
//! - **Graceful shutdown** – open HTTP connections drain and every live
//!   WebSocket receives a close frame
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portico::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConfigLoader::new()
//!         .with_optional_file("portico.toml")?
//!         .with_env_prefix("PORTICO")
//!         .load()?;
//!     init_logging(&config.logging)?;
//!
//!     let server = Server::from_config(&config);
//!     let hello = |req: &Request, res: &mut Response, _: Option<&UserData>| {
//!         res.set_string_body(format!("hello {}", req.param("name").unwrap_or("world")));
//!         Signal::Complete
//!     };
//!     server
//!         .endpoints()
//!         .add(Route::new("GET", Arc::new(hello) as Arc<dyn Handler>).format("/hello/:name"))?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

// Re-export core types
pub use portico_core as core;

// Re-export server types
pub use portico_server as server;

// Re-export router types
pub use portico_router as router;

// Re-export WebSocket types
pub use portico_ws as ws;

// Re-export configuration types
pub use portico_config as config;

// Re-export logging setup
pub use portico_telemetry as telemetry;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use portico::prelude::*;
///
/// let server = Server::builder().default_realm("admin").build();
/// assert_eq!(server.config().default_realm(), Some("admin"));
/// ```
pub mod prelude {
    pub use portico_core::{
        handler_fn, Auth, BasicAuth, Body, Cookies, CoreError, Handler, HandlerFuture, Request,
        Response, SameSite, SetCookie, Signal, UserData,
    };

    pub use portico_router::{EndpointRegistry, Params, Route};

    pub use portico_server::{
        Endpoints, Server, ServerBuilder, ServerConfig, ServerError, ServerResult, ShutdownSignal,
    };

    // Re-export WebSocket types
    pub use portico_ws::{
        connect, Callbacks, ClientRequest, CloseCode, CloseFrame, ConnectionId,
        ConnectionRegistry, ConnectionStatus, Message, OpCode, PerMessageDeflate,
        RegistryConfig, WebSocketConfig, WebSocketHandle, WebSocketUpgrade, WsError, WsResult,
    };

    pub use portico_config::{ConfigError, ConfigLoader, PorticoConfig};

    pub use portico_telemetry::{init_logging, LogConfig, LogFormat};
}
