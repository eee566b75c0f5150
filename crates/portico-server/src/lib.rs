//! # Portico Server
//!
//! The dispatch chain runner and the hyper-based listener that feeds it.
//!
//! - [`Dispatcher`] matches a request against the endpoint registry, runs
//!   the handler chain and renders the outcome (404, 401, 500 or the
//!   handler's response).
//! - [`Server`] accepts HTTP/1.1 connections, applies body and time
//!   limits, and performs WebSocket upgrades.
//! - [`ShutdownSignal`] stops the server gracefully, draining HTTP
//!   connections and then every live WebSocket.
//!
//! ## Example
//!
//! ```rust,ignore
//! use portico_server::{Server, ShutdownSignal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico_server::ServerError> {
//!     let server = Server::builder().http_addr("0.0.0.0:8080").build();
//!     server.run().await
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/portico-server/0.1.0")]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod server;
pub mod shutdown;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use dispatcher::{Dispatcher, Endpoints, Rendered, RenderedBody};
pub use error::{ServerError, ServerResult};
pub use server::{HttpResponse, ResponseBody, Server, ServerBuilder};
pub use shutdown::{ConnectionToken, ConnectionTracker, ShutdownSignal};
