//! Typed configuration for Portico.
//!
//! - TOML and JSON files
//! - `PREFIX__SECTION__KEY` environment overrides
//! - Strict parsing (unknown fields are errors) and validation
//!
//! # Configuration file format
//!
//! ```toml
//! [server]
//! http_addr = "0.0.0.0:8080"
//! shutdown_timeout_secs = 30
//! request_timeout_ms = 30000
//! max_body_bytes = 2097152
//! default_realm = "portico"
//!
//! [websocket]
//! max_frame_size = 16777216
//! max_message_size = 67108864
//! fragment_size = 0
//! close_timeout_ms = 5000
//! keep_incoming = true
//! keep_outgoing = true
//! max_connections = 0
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

#![doc(html_root_url = "https://docs.rs/portico-config/0.1.0")]

mod config;
mod error;
mod loader;
mod schema;

pub use config::{PorticoConfig, PorticoConfigBuilder};
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use portico_telemetry::{LogConfig, LogFormat};
pub use schema::{ServerSection, WebSocketSection};
