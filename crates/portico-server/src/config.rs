//! Server configuration.
//!
//! # Example
//!
//! ```rust
//! use portico_server::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .http_addr("127.0.0.1:3000")
//!     .shutdown_timeout(Duration::from_secs(5))
//!     .default_realm("portico")
//!     .build();
//!
//! assert_eq!(config.http_addr(), "127.0.0.1:3000");
//! assert_eq!(config.default_realm(), Some("portico"));
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use portico_config::PorticoConfig;
use portico_ws::{RegistryConfig, WebSocketConfig};

/// Default HTTP bind address.
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default request body cap.
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    http_addr: String,
    shutdown_timeout: Duration,
    request_timeout: Duration,
    max_body_bytes: usize,
    default_realm: Option<String>,
    websocket: WebSocketConfig,
    registry: RegistryConfig,
}

impl ServerConfig {
    /// Creates a new server configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Returns the HTTP bind address.
    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    /// Parses the HTTP address.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.http_addr.parse()
    }

    /// How long shutdown waits for HTTP and WebSocket connections.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Limit on body collection plus handler chain.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Largest accepted request body.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Realm used in 401 challenges when the handler sets none.
    pub fn default_realm(&self) -> Option<&str> {
        self.default_realm.as_deref()
    }

    /// Defaults applied to upgraded connections that do not set their own.
    pub fn websocket(&self) -> &WebSocketConfig {
        &self.websocket
    }

    /// Active-connection registry settings.
    pub fn registry(&self) -> &RegistryConfig {
        &self.registry
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfigBuilder::default().build()
    }
}

impl From<&PorticoConfig> for ServerConfig {
    fn from(config: &PorticoConfig) -> Self {
        let server = &config.server;
        let ws = &config.websocket;

        let mut builder = ServerConfigBuilder::new()
            .http_addr(server.http_addr.clone())
            .shutdown_timeout(Duration::from_secs(server.shutdown_timeout_secs))
            .request_timeout(Duration::from_millis(server.request_timeout_ms))
            .max_body_bytes(server.max_body_bytes)
            .websocket(
                WebSocketConfig::new()
                    .max_frame_size(ws.max_frame_size)
                    .max_message_size(ws.max_message_size)
                    .fragment_size(ws.fragment_size)
                    .close_timeout(Duration::from_millis(ws.close_timeout_ms))
                    .keep_incoming(ws.keep_incoming)
                    .keep_outgoing(ws.keep_outgoing),
            )
            .registry(RegistryConfig::new().max_connections(ws.max_connections));

        if let Some(realm) = &server.default_realm {
            builder = builder.default_realm(realm.clone());
        }
        builder.build()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    http_addr: String,
    shutdown_timeout: Duration,
    request_timeout: Duration,
    max_body_bytes: usize,
    default_realm: Option<String>,
    websocket: WebSocketConfig,
    registry: RegistryConfig,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfigBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            default_realm: None,
            websocket: WebSocketConfig::default(),
            registry: RegistryConfig::default(),
        }
    }

    /// Sets the HTTP bind address.
    #[must_use]
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.http_addr = addr.into();
        self
    }

    /// Sets the graceful shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the request body cap.
    #[must_use]
    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Sets the fallback 401 realm.
    #[must_use]
    pub fn default_realm(mut self, realm: impl Into<String>) -> Self {
        self.default_realm = Some(realm.into());
        self
    }

    /// Sets the WebSocket connection defaults.
    #[must_use]
    pub fn websocket(mut self, config: WebSocketConfig) -> Self {
        self.websocket = config;
        self
    }

    /// Sets the active-connection registry settings.
    #[must_use]
    pub fn registry(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            http_addr: self.http_addr,
            shutdown_timeout: self.shutdown_timeout,
            request_timeout: self.request_timeout,
            max_body_bytes: self.max_body_bytes,
            default_realm: self.default_realm,
            websocket: self.websocket,
            registry: self.registry,
        }
    }
}
