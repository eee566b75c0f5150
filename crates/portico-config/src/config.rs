//! Root configuration type.
//!
//! This module provides [`PorticoConfig`] and its builder.

use std::net::SocketAddr;

use portico_telemetry::{create_env_filter, LogConfig};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ServerSection, WebSocketSection};

/// Complete Portico configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to load it from files and the
/// environment.
///
/// # Example
///
/// ```
/// use portico_config::PorticoConfig;
///
/// let config = PorticoConfig::default();
/// assert_eq!(config.server.http_addr, "0.0.0.0:8080");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct PorticoConfig {
    /// Listener and dispatch settings.
    #[serde(default)]
    pub server: ServerSection,

    /// WebSocket connection settings.
    #[serde(default)]
    pub websocket: WebSocketSection,

    /// Logging settings.
    #[serde(default)]
    pub logging: LogConfig,
}

impl PorticoConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> PorticoConfigBuilder {
        PorticoConfigBuilder::new()
    }

    /// Checks addresses, limits and the log filter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.http_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid(
                "server.http_addr",
                format!("invalid socket address: {}", self.server.http_addr),
            ));
        }

        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::invalid(
                "server.max_body_bytes",
                "must be greater than 0",
            ));
        }

        if self.server.request_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "server.request_timeout_ms",
                "must be greater than 0",
            ));
        }

        if let Some(realm) = &self.server.default_realm {
            // the realm is quoted in WWW-Authenticate
            if realm.contains('"') || realm.chars().any(char::is_control) {
                return Err(ConfigError::invalid(
                    "server.default_realm",
                    "must not contain quotes or control characters",
                ));
            }
        }

        let ws = &self.websocket;
        if ws.max_frame_size == 0 {
            return Err(ConfigError::invalid(
                "websocket.max_frame_size",
                "must be greater than 0",
            ));
        }
        if ws.max_message_size == 0 {
            return Err(ConfigError::invalid(
                "websocket.max_message_size",
                "must be greater than 0",
            ));
        }
        if ws.close_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "websocket.close_timeout_ms",
                "must be greater than 0",
            ));
        }

        if self.logging.enabled {
            create_env_filter(&self.logging.level)
                .map_err(|e| ConfigError::invalid("logging.level", e.to_string()))?;
        }

        Ok(())
    }

    /// Local development preset: loopback address, pretty debug logs.
    #[must_use]
    pub fn development() -> Self {
        Self {
            server: ServerSection {
                http_addr: "127.0.0.1:8080".to_string(),
                shutdown_timeout_secs: 5,
                ..ServerSection::default()
            },
            websocket: WebSocketSection::default(),
            logging: LogConfig::development(),
        }
    }

    /// Production preset: JSON logs and a bounded connection count.
    #[must_use]
    pub fn production() -> Self {
        Self {
            server: ServerSection::default(),
            websocket: WebSocketSection {
                max_connections: 10_000,
                ..WebSocketSection::default()
            },
            logging: LogConfig::production(),
        }
    }

    /// Serializes to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Builder for [`PorticoConfig`].
#[derive(Debug, Default)]
pub struct PorticoConfigBuilder {
    server: Option<ServerSection>,
    websocket: Option<WebSocketSection>,
    logging: Option<LogConfig>,
}

impl PorticoConfigBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server section.
    #[must_use]
    pub fn server(mut self, server: ServerSection) -> Self {
        self.server = Some(server);
        self
    }

    /// Set the websocket section.
    #[must_use]
    pub fn websocket(mut self, websocket: WebSocketSection) -> Self {
        self.websocket = Some(websocket);
        self
    }

    /// Set the logging section.
    #[must_use]
    pub fn logging(mut self, logging: LogConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Build the configuration, filling unset sections with defaults.
    #[must_use]
    pub fn build(self) -> PorticoConfig {
        PorticoConfig {
            server: self.server.unwrap_or_default(),
            websocket: self.websocket.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
        }
    }
}
