//! Configuration section types.

use serde::{Deserialize, Serialize};

/// `[server]` section: listener and dispatch settings.
///
/// # Example
///
/// ```
/// use portico_config::ServerSection;
///
/// let server = ServerSection::default();
/// assert_eq!(server.http_addr, "0.0.0.0:8080");
/// assert_eq!(server.default_realm, None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// HTTP bind address.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// How long shutdown waits for connections to finish, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Limit on body collection plus handler chain, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Largest accepted request body; bigger bodies get 413.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Realm used in 401 challenges when the handler sets none.
    #[serde(default)]
    pub default_realm: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            default_realm: None,
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

/// `[websocket]` section: per-connection limits and the registry cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WebSocketSection {
    /// Largest single frame payload.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest reassembled message.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Fragment size for outgoing messages; 0 sends single frames.
    #[serde(default)]
    pub fragment_size: usize,

    /// How long a local close waits for the peer's answer.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Archive received messages.
    #[serde(default = "default_true")]
    pub keep_incoming: bool,

    /// Archive sent messages.
    #[serde(default = "default_true")]
    pub keep_outgoing: bool,

    /// Live connection cap; 0 is unlimited.
    #[serde(default)]
    pub max_connections: usize,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_message_size: default_max_message_size(),
            fragment_size: 0,
            close_timeout_ms: default_close_timeout(),
            keep_incoming: true,
            keep_outgoing: true,
            max_connections: 0,
        }
    }
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}

fn default_close_timeout() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_section_defaults() {
        let server = ServerSection::default();
        assert_eq!(server.shutdown_timeout_secs, 30);
        assert_eq!(server.request_timeout_ms, 30_000);
        assert_eq!(server.max_body_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn test_websocket_section_partial_toml() {
        let section: WebSocketSection = toml::from_str("fragment_size = 1024").unwrap();
        assert_eq!(section.fragment_size, 1024);
        assert!(section.keep_incoming);
        assert_eq!(section.max_connections, 0);
    }

    #[test]
    fn test_websocket_section_rejects_unknown() {
        let result: Result<WebSocketSection, _> = toml::from_str("max_frames = 1");
        assert!(result.is_err());
    }
}
