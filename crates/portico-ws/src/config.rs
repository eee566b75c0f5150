//! WebSocket configuration.
//!
//! This module defines configuration options for WebSocket connections
//! and the active-connection registry.

use std::time::Duration;

/// Configuration for a WebSocket connection.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum reassembled message size in bytes (default: 64 MB).
    pub max_message_size: usize,
    /// Maximum single frame payload in bytes (default: 16 MB).
    pub max_frame_size: usize,
    /// Fragment size used by `send_message`; 0 sends every message as a
    /// single frame (default: 0).
    pub fragment_size: usize,
    /// How long to wait for the peer to answer a local close (default: 5 seconds).
    pub close_timeout: Duration,
    /// Archive received messages in the incoming queue (default: true).
    pub keep_incoming: bool,
    /// Archive sent messages in the outgoing queue (default: true).
    pub keep_outgoing: bool,
    /// Capacity of the per-connection command channel (default: 64).
    pub command_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024, // 64 MB
            max_frame_size: 16 * 1024 * 1024,   // 16 MB
            fragment_size: 0,
            close_timeout: Duration::from_secs(5),
            keep_incoming: true,
            keep_outgoing: true,
            command_capacity: 64,
        }
    }
}

impl WebSocketConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the default fragment size.
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Set the close handshake timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set whether received messages are archived.
    pub fn keep_incoming(mut self, keep: bool) -> Self {
        self.keep_incoming = keep;
        self
    }

    /// Set whether sent messages are archived.
    pub fn keep_outgoing(mut self, keep: bool) -> Self {
        self.keep_outgoing = keep;
        self
    }

    /// Set the command channel capacity.
    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }
}

/// Configuration for the active-connection registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum live connections; 0 means unlimited (default: 10000).
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
        }
    }
}

impl RegistryConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of live connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}
