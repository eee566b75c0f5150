//! Upgrade descriptors and connection callbacks.
//!
//! A handler that wants a WebSocket builds a [`WebSocketUpgrade`] listing
//! the sub-protocols and extensions it supports plus the callbacks that
//! will drive the connection. The listener validates the request against
//! it, answers 101 and hands the upgraded transport to [`WebSocketUpgrade::start`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::BytesMut;
use http::{HeaderMap, Method, Version};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::WebSocketConfig;
use crate::connection::{spawn_connection, ConnectionParts, WebSocketHandle};
use crate::error::WsResult;
use crate::extension::Extension;
use crate::frame::Role;
use crate::handshake::{self, Accepted};
use crate::message::Message;
use crate::registry::ConnectionSlot;

pub use portico_router::UserData;

/// A boxed future, as returned by connection callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs alongside the connection for its whole life.
pub type ManagerCallback =
    Arc<dyn Fn(WebSocketHandle, Option<UserData>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives each complete incoming message, in arrival order.
pub type MessageCallback =
    Arc<dyn Fn(WebSocketHandle, Message, Option<UserData>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs once after the connection has closed.
pub type CloseCallback =
    Arc<dyn Fn(WebSocketHandle, Option<UserData>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The three optional callbacks of a connection and their user data.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub(crate) manager: Option<(ManagerCallback, Option<UserData>)>,
    pub(crate) incoming: Option<(MessageCallback, Option<UserData>)>,
    pub(crate) on_close: Option<(CloseCallback, Option<UserData>)>,
}

impl Callbacks {
    /// Creates an empty set of callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the manager callback.
    ///
    /// The connection waits for the manager to return before it runs the
    /// close callback, so a manager should return once sends start failing
    /// or [`WebSocketHandle::wait_closed`] resolves.
    pub fn on_manage<F, Fut>(mut self, f: F, user_data: Option<UserData>) -> Self
    where
        F: Fn(WebSocketHandle, Option<UserData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: ManagerCallback = Arc::new(
            move |ws: WebSocketHandle, data: Option<UserData>| -> BoxFuture<'static, ()> {
                Box::pin(f(ws, data))
            },
        );
        self.manager = Some((callback, user_data));
        self
    }

    /// Sets the incoming message callback.
    pub fn on_message<F, Fut>(mut self, f: F, user_data: Option<UserData>) -> Self
    where
        F: Fn(WebSocketHandle, Message, Option<UserData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: MessageCallback = Arc::new(
            move |ws: WebSocketHandle, msg: Message, data: Option<UserData>| -> BoxFuture<'static, ()> {
                Box::pin(f(ws, msg, data))
            },
        );
        self.incoming = Some((callback, user_data));
        self
    }

    /// Sets the close callback.
    pub fn on_close<F, Fut>(mut self, f: F, user_data: Option<UserData>) -> Self
    where
        F: Fn(WebSocketHandle, Option<UserData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: CloseCallback = Arc::new(
            move |ws: WebSocketHandle, data: Option<UserData>| -> BoxFuture<'static, ()> {
                Box::pin(f(ws, data))
            },
        );
        self.on_close = Some((callback, user_data));
        self
    }

    /// Returns true if an incoming message callback is set.
    pub fn has_incoming(&self) -> bool {
        self.incoming.is_some()
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("manager", &self.manager.is_some())
            .field("incoming", &self.incoming.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

/// What a handler asks for when it upgrades a request.
///
/// # Example
///
/// ```rust
/// use portico_ws::{PerMessageDeflate, WebSocketUpgrade};
///
/// let upgrade = WebSocketUpgrade::new()
///     .protocol("chat")
///     .extension(PerMessageDeflate::server())
///     .on_message(
///         |ws, msg, _| async move {
///             let _ = ws.send_message(msg.opcode, msg.payload).await;
///         },
///         None,
///     );
/// assert_eq!(upgrade.protocols(), ["chat".to_string()]);
/// ```
#[derive(Clone, Default)]
pub struct WebSocketUpgrade {
    protocols: Vec<String>,
    extensions: Vec<Arc<dyn Extension>>,
    callbacks: Callbacks,
    config: Option<WebSocketConfig>,
}

impl WebSocketUpgrade {
    /// Creates an upgrade with no protocols, extensions or callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a supported sub-protocol. Order is the server's preference.
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Adds a supported extension.
    pub fn extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Adds a shared extension.
    pub fn extension_arc(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Replaces all callbacks.
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Sets the manager callback.
    pub fn on_manage<F, Fut>(mut self, f: F, user_data: Option<UserData>) -> Self
    where
        F: Fn(WebSocketHandle, Option<UserData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks = self.callbacks.on_manage(f, user_data);
        self
    }

    /// Sets the incoming message callback.
    pub fn on_message<F, Fut>(mut self, f: F, user_data: Option<UserData>) -> Self
    where
        F: Fn(WebSocketHandle, Message, Option<UserData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks = self.callbacks.on_message(f, user_data);
        self
    }

    /// Sets the close callback.
    pub fn on_close<F, Fut>(mut self, f: F, user_data: Option<UserData>) -> Self
    where
        F: Fn(WebSocketHandle, Option<UserData>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.callbacks = self.callbacks.on_close(f, user_data);
        self
    }

    /// Sets the connection configuration.
    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `config` unless a configuration was already set.
    pub fn config_or(mut self, config: &WebSocketConfig) -> Self {
        if self.config.is_none() {
            self.config = Some(config.clone());
        }
        self
    }

    /// Supported sub-protocols.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Returns the connection configuration, if one was set.
    pub fn websocket_config(&self) -> Option<&WebSocketConfig> {
        self.config.as_ref()
    }

    /// Validates a request against this upgrade and negotiates.
    pub fn accept(&self, method: &Method, version: Version, headers: &HeaderMap) -> WsResult<Accepted> {
        handshake::accept(method, version, headers, &self.protocols, &self.extensions)
    }

    /// Starts a server-role connection on an upgraded transport.
    ///
    /// `slot` is the registry place taken before the 101 was sent.
    pub fn start<S>(self, stream: S, accepted: Accepted, slot: Option<ConnectionSlot>) -> WebSocketHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        spawn_connection(
            stream,
            ConnectionParts {
                role: Role::Server,
                protocol: accepted.protocol,
                extensions: accepted.extensions,
                callbacks: self.callbacks,
                config: self.config.unwrap_or_default(),
                slot,
                leftover: BytesMut::new(),
            },
        )
    }
}

impl fmt::Debug for WebSocketUpgrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketUpgrade")
            .field("protocols", &self.protocols)
            .field(
                "extensions",
                &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}
