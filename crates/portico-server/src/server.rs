//! HTTP listener.
//!
//! Accepts TCP connections, serves HTTP/1.1 with hyper and runs the
//! [`Dispatcher`] for every request. A rendered upgrade is answered with
//! `101 Switching Protocols` and the upgraded transport is handed to a
//! WebSocket connection actor registered in the server's
//! [`ConnectionRegistry`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use portico_core::{Request, Response, Signal, UserData};
//! use portico_router::Route;
//! use portico_server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico_server::ServerError> {
//!     let server = Server::builder().http_addr("127.0.0.1:8080").build();
//!     server.endpoints().add(
//!         Route::new("GET", Arc::new(|_: &Request, res: &mut Response, _: Option<&UserData>| {
//!             res.set_string_body("hello");
//!             Signal::Complete
//!         }))
//!         .format("/hello"),
//!     )?;
//!     server.run().await
//! }
//! ```

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use portico_config::PorticoConfig;
use portico_core::Request;
use portico_ws::{ConnectionRegistry, RegistryConfig, WebSocketConfig, WebSocketUpgrade};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ServerConfig, ServerConfigBuilder};
use crate::dispatcher::{Dispatcher, Endpoints, Rendered, RenderedBody};
use crate::error::{ServerError, ServerResult};
use crate::shutdown::{ConnectionTracker, ShutdownSignal};

/// HTTP response body produced by the server.
pub type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// HTTP response produced by the server.
pub type HttpResponse = http::Response<ResponseBody>;

/// The Portico HTTP server.
pub struct Server {
    config: ServerConfig,
    dispatcher: Dispatcher,
    registry: Arc<ConnectionRegistry>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("websockets", &self.registry.len())
            .finish()
    }
}

impl Server {
    /// Creates a server with an empty endpoint registry.
    pub fn new(config: ServerConfig) -> Self {
        ServerBuilder::new().config(config).build()
    }

    /// Creates a server from a loaded configuration file.
    pub fn from_config(config: &PorticoConfig) -> Self {
        Self::new(ServerConfig::from(config))
    }

    /// Creates a server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registered endpoints. Routes may be added while the server runs.
    pub fn endpoints(&self) -> &Arc<Endpoints> {
        self.dispatcher.endpoints()
    }

    /// The chain runner.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Live WebSocket connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Runs until SIGTERM or SIGINT.
    pub async fn run(self) -> ServerResult<()> {
        let shutdown = ShutdownSignal::with_os_signals();
        self.run_with_shutdown(shutdown).await
    }

    /// Binds the configured address and runs until `shutdown` triggers.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> ServerResult<()> {
        let addr = self
            .config
            .socket_addr()
            .map_err(|e| ServerError::InvalidAddress {
                addr: self.config.http_addr().to_string(),
                reason: e.to_string(),
            })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        self.serve(listener, shutdown).await
    }

    /// Serves connections from an already bound listener until `shutdown`
    /// triggers, then drains HTTP and WebSocket connections.
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownSignal) -> ServerResult<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "server listening");

        let server = Arc::new(self);
        let tracker = ConnectionTracker::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let server = Arc::clone(&server);
                            let token = tracker.acquire();
                            let shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, remote_addr, shutdown).await {
                                    tracing::debug!(remote = %remote_addr, error = %e, "connection error");
                                }
                                drop(token);
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                () = shutdown.recv() => {
                    tracing::info!("shutdown signal received, stopping server");
                    break;
                }
            }
        }
        drop(listener);

        let timeout = server.config.shutdown_timeout();
        tracing::info!(
            timeout = ?timeout,
            http = tracker.active_connections(),
            websockets = server.registry.len(),
            "draining connections"
        );

        if tokio::time::timeout(timeout, tracker.wait_idle()).await.is_err() {
            tracing::warn!(
                remaining = tracker.active_connections(),
                "shutdown timeout reached for HTTP connections"
            );
        }

        if !server.registry.shutdown_timeout(timeout).await {
            tracing::warn!(
                remaining = server.registry.len(),
                "shutdown timeout reached for websocket connections"
            );
        }

        tracing::info!("server stopped");
        Ok(())
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        shutdown: ShutdownSignal,
    ) -> Result<(), hyper::Error> {
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let server = Arc::clone(self);

        let service = service_fn(move |req: http::Request<Incoming>| {
            let server = Arc::clone(&server);
            async move { server.handle_request(req, remote_addr).await }
        });

        let conn = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades();
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => result,
            () = shutdown.recv() => {
                tracing::debug!(remote = %remote_addr, "closing connection for shutdown");
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        req: http::Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<HttpResponse, Infallible> {
        let (mut parts, body) = req.into_parts();
        let on_upgrade = parts.extensions.remove::<OnUpgrade>();
        let timeout = self.config.request_timeout();

        let collected = tokio::time::timeout(
            timeout,
            Limited::new(body, self.config.max_body_bytes()).collect(),
        )
        .await;

        let body = match collected {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::debug!(remote = %remote_addr, "request body over limit");
                return Ok(plain(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large"));
            }
            Ok(Err(e)) => {
                tracing::debug!(remote = %remote_addr, error = %e, "failed to read request body");
                return Ok(plain(StatusCode::BAD_REQUEST, "Bad Request"));
            }
            Err(_) => {
                tracing::warn!(remote = %remote_addr, "request body collection timed out");
                return Ok(plain(StatusCode::REQUEST_TIMEOUT, "Request Timeout"));
            }
        };

        let mut request = Request::from_parts(parts, body).with_remote_addr(remote_addr);

        let rendered = match tokio::time::timeout(timeout, self.dispatcher.dispatch(&mut request)).await {
            Ok(rendered) => rendered,
            Err(_) => {
                tracing::warn!(method = %request.method(), path = request.path(), "handler chain timed out");
                return Ok(plain(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"));
            }
        };

        tracing::debug!(
            method = %request.method(),
            path = request.path(),
            status = rendered.status.as_u16(),
            "request dispatched"
        );

        Ok(self.finish(rendered, &request, on_upgrade))
    }

    fn finish(&self, rendered: Rendered, request: &Request, on_upgrade: Option<OnUpgrade>) -> HttpResponse {
        let Rendered { status, headers, body } = rendered;
        match body {
            RenderedBody::Buffered(bytes) => build(status, headers, full(bytes)),
            RenderedBody::Stream(stream) => {
                let body = StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync();
                build(status, headers, body)
            }
            RenderedBody::Upgrade(upgrade) => self.upgrade(*upgrade, headers, request, on_upgrade),
        }
    }

    fn upgrade(
        &self,
        upgrade: WebSocketUpgrade,
        extra_headers: HeaderMap,
        request: &Request,
        on_upgrade: Option<OnUpgrade>,
    ) -> HttpResponse {
        let slot = match self.registry.reserve() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(error = %e, "websocket upgrade refused");
                return plain(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
            }
        };

        let upgrade = upgrade.config_or(self.config.websocket());
        let accepted = match upgrade.accept(request.method(), request.version(), request.headers()) {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::debug!(path = request.path(), error = %e, "websocket handshake rejected");
                let mut response = build(
                    StatusCode::BAD_REQUEST,
                    HeaderMap::new(),
                    full(Bytes::from(format!("Bad Request: {e}"))),
                );
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                return response;
            }
        };

        let Some(on_upgrade) = on_upgrade else {
            tracing::error!(path = request.path(), "connection cannot be upgraded");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, crate::dispatcher::SERVER_ERROR_BODY);
        };

        let mut headers = extra_headers;
        for (name, value) in &accepted.response_headers() {
            headers.insert(name, value.clone());
        }

        let path = request.path().to_string();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let handle = upgrade.start(TokioIo::new(upgraded), accepted, Some(slot));
                    tracing::info!(
                        connection_id = %handle.id(),
                        path = %path,
                        protocol = handle.protocol().unwrap_or(""),
                        "websocket connection started"
                    );
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "upgrade failed"),
            }
        });

        build(StatusCode::SWITCHING_PROTOCOLS, headers, empty())
    }
}

fn full(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

fn empty() -> ResponseBody {
    full(Bytes::new())
}

fn build(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> HttpResponse {
    let mut response = http::Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn plain(status: StatusCode, text: &'static str) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    build(status, headers, full(Bytes::from_static(text.as_bytes())))
}

/// Builder for [`Server`].
///
/// ```rust
/// use portico_server::Server;
/// use std::time::Duration;
///
/// let server = Server::builder()
///     .http_addr("127.0.0.1:0")
///     .shutdown_timeout(Duration::from_secs(1))
///     .default_realm("portico")
///     .build();
/// assert!(server.endpoints().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config_builder: ServerConfigBuilder,
    endpoints: Option<Arc<Endpoints>>,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl ServerBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every setting with `config`.
    pub fn config(mut self, config: ServerConfig) -> Self {
        let mut builder = ServerConfigBuilder::new()
            .http_addr(config.http_addr())
            .shutdown_timeout(config.shutdown_timeout())
            .request_timeout(config.request_timeout())
            .max_body_bytes(config.max_body_bytes())
            .websocket(config.websocket().clone())
            .registry(config.registry().clone());
        if let Some(realm) = config.default_realm() {
            builder = builder.default_realm(realm);
        }
        self.config_builder = builder;
        self
    }

    /// Sets the HTTP bind address.
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.http_addr(addr);
        self
    }

    /// Sets the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config_builder = self.config_builder.shutdown_timeout(timeout);
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config_builder = self.config_builder.request_timeout(timeout);
        self
    }

    /// Sets the request body cap.
    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.config_builder = self.config_builder.max_body_bytes(max);
        self
    }

    /// Sets the fallback 401 realm.
    pub fn default_realm(mut self, realm: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.default_realm(realm);
        self
    }

    /// Sets WebSocket connection defaults.
    pub fn websocket(mut self, config: WebSocketConfig) -> Self {
        self.config_builder = self.config_builder.websocket(config);
        self
    }

    /// Sets registry settings. Ignored if a registry is supplied.
    pub fn registry_config(mut self, config: RegistryConfig) -> Self {
        self.config_builder = self.config_builder.registry(config);
        self
    }

    /// Uses an existing endpoint registry.
    pub fn endpoints(mut self, endpoints: Arc<Endpoints>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Uses an existing connection registry.
    pub fn connection_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the server.
    pub fn build(self) -> Server {
        let config = self.config_builder.build();
        let endpoints = self.endpoints.unwrap_or_default();
        let registry = self
            .registry
            .unwrap_or_else(|| ConnectionRegistry::new(config.registry().clone()));
        let dispatcher =
            Dispatcher::new(endpoints).with_default_realm(config.default_realm().map(str::to_string));

        Server {
            config,
            dispatcher,
            registry,
        }
    }
}
