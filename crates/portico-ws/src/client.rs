//! Client-side connections.
//!
//! [`connect`] opens a plain TCP connection for a `ws://` URL, performs the
//! opening handshake and starts a client-role connection whose outgoing
//! frames are masked. TLS is left to the caller: open the secure stream
//! yourself and pass it to [`connect_with_stream`].

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::WebSocketConfig;
use crate::connection::{spawn_connection, ConnectionParts, WebSocketHandle};
use crate::error::{WsError, WsResult};
use crate::extension::{negotiate_client, Extension};
use crate::frame::Role;
use crate::handshake::{
    compute_accept_key, generate_key, header_contains_token, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL,
};
use crate::registry::ConnectionRegistry;
use crate::upgrade::Callbacks;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// A parsed `ws://` or `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// True for `wss`.
    pub secure: bool,
    /// Host name or address, without IPv6 brackets.
    pub host: String,
    /// Port, defaulted from the scheme.
    pub port: u16,
    /// Path and query, always starting with `/`.
    pub path: String,
}

impl WsUrl {
    /// Parses a WebSocket URL.
    ///
    /// ```
    /// use portico_ws::WsUrl;
    ///
    /// let url = WsUrl::parse("ws://example.com:9000/chat?room=1").unwrap();
    /// assert_eq!(url.host, "example.com");
    /// assert_eq!(url.port, 9000);
    /// assert_eq!(url.path, "/chat?room=1");
    /// ```
    pub fn parse(url: &str) -> WsResult<Self> {
        let (secure, rest) = if let Some(rest) = url.strip_prefix("ws://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("wss://") {
            (true, rest)
        } else {
            return Err(WsError::InvalidUrl(format!("unsupported scheme in {url}")));
        };

        let (authority, path) = match rest.find(['/', '?']) {
            Some(i) if rest.as_bytes()[i] == b'?' => (&rest[..i], format!("/{}", &rest[i..])),
            Some(i) => (&rest[..i], rest[i..].to_string()),
            None => (rest, "/".to_string()),
        };
        let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
        if authority.is_empty() {
            return Err(WsError::InvalidUrl(format!("missing host in {url}")));
        }

        let default_port = if secure { 443 } else { 80 };
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| WsError::InvalidUrl(format!("unterminated IPv6 address in {url}")))?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port, url)?,
                None if after.is_empty() => default_port,
                None => return Err(WsError::InvalidUrl(format!("garbage after host in {url}"))),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port, url)?),
                None => (authority, default_port),
            }
        };
        if host.is_empty() {
            return Err(WsError::InvalidUrl(format!("missing host in {url}")));
        }

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// Value for the `Host` header.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

fn parse_port(port: &str, url: &str) -> WsResult<u16> {
    port.parse()
        .map_err(|_| WsError::InvalidUrl(format!("invalid port in {url}")))
}

impl fmt::Display for WsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{scheme}://{}{}", self.host_header(), self.path)
    }
}

/// Everything needed to open a client connection.
#[derive(Clone)]
pub struct ClientRequest {
    url: WsUrl,
    headers: HeaderMap,
    protocols: Vec<String>,
    extensions: Vec<Arc<dyn Extension>>,
    callbacks: Callbacks,
    config: WebSocketConfig,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequest")
            .field("url", &self.url)
            .field("protocols", &self.protocols)
            .field(
                "extensions",
                &self.extensions.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl ClientRequest {
    /// Creates a request for `url`.
    pub fn new(url: &str) -> WsResult<Self> {
        Ok(Self {
            url: WsUrl::parse(url)?,
            headers: HeaderMap::new(),
            protocols: Vec::new(),
            extensions: Vec::new(),
            callbacks: Callbacks::new(),
            config: WebSocketConfig::default(),
            registry: None,
        })
    }

    /// Returns the target URL.
    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    /// Adds an extra request header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Requests a sub-protocol. Order expresses preference.
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Offers an extension.
    pub fn extension(mut self, extension: impl Extension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Sets the connection callbacks.
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Sets the connection configuration.
    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Tracks the connection in `registry`.
    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Renders the HTTP/1.1 upgrade request for `key`.
    pub fn request_bytes(&self, key: &str) -> Vec<u8> {
        let mut out = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n",
            self.url.path,
            self.url.host_header()
        );
        if !self.protocols.is_empty() {
            out.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", self.protocols.join(", ")));
        }
        if !self.extensions.is_empty() {
            let offers: Vec<String> = self.extensions.iter().map(|e| e.offer()).collect();
            out.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", offers.join(", ")));
        }
        let mut bytes = out.into_bytes();
        for (name, value) in &self.headers {
            bytes.extend_from_slice(name.as_str().as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(value.as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"\r\n");
        bytes
    }
}

/// Connects to a `ws://` URL over TCP.
pub async fn connect(request: ClientRequest) -> WsResult<WebSocketHandle> {
    if request.url.secure {
        return Err(WsError::InvalidUrl(
            "wss:// needs a TLS stream; use connect_with_stream".to_string(),
        ));
    }
    let stream = TcpStream::connect((request.url.host.as_str(), request.url.port)).await?;
    stream.set_nodelay(true)?;
    connect_with_stream(stream, request).await
}

/// Performs the client handshake over an already open stream.
pub async fn connect_with_stream<S>(mut stream: S, request: ClientRequest) -> WsResult<WebSocketHandle>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let slot = request.registry.as_ref().map(|r| r.reserve()).transpose()?;

    let key = generate_key();
    stream.write_all(&request.request_bytes(&key)).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    let head_len = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(WsError::handshake_failed("response head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(WsError::handshake_failed("connection closed during handshake"));
        }
    };

    let head = buf.split_to(head_len);
    let (status, headers) = parse_response_head(&head)?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        drain_body(&mut stream, &mut buf, &headers).await;
        tracing::debug!(status = status.as_u16(), url = %request.url, "upgrade rejected");
        return Err(WsError::Rejected {
            status: status.as_u16(),
        });
    }

    if !header_contains_token(&headers, http::header::UPGRADE, "websocket") {
        return Err(WsError::handshake_failed("missing Upgrade: websocket"));
    }
    if !header_contains_token(&headers, http::header::CONNECTION, "upgrade") {
        return Err(WsError::handshake_failed("missing Connection: Upgrade"));
    }
    let accept = headers
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| WsError::handshake_failed("missing Sec-WebSocket-Accept"))?;
    if accept != compute_accept_key(&key) {
        return Err(WsError::handshake_failed("invalid Sec-WebSocket-Accept"));
    }

    let protocol = match headers.get(SEC_WEBSOCKET_PROTOCOL).and_then(|v| v.to_str().ok()) {
        Some(chosen) if request.protocols.iter().any(|p| p == chosen) => Some(chosen.to_string()),
        Some(chosen) => {
            return Err(WsError::handshake_failed(format!(
                "server selected unrequested protocol {chosen}"
            )));
        }
        None => None,
    };

    let extension_header = headers
        .get(SEC_WEBSOCKET_EXTENSIONS)
        .and_then(|v| v.to_str().ok());
    let extensions = negotiate_client(extension_header, &request.extensions)?;

    tracing::debug!(url = %request.url, protocol = protocol.as_deref(), "client handshake complete");

    Ok(spawn_connection(
        stream,
        ConnectionParts {
            role: Role::Client,
            protocol,
            extensions,
            callbacks: request.callbacks,
            config: request.config,
            slot,
            leftover: buf,
        },
    ))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_response_head(head: &[u8]) -> WsResult<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| WsError::handshake_failed("response head is not UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(WsError::handshake_failed(format!("bad status line: {status_line}")));
    }
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| WsError::handshake_failed(format!("bad status line: {status_line}")))?;

    let mut headers = HeaderMap::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WsError::handshake_failed(format!("bad header line: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| WsError::handshake_failed(format!("bad header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| WsError::handshake_failed(format!("bad header value for {name}")))?;
        headers.append(name, value);
    }
    Ok((status, headers))
}

/// Reads and discards a rejection body so the peer sees a clean close.
async fn drain_body<S>(stream: &mut S, buf: &mut BytesMut, headers: &HeaderMap)
where
    S: AsyncRead + Unpin,
{
    let Some(mut remaining) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
    else {
        return;
    };

    loop {
        let take = remaining.min(buf.len());
        buf.advance(take);
        remaining -= take;
        if remaining == 0 {
            return;
        }
        match stream.read_buf(buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls() {
        let url = WsUrl::parse("ws://localhost").unwrap();
        assert_eq!((url.host.as_str(), url.port, url.path.as_str()), ("localhost", 80, "/"));
        assert!(!url.secure);

        let url = WsUrl::parse("wss://example.com/a/b").unwrap();
        assert!(url.secure);
        assert_eq!(url.port, 443);
        assert_eq!(url.host_header(), "example.com");

        let url = WsUrl::parse("ws://[::1]:8080?x=1").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/?x=1");
        assert_eq!(url.host_header(), "[::1]:8080");
        assert_eq!(url.to_string(), "ws://[::1]:8080/?x=1");
    }

    #[test]
    fn test_reject_bad_urls() {
        for bad in ["http://x", "ws://", "ws://host:notaport/", "ws://[::1/"] {
            assert!(matches!(WsUrl::parse(bad), Err(WsError::InvalidUrl(_))), "{bad}");
        }
    }

    #[test]
    fn test_request_bytes() {
        let request = ClientRequest::new("ws://example.com:81/chat")
            .unwrap()
            .protocol("a")
            .protocol("b")
            .header(HeaderName::from_static("x-token"), HeaderValue::from_static("t"));
        let text = String::from_utf8(request.request_bytes("KEY")).unwrap();
        assert!(text.starts_with("GET /chat HTTP/1.1\r\nHost: example.com:81\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: KEY\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: a, b\r\n"));
        assert!(text.contains("x-token: t\r\n"));
        assert!(!text.contains("Sec-WebSocket-Extensions"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_response_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nX-A: 1\r\nX-A: 2\r\n\r\n";
        let end = find_head_end(head).unwrap();
        assert_eq!(end, head.len());
        let (status, headers) = parse_response_head(&head[..end]).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(headers.get_all("x-a").iter().count(), 2);

        assert!(parse_response_head(b"FTP 200 OK\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_wss_needs_a_stream() {
        let request = ClientRequest::new("wss://example.com").unwrap();
        assert!(matches!(connect(request).await, Err(WsError::InvalidUrl(_))));
    }
}
