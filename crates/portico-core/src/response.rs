//! Responses built up by a handler chain.
//!
//! Every handler in a chain receives the same [`Response`] and may change
//! any part of it. The body is exactly one of: nothing, buffered bytes, a
//! byte stream, or a WebSocket upgrade. Setting one replaces the others.

use std::any::Any;
use std::fmt;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::header::{IntoHeaderName, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use portico_ws::WebSocketUpgrade;
use serde::Serialize;

use crate::cookie::SetCookie;
use crate::error::CoreResult;

/// A streamed response body, polled by the listener.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Response body.
#[derive(Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// A complete body.
    Buffered(Bytes),
    /// Chunks produced on demand.
    Stream(BodyStream),
    /// Upgrade the connection to a WebSocket instead of sending a body.
    WebSocket(Box<WebSocketUpgrade>),
}

impl Body {
    /// Returns true for [`Body::WebSocket`].
    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::WebSocket(_))
    }

    /// Returns the buffered bytes, if any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::WebSocket(upgrade) => f.debug_tuple("WebSocket").field(upgrade).finish(),
        }
    }
}

/// A response under construction.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    cookies: Vec<SetCookie>,
    body: Body,
    auth_realm: Option<String>,
    shared: Option<Box<dyn Any + Send + Sync>>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("body", &self.body)
            .field("auth_realm", &self.auth_realm)
            .field("has_shared_data", &self.shared.is_some())
            .finish()
    }
}

impl Response {
    /// Creates an empty 200 response.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Body::Empty,
            auth_realm: None,
            shared: None,
        }
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Sets a header, replacing previous values.
    pub fn set_header<K: IntoHeaderName>(&mut self, name: K, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Sets a header from strings.
    pub fn insert_header(&mut self, name: &str, value: &str) -> CoreResult<()> {
        let name = http::HeaderName::from_bytes(name.as_bytes())?;
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(())
    }

    /// Cookies to send.
    pub fn cookies(&self) -> &[SetCookie] {
        &self.cookies
    }

    /// Adds a cookie. A cookie with the same name replaces the earlier one.
    pub fn add_cookie(&mut self, cookie: SetCookie) {
        self.cookies.retain(|c| c.name() != cookie.name());
        self.cookies.push(cookie);
    }

    /// The body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Takes the body, leaving [`Body::Empty`].
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Sets a buffered body.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = Body::Buffered(body.into());
    }

    /// Sets a UTF-8 text body, defaulting the content type to `text/plain`.
    pub fn set_string_body(&mut self, body: impl Into<String>) {
        self.default_content_type("text/plain; charset=utf-8");
        self.set_body(body.into());
    }

    /// Serializes `value` as the JSON body.
    pub fn set_json_body<T: Serialize + ?Sized>(&mut self, value: &T) -> CoreResult<()> {
        let body = serde_json::to_vec(value)?;
        self.set_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.set_body(body);
        Ok(())
    }

    /// Streams the body from `stream`.
    pub fn set_stream(&mut self, stream: BodyStream) {
        self.body = Body::Stream(stream);
    }

    /// Requests a WebSocket upgrade.
    pub fn set_websocket(&mut self, upgrade: WebSocketUpgrade) {
        self.body = Body::WebSocket(Box::new(upgrade));
    }

    /// Drops any body set so far.
    pub fn discard_body(&mut self) {
        self.body = Body::Empty;
    }

    fn default_content_type(&mut self, value: &'static str) {
        if !self.headers.contains_key(CONTENT_TYPE) {
            self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
        }
    }

    /// Realm for a `401` challenge.
    pub fn auth_realm(&self) -> Option<&str> {
        self.auth_realm.as_deref()
    }

    /// Sets the realm used if the chain ends unauthorized.
    pub fn set_auth_realm(&mut self, realm: impl Into<String>) {
        self.auth_realm = Some(realm.into());
    }

    /// Stores a value for later handlers in the chain, dropping any value
    /// stored before.
    pub fn set_shared_data<T: Any + Send + Sync>(&mut self, value: T) {
        self.shared = Some(Box::new(value));
    }

    /// Borrows the shared value if it has type `T`.
    pub fn shared_data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.shared.as_deref().and_then(|v| v.downcast_ref())
    }

    /// Mutably borrows the shared value if it has type `T`.
    pub fn shared_data_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.shared.as_deref_mut().and_then(|v| v.downcast_mut())
    }

    /// Takes the shared value if it has type `T`. A value of another type
    /// is left in place.
    pub fn take_shared_data<T: Any + Send + Sync>(&mut self) -> Option<T> {
        match self.shared.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.shared = Some(other);
                None
            }
        }
    }

    /// Drops the shared value.
    pub fn clear_shared_data(&mut self) {
        self.shared = None;
    }

    /// Returns true if a shared value is stored.
    pub fn has_shared_data(&self) -> bool {
        self.shared.is_some()
    }

    /// Splits the response for rendering. Shared data is dropped here.
    pub fn into_parts(self) -> ResponseParts {
        ResponseParts {
            status: self.status,
            headers: self.headers,
            cookies: self.cookies,
            body: self.body,
            auth_realm: self.auth_realm,
        }
    }
}

/// A finished response, as consumed by the renderer.
#[derive(Debug)]
pub struct ResponseParts {
    /// Status code.
    pub status: StatusCode,
    /// Headers set by handlers.
    pub headers: HeaderMap,
    /// Cookies to send.
    pub cookies: Vec<SetCookie>,
    /// The body.
    pub body: Body,
    /// Realm for a `401` challenge.
    pub auth_realm: Option<String>,
}
