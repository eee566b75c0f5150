//! Incoming HTTP requests.

use std::net::SocketAddr;

use base64::Engine;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, Method, Uri, Version};
use indexmap::IndexMap;
use portico_router::Params;
use serde::de::DeserializeOwned;

use crate::cookie::Cookies;
use crate::error::{CoreError, CoreResult};

/// Credentials from `Authorization: Basic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    /// User name.
    pub user: String,
    /// Password.
    pub password: String,
}

/// Authentication data attached to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    /// Decoded basic credentials, if the client sent them.
    pub basic: Option<BasicAuth>,
    /// Identity of a TLS client certificate, set by the listener.
    pub tls_identity: Option<String>,
}

impl Auth {
    /// Decodes an `Authorization` header value.
    ///
    /// Anything other than a well formed `Basic` credential yields `None`.
    pub fn parse_basic(value: &str) -> Option<BasicAuth> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some(BasicAuth {
            user: user.to_string(),
            password: password.to_string(),
        })
    }
}

/// A request as seen by handlers.
///
/// The dispatcher owns the request for the whole chain. Handlers get a
/// shared reference; only the dispatcher updates the URL parameters and
/// the callback position between handler calls.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    query: IndexMap<String, String>,
    url_params: IndexMap<String, String>,
    form: IndexMap<String, String>,
    cookies: Cookies,
    auth: Auth,
    remote_addr: Option<SocketAddr>,
    callback_position: usize,
}

impl Request {
    /// Creates a request with no headers or body.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self::from_parts_inner(method, uri, Version::HTTP_11, HeaderMap::new(), Bytes::new())
    }

    /// Builds a request from decoded HTTP parts and the collected body.
    pub fn from_parts(parts: http::request::Parts, body: Bytes) -> Self {
        Self::from_parts_inner(parts.method, parts.uri, parts.version, parts.headers, body)
    }

    fn from_parts_inner(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let mut request = Self {
            method,
            uri,
            version,
            headers,
            body,
            query: IndexMap::new(),
            url_params: IndexMap::new(),
            form: IndexMap::new(),
            cookies: Cookies::new(),
            auth: Auth::default(),
            remote_addr: None,
            callback_position: 0,
        };
        request.refresh();
        request
    }

    /// Re-derives the query, form, cookie and auth views from the raw
    /// request. Malformed input leaves the view empty.
    fn refresh(&mut self) {
        self.query = self
            .uri
            .query()
            .and_then(|q| match decode_pairs(q) {
                Ok(pairs) => Some(pairs),
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring malformed query string");
                    None
                }
            })
            .unwrap_or_default();
        self.url_params = self.query.clone();

        self.form = if self.is_form() {
            std::str::from_utf8(&self.body)
                .ok()
                .and_then(|body| decode_pairs(body).ok())
                .unwrap_or_default()
        } else {
            IndexMap::new()
        };

        self.cookies = Cookies::from_headers(&self.headers);
        self.auth.basic = self
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(Auth::parse_basic);
    }

    fn is_form(&self) -> bool {
        self.content_type()
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
    }

    /// Adds a header and refreshes the derived views.
    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self.refresh();
        self
    }

    /// Replaces the body and refreshes the derived views.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.refresh();
        self
    }

    /// Sets the client address.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Sets the TLS client identity.
    pub fn with_tls_identity(mut self, identity: impl Into<String>) -> Self {
        self.auth.tls_identity = Some(identity.into());
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Full request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Path component of the URI.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The `Content-Type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Raw body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decoded query parameters.
    pub fn query(&self) -> &IndexMap<String, String> {
        &self.query
    }

    /// URL parameters: the query merged with the named segments bound by
    /// every route matched so far.
    pub fn url_params(&self) -> &IndexMap<String, String> {
        &self.url_params
    }

    /// Returns one URL parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.url_params.get(name).map(String::as_str)
    }

    /// Fields of an `application/x-www-form-urlencoded` body.
    pub fn form(&self) -> &IndexMap<String, String> {
        &self.form
    }

    /// Deserializes the query string.
    pub fn query_as<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_urlencoded::from_str(self.uri.query().unwrap_or_default())
            .map_err(|e| CoreError::InvalidQuery(e.to_string()))
    }

    /// Deserializes a form body.
    pub fn form_as<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_urlencoded::from_bytes(&self.body).map_err(|e| CoreError::InvalidForm(e.to_string()))
    }

    /// Deserializes a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Request cookies.
    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    /// Authentication data.
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// Client address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Number of handlers in the current chain that did not ignore the
    /// request.
    pub fn callback_position(&self) -> usize {
        self.callback_position
    }

    /// Counts a handler invocation.
    pub fn advance_callback_position(&mut self) {
        self.callback_position += 1;
    }

    /// Resets the URL parameters to the query parameters.
    pub fn reset_url_params(&mut self) {
        self.url_params = self.query.clone();
    }

    /// Merges route bindings into the URL parameters. A key that already
    /// exists gets the new value appended after a comma.
    pub fn merge_url_params(&mut self, params: &Params) {
        for (name, value) in params {
            self.url_params
                .entry(name.to_string())
                .and_modify(|existing| {
                    existing.push(',');
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
    }

    /// Returns true for a WebSocket upgrade request.
    pub fn is_websocket_upgrade(&self) -> bool {
        portico_ws::handshake::header_contains_token(&self.headers, http::header::UPGRADE, "websocket")
    }
}

/// Decodes `a=1&b=2` pairs; a repeated key keeps the values comma-joined.
fn decode_pairs(input: &str) -> Result<IndexMap<String, String>, serde_urlencoded::de::Error> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(input)?;
    let mut map: IndexMap<String, String> = IndexMap::new();
    for (key, value) in pairs {
        map.entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderName, HeaderValue};
    use serde::Deserialize;

    fn get(uri: &'static str) -> Request {
        Request::new(Method::GET, Uri::from_static(uri))
    }

    #[test]
    fn test_query_and_url_params() {
        let mut request = get("/users/7?sort=asc&tag=a&tag=b");
        assert_eq!(request.path(), "/users/7");
        assert_eq!(request.query().get("sort").map(String::as_str), Some("asc"));
        assert_eq!(request.param("tag"), Some("a,b"));

        let mut params = Params::new();
        params.bind("id", "7");
        params.bind("sort", "desc");
        request.merge_url_params(&params);
        assert_eq!(request.param("id"), Some("7"));
        assert_eq!(request.param("sort"), Some("asc,desc"));

        request.reset_url_params();
        assert_eq!(request.param("id"), None);
    }

    #[test]
    fn test_typed_query() {
        #[derive(Deserialize)]
        struct Page {
            page: u32,
        }
        assert_eq!(get("/?page=3").query_as::<Page>().unwrap().page, 3);
        assert!(get("/?page=x").query_as::<Page>().is_err());
    }

    #[test]
    fn test_form_body() {
        let request = Request::new(Method::POST, Uri::from_static("/login"))
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
            )
            .with_body("user=ann&note=hello+world");
        assert_eq!(request.form().get("note").map(String::as_str), Some("hello world"));

        let plain = Request::new(Method::POST, Uri::from_static("/")).with_body("user=ann");
        assert!(plain.form().is_empty());
    }

    #[test]
    fn test_json_body() {
        let request = Request::new(Method::POST, Uri::from_static("/")).with_body(r#"{"n": 5}"#);
        let value: serde_json::Value = request.json().unwrap();
        assert_eq!(value["n"], 5);
        assert!(get("/").json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_basic_auth() {
        // "ann:s3:cret"
        let request = get("/").with_header(
            AUTHORIZATION,
            HeaderValue::from_static("Basic YW5uOnMzOmNyZXQ="),
        );
        let basic = request.auth().basic.clone().unwrap();
        assert_eq!(basic.user, "ann");
        assert_eq!(basic.password, "s3:cret");

        assert_eq!(Auth::parse_basic("Bearer abc"), None);
        assert_eq!(Auth::parse_basic("Basic !!!"), None);
    }

    #[test]
    fn test_cookies_and_identity() {
        let request = get("/")
            .with_header(http::header::COOKIE, HeaderValue::from_static("sid=1"))
            .with_tls_identity("CN=client")
            .with_remote_addr("127.0.0.1:9000".parse().unwrap());
        assert_eq!(request.cookies().get("sid"), Some("1"));
        assert_eq!(request.auth().tls_identity.as_deref(), Some("CN=client"));
        assert_eq!(request.remote_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_callback_position_and_upgrade_detection() {
        let mut request = get("/ws").with_header(
            HeaderName::from_static("upgrade"),
            HeaderValue::from_static("WebSocket"),
        );
        assert!(request.is_websocket_upgrade());
        assert_eq!(request.callback_position(), 0);
        request.advance_callback_position();
        assert_eq!(request.callback_position(), 1);
    }
}
