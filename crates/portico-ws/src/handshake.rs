//! Server-side opening handshake.
//!
//! Validates an HTTP/1.1 upgrade request, derives the
//! `Sec-WebSocket-Accept` value, picks a sub-protocol and negotiates
//! extensions. Errors from here are answered with HTTP 400 and no upgrade
//! takes place.

use std::sync::Arc;

use base64::Engine;
use http::{header, HeaderMap, HeaderValue, Method, Version};
use sha1::{Digest, Sha1};

use crate::error::{WsError, WsResult};
use crate::extension::{negotiate_server, Extension, ExtensionOffer, ExtensionSet};

/// The WebSocket magic GUID used in the handshake.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Key` header name.
pub const SEC_WEBSOCKET_KEY: &str = "sec-websocket-key";
/// `Sec-WebSocket-Version` header name.
pub const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";
/// `Sec-WebSocket-Accept` header name.
pub const SEC_WEBSOCKET_ACCEPT: &str = "sec-websocket-accept";
/// `Sec-WebSocket-Protocol` header name.
pub const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";
/// `Sec-WebSocket-Extensions` header name.
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "sec-websocket-extensions";

/// Compute the Sec-WebSocket-Accept value from the key.
///
/// ```rust
/// use portico_ws::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    let result = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(result)
}

/// Generates a random 16-byte, base64 encoded `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let mut bytes = [0_u8; 16];
    bytes.iter_mut().for_each(|b| *b = fastrand::u8(..));
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Collects a comma separated, possibly repeated header into its items.
pub fn header_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

/// Returns true if a comma separated header contains `token`, ignoring case.
pub fn header_contains_token(headers: &HeaderMap, name: impl header::AsHeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

/// Validates an upgrade request and returns the accept key.
pub fn validate_upgrade_request(
    method: &Method,
    version: Version,
    headers: &HeaderMap,
) -> WsResult<String> {
    if method != Method::GET {
        return Err(WsError::not_websocket(format!(
            "upgrade requires GET, got {method}"
        )));
    }

    if version != Version::HTTP_11 {
        return Err(WsError::not_websocket(format!(
            "upgrade requires HTTP/1.1, got {version:?}"
        )));
    }

    if !header_str(headers, header::UPGRADE).is_some_and(|v| v.eq_ignore_ascii_case("websocket")) {
        return Err(WsError::not_websocket("missing Upgrade: websocket header"));
    }

    if !header_contains_token(headers, header::CONNECTION, "upgrade") {
        return Err(WsError::not_websocket("missing Connection: Upgrade header"));
    }

    if header_str(headers, SEC_WEBSOCKET_VERSION).map(str::trim) != Some("13") {
        return Err(WsError::not_websocket(
            "missing or invalid Sec-WebSocket-Version header (must be 13)",
        ));
    }

    let key = header_str(headers, SEC_WEBSOCKET_KEY)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| WsError::not_websocket("missing Sec-WebSocket-Key header"))?;

    Ok(compute_accept_key(key))
}

/// Picks the first server-offered protocol the client also requested.
///
/// A client that requests no protocol gets none. A client whose requests
/// share nothing with a non-empty server list is refused.
pub fn select_protocol(requested: &[String], offered: &[String]) -> WsResult<Option<String>> {
    if requested.is_empty() || offered.is_empty() {
        return Ok(None);
    }
    offered
        .iter()
        .find(|p| requested.iter().any(|r| r == *p))
        .cloned()
        .map(Some)
        .ok_or_else(|| {
            WsError::negotiation_failed(format!(
                "no common sub-protocol in {}",
                requested.join(", ")
            ))
        })
}

/// A validated upgrade, ready to be answered with 101.
#[derive(Debug)]
pub struct Accepted {
    /// `Sec-WebSocket-Accept` value.
    pub accept_key: String,
    /// Selected sub-protocol.
    pub protocol: Option<String>,
    /// `Sec-WebSocket-Extensions` response value.
    pub extension_header: Option<String>,
    /// Negotiated extensions for the connection.
    pub extensions: ExtensionSet,
}

impl Accepted {
    /// Headers of the 101 Switching Protocols response.
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        let values = [
            (SEC_WEBSOCKET_ACCEPT, Some(&self.accept_key)),
            (SEC_WEBSOCKET_PROTOCOL, self.protocol.as_ref()),
            (SEC_WEBSOCKET_EXTENSIONS, self.extension_header.as_ref()),
        ];
        for (name, value) in values {
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }
        headers
    }
}

/// Runs the whole server handshake.
pub fn accept(
    method: &Method,
    version: Version,
    headers: &HeaderMap,
    protocols: &[String],
    extensions: &[Arc<dyn Extension>],
) -> WsResult<Accepted> {
    let accept_key = validate_upgrade_request(method, version, headers)?;

    let requested = header_list(headers, SEC_WEBSOCKET_PROTOCOL);
    let protocol = select_protocol(&requested, protocols)?;

    let offers: Vec<ExtensionOffer> = headers
        .get_all(SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(ExtensionOffer::parse_list)
        .collect();
    let (extensions, extension_header) = negotiate_server(&offers, extensions)?;

    tracing::debug!(
        protocol = protocol.as_deref(),
        extensions = extension_header.as_deref(),
        "websocket handshake accepted"
    );

    Ok(Accepted {
        accept_key,
        protocol,
        extension_header,
        extensions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::PerMessageDeflate;
    use crate::extension::ExtensionBinding;
    use crate::frame::ReservedBit;

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    #[test]
    fn test_compute_accept_key() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_16_bytes() {
        let key = generate_key();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_valid_request() {
        let key = validate_upgrade_request(&Method::GET, Version::HTTP_11, &upgrade_headers()).unwrap();
        assert_eq!(key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_rejects_wrong_method_and_version() {
        let headers = upgrade_headers();
        assert!(validate_upgrade_request(&Method::POST, Version::HTTP_11, &headers).is_err());
        let err = validate_upgrade_request(&Method::GET, Version::HTTP_10, &headers).unwrap_err();
        assert!(err.is_bad_request());
        assert!(err.to_string().contains("HTTP/1.1"));
    }

    #[test]
    fn test_rejects_missing_headers() {
        for name in [
            header::UPGRADE.as_str(),
            header::CONNECTION.as_str(),
            SEC_WEBSOCKET_VERSION,
            SEC_WEBSOCKET_KEY,
        ] {
            let mut headers = upgrade_headers();
            headers.remove(name);
            let err = validate_upgrade_request(&Method::GET, Version::HTTP_11, &headers).unwrap_err();
            assert!(matches!(err, WsError::NotWebSocketRequest { .. }), "{name}");
        }

        let mut headers = upgrade_headers();
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert!(validate_upgrade_request(&Method::GET, Version::HTTP_11, &headers).is_err());
    }

    #[test]
    fn test_select_protocol() {
        let offered = vec!["chat".to_string(), "superchat".to_string()];
        let requested = vec!["superchat".to_string(), "chat".to_string()];
        assert_eq!(
            select_protocol(&requested, &offered).unwrap().as_deref(),
            Some("chat")
        );
        assert_eq!(select_protocol(&[], &offered).unwrap(), None);
        assert_eq!(select_protocol(&requested, &[]).unwrap(), None);
        assert!(select_protocol(&["other".to_string()], &offered).is_err());
    }

    #[test]
    fn test_accept_builds_response() {
        let mut headers = upgrade_headers();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("v2, v1"));
        headers.insert(
            SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("permessage-deflate; client_max_window_bits, x-unknown"),
        );
        let extensions: Vec<Arc<dyn Extension>> = vec![Arc::new(PerMessageDeflate::server())];

        let accepted = accept(
            &Method::GET,
            Version::HTTP_11,
            &headers,
            &["v1".to_string(), "v2".to_string()],
            &extensions,
        )
        .unwrap();

        assert_eq!(accepted.protocol.as_deref(), Some("v1"));
        assert_eq!(accepted.extensions.names(), vec!["permessage-deflate"]);

        let response = accepted.response_headers();
        assert_eq!(response[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response[SEC_WEBSOCKET_PROTOCOL], "v1");
        assert_eq!(response[SEC_WEBSOCKET_EXTENSIONS], "permessage-deflate");
        assert_eq!(response[header::UPGRADE], "websocket");
    }

    #[test]
    fn test_accept_rejects_overlapping_bits() {
        let mut headers = upgrade_headers();
        headers.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static("permessage-deflate, x-rsv1"));
        let extensions: Vec<Arc<dyn Extension>> = vec![
            Arc::new(PerMessageDeflate::server()),
            Arc::new(ExtensionBinding::new("x-rsv1", ReservedBit::Rsv1)),
        ];
        let err = accept(&Method::GET, Version::HTTP_11, &headers, &[], &extensions).unwrap_err();
        assert!(err.is_bad_request());
    }
}
