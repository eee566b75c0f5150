//! Dispatch chain runner.
//!
//! Runs every handler matched for a request, in priority order, and turns
//! the final [`Response`] into a [`Rendered`] response for the listener.
//!
//! ```text
//!   match_route ──► [h1] ─Continue─► [h2] ─Ignore─► [h3] ─Complete─► render
//!                     │                               │
//!                     └─Error─► 500                   └─Unauthorized─► 401
//! ```
//!
//! After the chain, if no handler counted (every call ignored) and the
//! default handler has not run yet, it runs once more.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode};
use portico_core::{Body, BodyStream, Handler, Request, Response, ResponseParts, Signal};
use portico_router::EndpointRegistry;
use portico_ws::WebSocketUpgrade;

/// Body of a 404.
pub const NOT_FOUND_BODY: &str = "Page not found";

/// Body of a 500.
pub const SERVER_ERROR_BODY: &str = "Server Error";

/// Body of a 401 whose handler set none.
pub const UNAUTHORIZED_BODY: &str = "Error: Unauthorized";

/// Endpoints keyed by handler trait objects.
pub type Endpoints = EndpointRegistry<dyn Handler>;

/// The body of a rendered response.
pub enum RenderedBody {
    /// Complete body, possibly empty.
    Buffered(Bytes),
    /// Chunks to forward as they arrive.
    Stream(BodyStream),
    /// Switch protocols and start a WebSocket connection.
    Upgrade(Box<WebSocketUpgrade>),
}

impl std::fmt::Debug for RenderedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(bytes).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Upgrade(upgrade) => f.debug_tuple("Upgrade").field(upgrade).finish(),
        }
    }
}

/// A response ready to hand to the listener.
#[derive(Debug)]
pub struct Rendered {
    /// Status code.
    pub status: StatusCode,
    /// Headers, including `Set-Cookie`.
    pub headers: HeaderMap,
    /// Body.
    pub body: RenderedBody,
}

impl Rendered {
    /// A plain-text response.
    pub fn text(status: StatusCode, body: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        Self {
            status,
            headers,
            body: RenderedBody::Buffered(Bytes::from_static(body.as_bytes())),
        }
    }

    /// The 404 response.
    pub fn not_found() -> Self {
        Self::text(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
    }

    /// The generic 500 response.
    pub fn server_error() -> Self {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_BODY)
    }

    /// Buffered body bytes, if the body is buffered.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            RenderedBody::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// How the chain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Render,
    Unauthorized,
    Error,
}

/// Runs handler chains against an endpoint registry.
#[derive(Clone)]
pub struct Dispatcher {
    endpoints: Arc<Endpoints>,
    default_realm: Option<String>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.endpoints.len())
            .field("default_realm", &self.default_realm)
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over `endpoints`.
    pub fn new(endpoints: Arc<Endpoints>) -> Self {
        Self {
            endpoints,
            default_realm: None,
        }
    }

    /// Sets the realm used when an unauthorized response names none.
    pub fn with_default_realm(mut self, realm: Option<String>) -> Self {
        self.default_realm = realm;
        self
    }

    /// The endpoint registry.
    pub fn endpoints(&self) -> &Arc<Endpoints> {
        &self.endpoints
    }

    /// Runs the chain for `request` and renders the result.
    pub async fn dispatch(&self, request: &mut Request) -> Rendered {
        let matches = self.endpoints.match_route(request.method(), request.path());
        if matches.is_empty() {
            tracing::debug!(method = %request.method(), path = request.path(), "no route");
            return Rendered::not_found();
        }

        request.reset_url_params();
        let mut response = Response::new();
        let mut outcome = None;
        let mut default_ran = false;

        for route_match in &matches {
            default_ran |= route_match.is_default;
            request.merge_url_params(&route_match.params);

            let route = &route_match.route;
            let signal = route
                .handler
                .call(request, &mut response, route.user_data.as_ref())
                .await;
            if signal != Signal::Ignore {
                request.advance_callback_position();
            }

            tracing::debug!(
                method = route.method(),
                prefix = route.prefix_str().unwrap_or(""),
                format = route.format_str().unwrap_or(""),
                default = route_match.is_default,
                ?signal,
                "handler returned"
            );

            outcome = match signal {
                Signal::Continue | Signal::Ignore => None,
                Signal::Complete => Some(Outcome::Render),
                Signal::Unauthorized => Some(Outcome::Unauthorized),
                Signal::Error => Some(Outcome::Error),
            };
            if outcome.is_none() && hands_off(&response) {
                // an upgrade or stream ends the chain as soon as it is set
                outcome = Some(Outcome::Render);
            }
            if outcome.is_some() {
                break;
            }
        }

        if outcome.is_none() && request.callback_position() == 0 && !default_ran {
            if let Some(default) = self.endpoints.default_route() {
                let signal = default
                    .handler
                    .call(request, &mut response, default.user_data.as_ref())
                    .await;
                if signal != Signal::Ignore {
                    request.advance_callback_position();
                }
                tracing::debug!(?signal, "default handler returned");
                outcome = match signal {
                    Signal::Unauthorized => Some(Outcome::Unauthorized),
                    Signal::Error => Some(Outcome::Error),
                    Signal::Continue | Signal::Ignore | Signal::Complete => None,
                };
            }
        }

        self.render(response.into_parts(), outcome.unwrap_or(Outcome::Render))
    }

    fn render(&self, parts: ResponseParts, outcome: Outcome) -> Rendered {
        let ResponseParts {
            status,
            mut headers,
            cookies,
            body,
            auth_realm,
        } = parts;

        if outcome == Outcome::Error {
            tracing::warn!(handler_status = %status, "handler chain failed");
            return Rendered::server_error();
        }

        for cookie in &cookies {
            match HeaderValue::from_str(&cookie.to_header_value()) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(e) => tracing::warn!(cookie = cookie.name(), error = %e, "cookie dropped"),
            }
        }

        if outcome == Outcome::Unauthorized {
            let realm = auth_realm.as_deref().or(self.default_realm.as_deref());
            if let Some(realm) = realm {
                match HeaderValue::from_str(&format!("Basic realm=\"{realm}\"")) {
                    Ok(value) => {
                        headers.insert(WWW_AUTHENTICATE, value);
                    }
                    Err(e) => tracing::warn!(realm, error = %e, "realm not representable"),
                }
            }

            let body = match body {
                Body::Buffered(bytes) => bytes,
                _ => {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                    Bytes::from_static(UNAUTHORIZED_BODY.as_bytes())
                }
            };
            return Rendered {
                status: StatusCode::UNAUTHORIZED,
                headers,
                body: RenderedBody::Buffered(body),
            };
        }

        let body = match body {
            Body::Empty => RenderedBody::Buffered(Bytes::new()),
            Body::Buffered(bytes) => RenderedBody::Buffered(bytes),
            Body::Stream(stream) => RenderedBody::Stream(stream),
            Body::WebSocket(upgrade) => RenderedBody::Upgrade(upgrade),
        };

        Rendered { status, headers, body }
    }
}

fn hands_off(response: &Response) -> bool {
    matches!(response.body(), Body::Stream(_) | Body::WebSocket(_))
}
