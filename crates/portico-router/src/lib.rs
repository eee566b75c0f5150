//! Endpoint registry and pattern matcher for Portico.
//!
//! Unlike a first-match router, the registry returns *every* route whose
//! method and pattern match a request, ordered by ascending priority. The
//! dispatcher then runs those handlers as a chain.
//!
//! # Patterns
//!
//! A route is described by an optional prefix and a format, both split on
//! `/` with empty segments dropped. Each format segment is one of:
//!
//! - a literal, matched exactly (case-sensitive)
//! - `:name` or `@name`, matching any single segment and binding it
//! - `*` as the final segment, matching any remaining suffix
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use portico_router::{EndpointRegistry, Route};
//! use http::Method;
//!
//! let registry: EndpointRegistry<&'static str> = EndpointRegistry::new();
//!
//! registry.add(Route::new("GET", Arc::new("auth")).prefix("api").format("*").priority(0)).unwrap();
//! registry.add(Route::new("GET", Arc::new("user")).prefix("api").format("/users/:id").priority(1)).unwrap();
//!
//! let matches = registry.match_route(&Method::GET, "/api/users/42");
//! assert_eq!(matches.len(), 2);
//! assert_eq!(*matches[0].route.handler, "auth");
//! assert_eq!(matches[1].params.get("id"), Some("42"));
//! ```

mod error;
mod params;
mod pattern;
mod registry;
mod route;

pub use error::{RegistryError, RegistryResult};
pub use params::Params;
pub use pattern::{split_segments, Pattern, Segment};
pub use registry::EndpointRegistry;
pub use route::{Route, UserData};

use std::sync::Arc;

/// A route selected for a request, with the parameters its pattern bound.
#[derive(Debug)]
pub struct RouteMatch<H: ?Sized> {
    /// The matched route
    pub route: Arc<Route<H>>,
    /// Named parameters bound by the route's pattern
    pub params: Params,
    /// Whether this is the synthetic match for the default handler
    pub is_default: bool,
}

impl<H: ?Sized> Clone for RouteMatch<H> {
    fn clone(&self) -> Self {
        Self {
            route: Arc::clone(&self.route),
            params: self.params.clone(),
            is_default: self.is_default,
        }
    }
}

impl<H: ?Sized> RouteMatch<H> {
    /// Creates a new route match.
    #[must_use]
    pub fn new(route: Arc<Route<H>>, params: Params) -> Self {
        Self {
            route,
            params,
            is_default: false,
        }
    }

    /// Creates the synthetic match used for the default handler.
    #[must_use]
    pub fn default_handler(route: Arc<Route<H>>) -> Self {
        Self {
            route,
            params: Params::new(),
            is_default: true,
        }
    }
}
