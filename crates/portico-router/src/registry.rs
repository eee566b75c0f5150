//! The endpoint registry.
//!
//! Routes may be added and removed while requests are being matched; every
//! lookup works on a consistent snapshot taken under a read lock.

use std::sync::Arc;

use http::Method;
use parking_lot::RwLock;

use crate::error::{RegistryError, RegistryResult};
use crate::pattern::split_segments;
use crate::route::Route;
use crate::RouteMatch;

struct Inner<H: ?Sized> {
    routes: Vec<Arc<Route<H>>>,
    default: Option<Arc<Route<H>>>,
}

/// Ordered collection of routes plus an optional default handler.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use portico_router::{EndpointRegistry, Route};
/// use http::Method;
///
/// let registry = EndpointRegistry::new();
/// registry.add(Route::new("GET", Arc::new(3)).format("/a").priority(3)).unwrap();
/// registry.add(Route::new("GET", Arc::new(1)).format("/a").priority(1)).unwrap();
/// registry.add(Route::new("GET", Arc::new(2)).format("/a").priority(2)).unwrap();
///
/// let order: Vec<i32> = registry
///     .match_route(&Method::GET, "/a")
///     .iter()
///     .map(|m| *m.route.handler)
///     .collect();
/// assert_eq!(order, vec![1, 2, 3]);
/// ```
pub struct EndpointRegistry<H: ?Sized> {
    inner: RwLock<Inner<H>>,
}

impl<H: ?Sized> Default for EndpointRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> std::fmt::Debug for EndpointRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("EndpointRegistry")
            .field("routes", &inner.routes)
            .field("has_default", &inner.default.is_some())
            .finish()
    }
}

impl<H: ?Sized> EndpointRegistry<H> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                routes: Vec::new(),
                default: None,
            }),
        }
    }

    fn validate(route: &Route<H>) -> RegistryResult<()> {
        if route.method().is_empty() {
            return Err(RegistryError::EmptyMethod);
        }
        if !route.has_pattern() {
            return Err(RegistryError::MissingPattern {
                method: route.method().to_string(),
            });
        }
        Ok(())
    }

    /// Registers a route.
    pub fn add(&self, route: Route<H>) -> RegistryResult<()> {
        Self::validate(&route)?;
        tracing::debug!(
            method = route.method(),
            prefix = route.prefix_str(),
            format = route.format_str(),
            priority = route.priority_value(),
            "registering route"
        );
        self.inner.write().routes.push(Arc::new(route));
        Ok(())
    }

    /// Registers several routes. Nothing is inserted unless all are valid.
    pub fn add_many(&self, routes: impl IntoIterator<Item = Route<H>>) -> RegistryResult<()> {
        let routes: Vec<Route<H>> = routes.into_iter().collect();
        for route in &routes {
            Self::validate(route)?;
        }
        let mut inner = self.inner.write();
        inner.routes.extend(routes.into_iter().map(Arc::new));
        Ok(())
    }

    /// Removes the first route registered with exactly this method, prefix
    /// and format (leading and trailing separators are ignored).
    pub fn remove(
        &self,
        method: &str,
        prefix: Option<&str>,
        format: Option<&str>,
    ) -> RegistryResult<()> {
        if method.trim().is_empty() {
            return Err(RegistryError::EmptyMethod);
        }
        if prefix.is_none() && format.is_none() {
            return Err(RegistryError::MissingPattern {
                method: method.to_string(),
            });
        }

        let mut inner = self.inner.write();
        let position = inner
            .routes
            .iter()
            .position(|r| r.same_endpoint(method, prefix, format));

        match position {
            Some(index) => {
                inner.routes.remove(index);
                tracing::debug!(method, prefix, format, "removed route");
                Ok(())
            }
            None => Err(RegistryError::NotFound {
                method: method.to_string(),
                prefix: prefix.unwrap_or_default().to_string(),
                format: format.unwrap_or_default().to_string(),
            }),
        }
    }

    /// Sets the default handler used when no route matches.
    pub fn set_default(&self, route: Route<H>) {
        self.inner.write().default = Some(Arc::new(route));
    }

    /// Clears the default handler, returning the previous one.
    pub fn clear_default(&self) -> Option<Arc<Route<H>>> {
        self.inner.write().default.take()
    }

    /// Returns the default handler, if one is set.
    pub fn default_route(&self) -> Option<Arc<Route<H>>> {
        self.inner.read().default.clone()
    }

    /// Returns the number of registered routes.
    pub fn len(&self) -> usize {
        self.inner.read().routes.len()
    }

    /// Returns true if no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().routes.is_empty()
    }

    /// Returns a snapshot of the registered routes in registration order.
    pub fn routes(&self) -> Vec<Arc<Route<H>>> {
        self.inner.read().routes.clone()
    }

    /// Returns every route matching `method` and `path`, by ascending
    /// priority with ties in registration order.
    ///
    /// If nothing matches and a default handler is set, the result is a
    /// single synthetic match for it.
    pub fn match_route(&self, method: &Method, path: &str) -> Vec<RouteMatch<H>> {
        let segments = split_segments(path);
        let inner = self.inner.read();

        let mut matches: Vec<RouteMatch<H>> = inner
            .routes
            .iter()
            .filter(|route| route.matches_method(method))
            .filter_map(|route| {
                route
                    .pattern()
                    .match_segments(&segments)
                    .map(|params| RouteMatch::new(Arc::clone(route), params))
            })
            .collect();

        // Stable sort keeps registration order among equal priorities.
        matches.sort_by_key(|m| m.route.priority_value());

        if matches.is_empty() {
            if let Some(default) = &inner.default {
                matches.push(RouteMatch::default_handler(Arc::clone(default)));
            }
        }

        tracing::trace!(%method, path, matched = matches.len(), "matched routes");
        matches
    }
}
