//! Route records.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::params::Params;
use crate::pattern::Pattern;

/// Opaque value handed to a route handler or a WebSocket callback on every
/// invocation.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// A registered endpoint: method, prefix, format, priority, handler and
/// user data.
///
/// The handler type is generic so the registry can hold plain values in
/// tests and trait objects in the server.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use portico_router::Route;
/// use http::Method;
///
/// let route = Route::new("get", Arc::new(()))
///     .prefix("/api/")
///     .format("users/:id")
///     .priority(5);
///
/// assert!(route.matches_method(&Method::GET));
/// assert_eq!(route.prefix_str(), Some("api"));
/// assert!(route.match_path("/api/users/3").is_some());
/// ```
pub struct Route<H: ?Sized> {
    method: String,
    prefix: Option<String>,
    format: Option<String>,
    priority: u32,
    pattern: Pattern,
    /// The handler invoked when the route matches
    pub handler: Arc<H>,
    /// Value passed to the handler alongside the request
    pub user_data: Option<UserData>,
}

/// Trims leading and trailing separators.
fn normalize(part: &str) -> String {
    part.trim_matches('/').to_string()
}

impl<H: ?Sized> Route<H> {
    /// Creates a route for `method` (or `*` for any method).
    pub fn new(method: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            method: method.into().trim().to_string(),
            prefix: None,
            format: None,
            priority: 0,
            pattern: Pattern::default(),
            handler,
            user_data: None,
        }
    }

    /// Sets the route prefix.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(normalize(prefix));
        self.recompile();
        self
    }

    /// Sets the route format.
    pub fn format(mut self, format: &str) -> Self {
        self.format = Some(normalize(format));
        self.recompile();
        self
    }

    /// Sets the priority. Lower values run first.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches user data.
    pub fn user_data(mut self, data: UserData) -> Self {
        self.user_data = Some(data);
        self
    }

    fn recompile(&mut self) {
        self.pattern = Pattern::new(self.prefix.as_deref(), self.format.as_deref());
    }

    /// Returns the method as registered.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the trimmed prefix, if any.
    pub fn prefix_str(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Returns the trimmed format, if any.
    pub fn format_str(&self) -> Option<&str> {
        self.format.as_deref()
    }

    /// Returns the priority.
    pub fn priority_value(&self) -> u32 {
        self.priority
    }

    /// Returns the compiled pattern.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Returns true if the route has a prefix or a format.
    pub fn has_pattern(&self) -> bool {
        self.prefix.is_some() || self.format.is_some()
    }

    /// Returns true if the route accepts `method`.
    pub fn matches_method(&self, method: &Method) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case(method.as_str())
    }

    /// Matches `path` against the route pattern.
    pub fn match_path(&self, path: &str) -> Option<Params> {
        self.pattern.matches(path)
    }

    /// Returns true if this route was registered with the same method,
    /// prefix and format. Separators at either end are ignored.
    pub fn same_endpoint(&self, method: &str, prefix: Option<&str>, format: Option<&str>) -> bool {
        self.method == method.trim()
            && self.prefix == prefix.map(normalize)
            && self.format == format.map(normalize)
    }
}

impl<H: ?Sized> fmt::Debug for Route<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("prefix", &self.prefix)
            .field("format", &self.format)
            .field("priority", &self.priority)
            .field("has_user_data", &self.user_data.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_is_case_insensitive() {
        let route = Route::new("post", Arc::new(0_u8)).format("/x");
        assert!(route.matches_method(&Method::POST));
        assert!(!route.matches_method(&Method::GET));
    }

    #[test]
    fn test_any_method() {
        let route = Route::new("*", Arc::new(0_u8)).format("/x");
        assert!(route.matches_method(&Method::DELETE));
        assert!(route.matches_method(&Method::from_bytes(b"PURGE").unwrap()));
    }

    #[test]
    fn test_prefix_and_format_are_trimmed() {
        let route = Route::new("GET", Arc::new(0_u8))
            .prefix("//api/")
            .format("/users/:id/");
        assert_eq!(route.prefix_str(), Some("api"));
        assert_eq!(route.format_str(), Some("users/:id"));
        assert!(route.same_endpoint("GET", Some("/api"), Some("users/:id/")));
        assert!(!route.same_endpoint("get", Some("api"), Some("users/:id")));
        assert!(!route.same_endpoint("GET", Some("api"), Some("users/:name")));
    }

    #[test]
    fn test_root_format_is_a_pattern() {
        let route = Route::new("GET", Arc::new(0_u8)).format("/");
        assert!(route.has_pattern());
        assert_eq!(route.format_str(), Some(""));
        assert!(route.same_endpoint("GET", None, Some("//")));
        assert!(!route.same_endpoint("GET", None, None));
        assert!(route.match_path("/").is_some());
    }

    #[test]
    fn test_user_data_is_kept() {
        let route = Route::new("GET", Arc::new(0_u8))
            .format("x")
            .user_data(Arc::new(String::from("ctx")));
        let data = route.user_data.as_ref().unwrap();
        assert_eq!(data.downcast_ref::<String>().unwrap(), "ctx");
    }
}
