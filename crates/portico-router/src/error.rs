//! Registry error types.

use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised when registering or removing routes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The route's method is empty.
    #[error("route method must not be empty")]
    EmptyMethod,

    /// The route has neither a prefix nor a format.
    #[error("route for method {method} needs a prefix or a format")]
    MissingPattern {
        /// The method of the rejected route
        method: String,
    },

    /// No registered route matched the removal request.
    #[error("no route registered for {method} {prefix}/{format}")]
    NotFound {
        /// Requested method
        method: String,
        /// Requested prefix
        prefix: String,
        /// Requested format
        format: String,
    },
}

impl RegistryError {
    /// Returns true if this is the "not found" outcome of a removal.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct() {
        let err = RegistryError::NotFound {
            method: "GET".into(),
            prefix: "api".into(),
            format: "users".into(),
        };
        assert!(err.is_not_found());
        assert!(!RegistryError::EmptyMethod.is_not_found());
        assert_eq!(err.to_string(), "no route registered for GET api/users");
    }
}
