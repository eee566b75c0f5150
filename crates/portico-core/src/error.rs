//! Error types for request parsing and response building.
//!
//! Handler outcomes are never errors: a handler reports failure through
//! [`Signal::Error`](crate::Signal::Error). The errors here come from the
//! helpers a handler calls while reading the request or filling the
//! response.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the request and response helpers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The query string could not be decoded.
    #[error("invalid query string: {0}")]
    InvalidQuery(String),

    /// A form body could not be decoded.
    #[error("invalid form body: {0}")]
    InvalidForm(String),

    /// A JSON body could not be decoded or encoded.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A header name or value was not valid HTTP.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl CoreError {
    /// Create a new invalid header error.
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        Self::InvalidHeader(reason.into())
    }
}

impl From<http::header::InvalidHeaderValue> for CoreError {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader(e.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for CoreError {
    fn from(e: http::header::InvalidHeaderName) -> Self {
        Self::InvalidHeader(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::invalid_header("bad");
        assert_eq!(err.to_string(), "invalid header: bad");

        let err: CoreError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(err.to_string().starts_with("invalid JSON"));
    }
}
