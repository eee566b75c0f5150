//! Configuration errors.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Why a configuration could not be loaded, parsed or validated.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required file does not exist.
    #[error("config file {} does not exist", path.display())]
    Missing {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// A file exists but could not be read.
    #[error("cannot read config file {}", path.display())]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error.
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON syntax or schema error.
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration could not be rendered back to TOML.
    #[error("cannot render config as TOML: {0}")]
    Render(#[from] toml::ser::Error),

    /// Neither `toml` nor `json`.
    #[error("unsupported config format `{0}`")]
    UnsupportedFormat(String),

    /// A value parsed but is out of range.
    #[error("{field}: {reason}")]
    Invalid {
        /// Dotted path of the offending key, e.g. `server.http_addr`.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An environment override could not be parsed.
    #[error("environment variable {var}: {reason}")]
    Env {
        /// Full variable name.
        var: String,
        /// Expected shape of the value.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn missing(path: &Path) -> Self {
        Self::Missing {
            path: path.to_path_buf(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Builds a validation failure for `field`.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn env(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Env {
            var: var.into(),
            reason: reason.into(),
        }
    }
}
