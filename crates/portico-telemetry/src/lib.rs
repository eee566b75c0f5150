//! Logging bootstrap for Portico services.
//!
//! Portico crates emit `tracing` events; this crate installs the
//! subscriber that formats them.
//!
//! ```rust,ignore
//! use portico_telemetry::{init_logging, LogConfig};
//!
//! fn main() -> Result<(), portico_telemetry::TelemetryError> {
//!     init_logging(&LogConfig::production())?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/portico-telemetry/0.1.0")]

pub mod error;
pub mod logging;

pub use error::TelemetryError;
pub use logging::{create_env_filter, init_logging, LogConfig, LogFormat};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
