//! Layered configuration loading.
//!
//! Layers, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML or JSON file
//! 3. Environment variables named `PREFIX__SECTION__KEY`

use std::env;
use std::fs;
use std::path::Path;

use portico_telemetry::LogFormat;

use crate::{ConfigError, PorticoConfig};

/// Configuration loader.
///
/// # Example
///
/// ```no_run
/// use portico_config::ConfigLoader;
///
/// # fn main() -> Result<(), portico_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_file("portico.toml")?
///     .with_env_prefix("PORTICO")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: PorticoConfig,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader starting from defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: PorticoConfig::default(),
            env_prefix: None,
        }
    }

    /// Start from the development preset.
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = PorticoConfig::development();
        self
    }

    /// Start from the production preset.
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = PorticoConfig::production();
        self
    }

    /// Load a `.toml` or `.json` file, chosen by extension.
    ///
    /// Sections missing from the file take their defaults.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::missing(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        self.config = Self::parse_file(&content, path)?;
        Ok(self)
    }

    /// Like [`with_file`](Self::with_file), but a missing file is not an error.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration text in the named format (`"toml"` or `"json"`).
    ///
    /// # Example
    ///
    /// ```
    /// use portico_config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string("[server]\nhttp_addr = \"127.0.0.1:3000\"\n", "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.server.http_addr, "127.0.0.1:3000");
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_lowercase().as_str() {
            "toml" => toml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        Ok(self)
    }

    /// Enable environment overrides with the given prefix.
    ///
    /// With prefix `PORTICO`, `PORTICO__WEBSOCKET__FRAGMENT_SIZE=4096`
    /// sets `websocket.fragment_size`. Unknown keys are ignored.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Apply environment overrides and validate.
    pub fn load(mut self) -> Result<PorticoConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }

        self.config.validate()?;
        Ok(self.config)
    }

    /// Return the configuration without env overrides or validation.
    #[must_use]
    pub fn load_unvalidated(self) -> PorticoConfig {
        self.config
    }

    fn parse_file(content: &str, path: &Path) -> Result<PorticoConfig, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        match extension.as_deref() {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();

        self.apply_env_vars(prefix, vars)
    }

    fn apply_env_vars(
        &mut self,
        prefix: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (key, value) in vars {
            self.apply_env_var(&key, &value, prefix)?;
        }
        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(rest) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix("__")) else {
            // shares the prefix but is not ours, e.g. PORTICO_HOME
            return Ok(());
        };

        let parts: Vec<&str> = rest.split("__").collect();
        let server = &mut self.config.server;
        let ws = &mut self.config.websocket;
        let logging = &mut self.config.logging;

        match parts.as_slice() {
            ["SERVER", "HTTP_ADDR"] => server.http_addr = value.to_string(),
            ["SERVER", "SHUTDOWN_TIMEOUT_SECS"] => {
                server.shutdown_timeout_secs = parse_int(key, value)?;
            }
            ["SERVER", "REQUEST_TIMEOUT_MS"] => server.request_timeout_ms = parse_int(key, value)?,
            ["SERVER", "MAX_BODY_BYTES"] => server.max_body_bytes = parse_int(key, value)?,
            ["SERVER", "DEFAULT_REALM"] => {
                server.default_realm = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }

            ["WEBSOCKET", "MAX_FRAME_SIZE"] => ws.max_frame_size = parse_int(key, value)?,
            ["WEBSOCKET", "MAX_MESSAGE_SIZE"] => ws.max_message_size = parse_int(key, value)?,
            ["WEBSOCKET", "FRAGMENT_SIZE"] => ws.fragment_size = parse_int(key, value)?,
            ["WEBSOCKET", "CLOSE_TIMEOUT_MS"] => ws.close_timeout_ms = parse_int(key, value)?,
            ["WEBSOCKET", "KEEP_INCOMING"] => ws.keep_incoming = parse_flag(key, value)?,
            ["WEBSOCKET", "KEEP_OUTGOING"] => ws.keep_outgoing = parse_flag(key, value)?,
            ["WEBSOCKET", "MAX_CONNECTIONS"] => ws.max_connections = parse_int(key, value)?,

            ["LOGGING", "ENABLED"] => logging.enabled = parse_flag(key, value)?,
            ["LOGGING", "LEVEL"] => logging.level = value.to_string(),
            ["LOGGING", "FORMAT"] => {
                logging.format = match value.to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    _ => {
                        return Err(ConfigError::env(
                            key,
                            "expected 'json' or 'pretty'",
                        ))
                    }
                };
            }
            ["LOGGING", "ANSI"] => logging.ansi = parse_flag(key, value)?,

            _ => {}
        }

        Ok(())
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env(key, "expected integer"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env(key, "expected boolean"))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
