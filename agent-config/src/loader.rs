//! Loading configuration from JSON documents and the environment.
//!
//! Precedence, lowest to highest: built-in defaults, the JSON document, then
//! `AGENT_TRANSPORT_*` variables.

use std::path::Path;
use std::str::FromStr;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::schema::TransportConfig;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "AGENT_TRANSPORT_";

impl TransportConfig {
    /// Parses and validates a JSON document. Omitted keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown keys, and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn from_json_str(document: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise the
    /// errors of [`TransportConfig::from_json_str`].
    pub fn load_from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded transport configuration");
        Self::from_json_str(&document)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// See [`TransportConfig::apply_env_overrides_with`].
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_env_overrides_with(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`, which receives full variable
    /// names such as `AGENT_TRANSPORT_HTTPS_TIMEOUT_MS`. Recognised suffixes:
    /// `DEFAULT_PROTOCOL`, `HTTPS_TIMEOUT_MS`, `WEBSOCKET_TIMEOUT_MS`,
    /// `WEBSOCKET_CONNECT_TIMEOUT_MS`, `WEBSOCKET_CLOSE_ON_COMPLETE`,
    /// `LOCAL_TIMEOUT_MS` and `LOCAL_MAX_CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for values that do not parse, and
    /// [`ConfigError::Invalid`] if the result fails validation.
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };

        if let Some(protocol) = env.raw("DEFAULT_PROTOCOL") {
            self.default_protocol = protocol;
        }
        if let Some(ms) = env.parsed("HTTPS_TIMEOUT_MS")? {
            self.https.timeout_ms = ms;
        }
        if let Some(ms) = env.parsed("WEBSOCKET_TIMEOUT_MS")? {
            self.websocket.request_timeout_ms = ms;
        }
        if let Some(ms) = env.parsed("WEBSOCKET_CONNECT_TIMEOUT_MS")? {
            self.websocket.connect_timeout_ms = ms;
        }
        if let Some(close) = env.flag("WEBSOCKET_CLOSE_ON_COMPLETE")? {
            self.websocket.close_on_complete = close;
        }
        if let Some(ms) = env.parsed("LOCAL_TIMEOUT_MS")? {
            self.local.timeout_ms = Some(ms);
        }
        if let Some(limit) = env.parsed("LOCAL_MAX_CONCURRENCY")? {
            self.local.max_concurrency = limit;
        }

        self.validate()
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, suffix: &str) -> Option<String> {
        let key = format!("{ENV_PREFIX}{suffix}");
        let value = (self.lookup)(&key)?;
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        debug!(%key, "environment override applied");
        Some(value.to_owned())
    }

    fn parsed<T>(&self, suffix: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(suffix)
            .map(|value| {
                value.parse::<T>().map_err(|err| ConfigError::InvalidEnv {
                    key: format!("{ENV_PREFIX}{suffix}"),
                    reason: err.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn flag(&self, suffix: &str) -> ConfigResult<Option<bool>> {
        self.raw(suffix)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidEnv {
                    key: format!("{ENV_PREFIX}{suffix}"),
                    value,
                    reason: "expected a boolean".into(),
                }),
            })
            .transpose()
    }
}
