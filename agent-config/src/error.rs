use std::path::PathBuf;

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating transport configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration from {}: {source}", path.display())]
    Io {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON for the schema.
    #[error("malformed configuration: {source}")]
    Parse {
        /// Underlying parse failure.
        #[from]
        source: serde_json::Error,
    },

    /// An environment override could not be parsed.
    #[error("environment variable {key}={value:?} is invalid: {reason}")]
    InvalidEnv {
        /// Full variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration is well-formed but inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Which setting is wrong.
        reason: String,
    },
}

impl ConfigError {
    /// Convenience constructor for [`ConfigError::Invalid`].
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}
