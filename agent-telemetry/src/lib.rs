//! Tracing subscriber setup shared by binaries and tests.
//!
//! Library crates only emit `tracing` events; installing a subscriber is left
//! to the process entry point through [`init_tracing`].

#![warn(missing_docs, clippy::pedantic)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable that overrides the configured filter.
pub const FILTER_ENV: &str = "RUST_LOG";

/// Output layout for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-field lines with timestamps and targets.
    #[default]
    Full,
    /// Shorter single-line output.
    Compact,
}

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. `info,agent_transport=debug`.
    pub default_directive: String,
    /// Line layout.
    pub format: LogFormat,
    /// Include the event target (module path).
    pub with_target: bool,
    /// Colour output.
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_owned(),
            format: LogFormat::Full,
            with_target: true,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fallback filter directive.
    #[must_use]
    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    /// Sets the line layout.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables or disables colour output.
    #[must_use]
    pub const fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }
}

/// Failures while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive does not parse.
    #[error("invalid log filter `{directive}`: {reason}")]
    InvalidDirective {
        /// The rejected directive.
        directive: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber was already set.
    #[error("tracing subscriber already installed: {reason}")]
    AlreadyInstalled {
        /// Underlying message.
        reason: String,
    },
}

/// Builds the filter: a valid `RUST_LOG` wins, otherwise the configured
/// directive is used.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidDirective`] if the configured directive
/// is used and does not parse.
pub fn build_filter(config: &TelemetryConfig, env: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    if let Some(filter) = env
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
    {
        return Ok(filter);
    }

    EnvFilter::try_new(&config.default_directive).map_err(|err| TelemetryError::InvalidDirective {
        directive: config.default_directive.clone(),
        reason: err.to_string(),
    })
}

/// Installs a global `fmt` subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidDirective`] for a bad filter and
/// [`TelemetryError::AlreadyInstalled`] when a subscriber is already set.
pub fn try_init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env = std::env::var(FILTER_ENV).ok();
    let filter = build_filter(config, env.as_deref())?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_ansi(config.ansi);

    let installed = match config.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|err| TelemetryError::AlreadyInstalled {
        reason: err.to_string(),
    })
}

/// Installs a global `fmt` subscriber, keeping any subscriber that is
/// already set.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidDirective`] for a bad filter.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    match try_init_tracing(config) {
        Err(TelemetryError::AlreadyInstalled { reason }) => {
            tracing::debug!(%reason, "keeping existing tracing subscriber");
            Ok(())
        }
        other => other,
    }
}
