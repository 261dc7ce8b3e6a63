//! Strongly typed configuration schema.
//!
//! Durations are expressed in milliseconds so documents stay plain JSON.
//! Every section falls back to the binding defaults when omitted.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use agent_transport::https::HttpsConfig;
use agent_transport::local::LocalConfig;
use agent_transport::websocket::WebSocketConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Schemes the default alias may point at.
const KNOWN_PROTOCOLS: &[&str] = &["https", "http", "wss", "ws", "local"];

/// Top-level transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Scheme the bare `agent` scheme resolves to.
    pub default_protocol: String,
    /// Request/response binding settings.
    pub https: HttpsSection,
    /// Persistent-connection binding settings.
    pub websocket: WebSocketSection,
    /// In-process binding settings.
    pub local: LocalSection,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_protocol: "https".to_owned(),
            https: HttpsSection::default(),
            websocket: WebSocketSection::default(),
            local: LocalSection::default(),
        }
    }
}

/// Settings for the HTTP(S) binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpsSection {
    /// Per-call timeout.
    pub timeout_ms: u64,
    /// Overrides the `User-Agent` header.
    pub user_agent: Option<String>,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for HttpsSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }
}

/// Settings for the WebSocket binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketSection {
    /// Bound on the opening handshake.
    pub connect_timeout_ms: u64,
    /// Wait for a result, or for each stream chunk.
    pub request_timeout_ms: u64,
    /// Close an idle connection once a stream completes.
    pub close_on_complete: bool,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 60_000,
            close_on_complete: true,
        }
    }
}

/// Settings for the local binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalSection {
    /// Bound on total execution time; unbounded when absent.
    pub timeout_ms: Option<u64>,
    /// Calls allowed to execute at once.
    pub max_concurrency: usize,
    /// Chunks a producer may run ahead of its consumer.
    pub stream_buffer: usize,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            max_concurrency: 32,
            stream_buffer: 16,
        }
    }
}

/// Per-binding configurations produced by [`TransportConfig::into_parts`].
#[derive(Debug, Clone)]
pub struct TransportParts {
    /// Scheme the `agent` alias points at.
    pub default_protocol: String,
    /// Configuration for the `https` binding.
    pub https: HttpsConfig,
    /// Configuration for the `wss` binding.
    pub websocket: WebSocketConfig,
    /// Configuration for the `local` binding.
    pub local: LocalConfig,
}

impl TransportConfig {
    /// Checks values the binding constructors would reject, so errors surface
    /// at load time with the offending key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad setting.
    pub fn validate(&self) -> ConfigResult<()> {
        let default = self.default_protocol.trim().to_ascii_lowercase();
        if !KNOWN_PROTOCOLS.contains(&default.as_str()) {
            return Err(ConfigError::invalid(format!(
                "default_protocol `{}` must be one of {}",
                self.default_protocol,
                KNOWN_PROTOCOLS.join(", ")
            )));
        }

        let positive = [
            ("https.timeout_ms", self.https.timeout_ms),
            ("websocket.connect_timeout_ms", self.websocket.connect_timeout_ms),
            ("websocket.request_timeout_ms", self.websocket.request_timeout_ms),
            ("local.timeout_ms", self.local.timeout_ms.unwrap_or(1)),
            ("local.max_concurrency", self.local.max_concurrency as u64),
            ("local.stream_buffer", self.local.stream_buffer as u64),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(format!("{key} must be greater than zero")));
        }

        if let Some(name) = self
            .https
            .headers
            .keys()
            .find(|name| name.trim().is_empty() || name.chars().any(char::is_whitespace))
        {
            return Err(ConfigError::invalid(format!("https header name `{name}` is invalid")));
        }
        Ok(())
    }

    /// Validates and converts into per-binding configurations.
    ///
    /// # Errors
    ///
    /// Same as [`TransportConfig::validate`].
    pub fn into_parts(self) -> ConfigResult<TransportParts> {
        self.validate()?;

        let mut https = HttpsConfig::new().with_timeout(Duration::from_millis(self.https.timeout_ms));
        if let Some(user_agent) = self.https.user_agent {
            https = https.with_user_agent(user_agent);
        }
        for (name, value) in self.https.headers {
            https = https.with_header(name, value);
        }

        let websocket = WebSocketConfig::new()
            .with_connect_timeout(Duration::from_millis(self.websocket.connect_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.websocket.request_timeout_ms))
            .with_close_on_complete(self.websocket.close_on_complete);

        let mut local = LocalConfig::new();
        if let Some(timeout) = self.local.timeout_ms {
            local = local.with_timeout(Duration::from_millis(timeout));
        }
        if let Some(limit) = NonZeroUsize::new(self.local.max_concurrency) {
            local = local.with_max_concurrency(limit);
        }
        if let Some(capacity) = NonZeroUsize::new(self.local.stream_buffer) {
            local = local.with_stream_buffer(capacity);
        }

        Ok(TransportParts {
            default_protocol: self.default_protocol.trim().to_ascii_lowercase(),
            https,
            websocket,
            local,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_binding_defaults() {
        let parts = TransportConfig::default().into_parts().unwrap();
        assert_eq!(parts.default_protocol, "https");
        assert_eq!(parts.https.timeout(), HttpsConfig::new().timeout());
        assert_eq!(
            parts.websocket.request_timeout(),
            WebSocketConfig::new().request_timeout()
        );
        assert!(parts.websocket.close_on_complete());
        assert_eq!(parts.local.timeout(), None);
        assert_eq!(parts.local.max_concurrency().get(), 32);
    }

    #[test]
    fn zero_values_are_rejected_with_their_key() {
        let mut config = TransportConfig::default();
        config.websocket.connect_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("websocket.connect_timeout_ms"));

        let mut config = TransportConfig::default();
        config.local.timeout_ms = Some(0);
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.local.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_default_protocol_is_rejected() {
        let config = TransportConfig {
            default_protocol: "gopher".into(),
            ..TransportConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn sections_flow_into_binding_configs() {
        let mut config = TransportConfig {
            default_protocol: "WSS".into(),
            ..TransportConfig::default()
        };
        config.https.user_agent = Some("probe/1.0".into());
        config.https.headers.insert("X-Tenant".into(), "acme".into());
        config.websocket.close_on_complete = false;
        config.local.timeout_ms = Some(250);

        let parts = config.into_parts().unwrap();
        assert_eq!(parts.default_protocol, "wss");
        assert_eq!(parts.https.headers().get("X-Tenant").map(String::as_str), Some("acme"));
        assert!(!parts.websocket.close_on_complete());
        assert_eq!(parts.local.timeout(), Some(Duration::from_millis(250)));
    }
}
