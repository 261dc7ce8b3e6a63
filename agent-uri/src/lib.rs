//! Transport layer for `agent://` capabilities.
//!
//! Depend on this crate to get the transport contract, every binding enabled
//! by cargo features, and a ready-made [`default_registry`]. Callers that need
//! explicit wiring build their own [`TransportRegistry`], or one from
//! configuration with [`registry_from_config`].
//!
//! ```no_run
//! use agent_uri::{AgentTransport, InvokeOptions, Params, default_registry};
//!
//! # async fn run() -> agent_uri::TransportResult<()> {
//! let transport = default_registry().get("agent+wss")?;
//! let reply = transport
//!     .invoke("wss://agents.example.com/ws", "summarize", Params::new(), InvokeOptions::new())
//!     .await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::pedantic)]

use std::sync::OnceLock;
#[cfg(feature = "local")]
use std::sync::Arc;

/// Shared wire-level types.
pub use agent_primitives as primitives;
/// The transport contract, registry and bindings.
pub use agent_transport as transport;

/// Configuration schema and loader (enabled by the `config` feature).
#[cfg(feature = "config")]
pub use agent_config as config;

/// Tracing subscriber setup (enabled by the `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use agent_telemetry as telemetry;

pub use agent_transport::{
    AgentTransport, ChunkStream, ErrorKind, HttpMethod, InvokeOptions, Params, StreamOptions,
    TransportError, TransportFactory, TransportRegistry, TransportResult,
};

#[cfg(feature = "https")]
use agent_transport::https::{HttpsConfig, HttpsTransport};
#[cfg(feature = "local")]
use agent_transport::local::{LocalConfig, LocalTransport, ModuleCatalog};
#[cfg(feature = "websocket")]
use agent_transport::websocket::{WebSocketConfig, WebSocketTransport};

static DEFAULT_REGISTRY: OnceLock<TransportRegistry> = OnceLock::new();

#[cfg(feature = "local")]
static LOCAL_CATALOG: OnceLock<Arc<ModuleCatalog>> = OnceLock::new();

/// Process-wide registry holding every enabled binding with default settings:
/// `https`, `http`, `wss`, `ws` and `local`, with `agent` aliasing `https`.
///
/// The registry is built on first use. Transports never consult it themselves;
/// it exists for callers that do not want to wire one up.
pub fn default_registry() -> &'static TransportRegistry {
    DEFAULT_REGISTRY.get_or_init(|| {
        let registry = TransportRegistry::new();
        Bindings::default().register(&registry);
        tracing::debug!(
            protocols = ?registry.list_supported_protocols(),
            "default transport registry initialised"
        );
        registry
    })
}

/// Module catalog behind the `local` transports of [`default_registry`] and
/// of registries built by [`registry_from_config`].
#[cfg(feature = "local")]
pub fn local_catalog() -> &'static Arc<ModuleCatalog> {
    LOCAL_CATALOG.get_or_init(|| Arc::new(ModuleCatalog::new()))
}

/// Builds a registry from validated configuration. The `agent` alias points
/// at the configured default protocol.
///
/// # Errors
///
/// Returns the validation error of [`config::TransportConfig::into_parts`].
#[cfg(feature = "config")]
pub fn registry_from_config(
    config: &agent_config::TransportConfig,
) -> agent_config::ConfigResult<TransportRegistry> {
    let parts = config.clone().into_parts()?;
    let registry = TransportRegistry::new();
    Bindings {
        https: parts.https,
        websocket: parts.websocket,
        local: parts.local,
    }
    .register(&registry);
    registry.set_alias("agent", &parts.default_protocol);
    Ok(registry)
}

/// Per-binding settings for the schemes a registry serves.
#[derive(Default)]
struct Bindings {
    #[cfg(feature = "https")]
    https: HttpsConfig,
    #[cfg(feature = "websocket")]
    websocket: WebSocketConfig,
    #[cfg(feature = "local")]
    local: LocalConfig,
}

impl Bindings {
    fn register(self, registry: &TransportRegistry) {
        #[cfg(feature = "https")]
        {
            let https = self.https;
            registry.register(HttpsTransport::factory(https.clone().with_protocol("http")));
            registry.register(HttpsTransport::factory(https.with_protocol("https")));
        }
        #[cfg(feature = "websocket")]
        {
            let websocket = self.websocket;
            registry.register(WebSocketTransport::factory(websocket.clone().with_protocol("ws")));
            registry.register(WebSocketTransport::factory(websocket.with_protocol("wss")));
        }
        #[cfg(feature = "local")]
        registry.register(LocalTransport::factory(
            self.local.with_protocol("local"),
            Arc::clone(local_catalog()),
        ));
    }
}

#[cfg(all(test, feature = "https", feature = "websocket", feature = "local"))]
mod tests {
    use agent_transport::local::{Callable, Module, ParamKind, Signature};
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn default_registry_serves_every_binding() {
        let protocols = default_registry().list_supported_protocols();
        assert_eq!(protocols, vec!["agent", "http", "https", "local", "ws", "wss"]);
        assert_eq!(default_registry().get("agent").unwrap().protocol(), "https");
        assert_eq!(default_registry().get("AGENT+WSS").unwrap().protocol(), "wss");
        assert_eq!(default_registry().get("http").unwrap().protocol(), "http");
    }

    #[test]
    fn default_registry_is_shared() {
        let first = default_registry().get("ws").unwrap();
        let second = default_registry().get("ws").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn local_catalog_feeds_default_registry() {
        local_catalog().register_module(
            "facade_test",
            Module::new().with_callable(
                "shout",
                Callable::plain(Signature::new().required("text", ParamKind::String), |args| {
                    Ok(Value::String(args.get::<String>("text")?.to_uppercase()))
                }),
            ),
        );

        let transport = default_registry().get("agent+local").unwrap();
        let mut params = Params::new();
        params.insert("text".into(), json!("hi"));
        let reply = transport
            .invoke("agent+local://facade_test", "shout", params, InvokeOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, json!("HI"));
    }

    #[cfg(feature = "config")]
    #[test]
    fn config_selects_default_alias() {
        let config =
            agent_config::TransportConfig::from_json_str(r#"{"default_protocol": "local"}"#).unwrap();
        let registry = registry_from_config(&config).unwrap();
        assert_eq!(registry.get("agent").unwrap().protocol(), "local");
        assert!(registry.is_supported("wss"));
    }
}
