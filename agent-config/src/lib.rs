//! Configuration for the agent:// transport layer.
//!
//! A [`TransportConfig`] is read from a JSON document, adjusted from
//! `AGENT_TRANSPORT_*` environment variables, validated, and finally split
//! into the per-binding configurations the transports take.
//!
//! ```no_run
//! use agent_config::TransportConfig;
//!
//! # fn main() -> agent_config::ConfigResult<()> {
//! let mut config = TransportConfig::load_from_path("transport.json")?;
//! config.apply_env_overrides()?;
//! let parts = config.into_parts()?;
//! assert_eq!(parts.https.protocol(), "https");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::pedantic)]

mod error;
pub mod loader;
pub mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::ENV_PREFIX;
pub use schema::{HttpsSection, LocalSection, TransportConfig, TransportParts, WebSocketSection};
