//! Transport binding layer for the `agent://` protocol.
//!
//! A caller obtains an [`AgentTransport`] from a [`TransportRegistry`] using the
//! scheme chosen by the resolver, then either invokes a capability for a single
//! result or streams an ordered sequence of chunks. Three bindings ship with the
//! crate:
//!
//! - [`https`]: stateless request/response over HTTP(S), with event-stream
//!   decoding for streaming calls.
//! - [`websocket`]: one persistent connection per transport, multiplexing
//!   concurrent calls by correlation id.
//! - [`local`]: in-process dispatch to callables resolved from dotted paths.
//!
//! Each binding sits behind a cargo feature of the same name; all three are
//! enabled by default.

#![warn(missing_docs, clippy::pedantic)]

mod contract;
mod error;
#[cfg(feature = "https")]
pub mod https;
#[cfg(feature = "local")]
pub mod local;
pub mod registry;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use contract::{AgentTransport, ChunkStream, HttpMethod, InvokeOptions, StreamOptions};
pub use error::{ErrorKind, TransportError, TransportResult};
pub use registry::{TransportFactory, TransportRegistry, factory_fn};

pub use agent_primitives::{Headers, Params, RequestId};
