//! Core shared types for the `agent://` transport layer.

#![warn(missing_docs, clippy::pedantic)]

mod capability;
mod error;
mod ids;
mod request;
mod response;

/// Validated capability names.
pub use capability::CapabilityName;
/// Error type and result alias shared across the primitives.
pub use error::{Error, Result};
/// Correlation tokens linking requests to their responses.
pub use ids::RequestId;
/// Per-call request model and its builder.
pub use request::{CapabilityRequest, CapabilityRequestBuilder, Headers, Params};
/// Response model correlated back to a request.
pub use response::{CapabilityResponse, RemoteError, ResponsePayload};
