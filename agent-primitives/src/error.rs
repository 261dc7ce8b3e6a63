//! Shared error definitions for transport primitives.

use thiserror::Error;

/// Result alias used throughout the primitives crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building primitive transport types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Capability name failed validation.
    #[error("invalid capability name `{name}`: {reason}")]
    InvalidCapabilityName {
        /// The offending name.
        name: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Request definition failed validation.
    #[error("invalid capability request: {reason}")]
    InvalidRequest {
        /// Human-readable reason for rejection.
        reason: String,
    },
}
