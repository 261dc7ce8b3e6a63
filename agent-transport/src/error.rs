//! Error taxonomy shared by every transport binding.

use std::time::Duration;

use agent_primitives::RemoteError;
use thiserror::Error;

/// Boxed error carried as the underlying cause of a transport failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the transport crate.
pub type TransportResult<T> = Result<T, TransportError>;

/// Coarse classification of a [`TransportError`], convenient for matching in
/// callers that do not care about the attached context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No transport is registered for the requested scheme.
    UnsupportedProtocol,
    /// The connection failed to open or was lost.
    Connection,
    /// The operation exceeded its deadline.
    TimedOut,
    /// The remote side or the local callable reported a failure.
    Invocation,
    /// A local capability path could not be resolved to a callable.
    Resolution,
    /// Parameters did not satisfy the callable's signature.
    Validation,
    /// The transport was misconfigured.
    Configuration,
}

/// Errors raised by transport bindings and the registry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No transport is registered for the scheme.
    #[error("unsupported transport protocol `{protocol}`")]
    UnsupportedProtocol {
        /// Scheme as supplied by the caller.
        protocol: String,
    },

    /// Connecting to the endpoint failed.
    #[error("connection error: {reason}")]
    Connection {
        /// Additional context for the failure.
        reason: String,
        /// Underlying I/O or handshake error.
        #[source]
        source: Option<BoxError>,
    },

    /// A live connection was closed while the request was outstanding.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Why the connection went away.
        reason: String,
    },

    /// The operation did not complete before its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    TimedOut {
        /// Operation that was waiting.
        operation: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The capability ran and reported a failure. The reason is the full
    /// message; constructors add no prefix of their own.
    #[error("{reason}")]
    Invocation {
        /// Human-readable description of the failure.
        reason: String,
        /// Structured error reported by the remote side, when available.
        remote: Option<RemoteError>,
        /// Underlying cause, when available.
        #[source]
        source: Option<BoxError>,
    },

    /// A local capability path did not resolve to a callable.
    #[error("cannot resolve `{path}`: {reason}")]
    Resolution {
        /// Fully qualified path that failed.
        path: String,
        /// Which stage failed and why.
        reason: String,
    },

    /// Parameters were rejected before execution.
    #[error("invalid parameters: {reason}")]
    Validation {
        /// Description of the offending parameter.
        reason: String,
    },

    /// The transport was configured with unusable values.
    #[error("transport not configured: {reason}")]
    Configuration {
        /// Additional context for the failure.
        reason: String,
    },
}

impl TransportError {
    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedProtocol { .. } => ErrorKind::UnsupportedProtocol,
            Self::Connection { .. } | Self::ConnectionClosed { .. } => ErrorKind::Connection,
            Self::TimedOut { .. } => ErrorKind::TimedOut,
            Self::Invocation { .. } => ErrorKind::Invocation,
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Convenience constructor for unsupported schemes.
    #[must_use]
    pub fn unsupported(protocol: impl Into<String>) -> Self {
        Self::UnsupportedProtocol {
            protocol: protocol.into(),
        }
    }

    /// Convenience constructor for connection failures without an underlying cause.
    #[must_use]
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
            source: None,
        }
    }

    /// Convenience constructor for connection failures caused by another error.
    #[must_use]
    pub fn connection_with(reason: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Connection {
            reason: reason.into(),
            source: Some(source.into()),
        }
    }

    /// Convenience constructor for a connection lost mid-request.
    #[must_use]
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for elapsed deadlines.
    #[must_use]
    pub fn timed_out(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::TimedOut {
            operation: operation.into(),
            timeout,
        }
    }

    /// Convenience constructor for invocation failures.
    #[must_use]
    pub fn invocation(reason: impl Into<String>) -> Self {
        Self::Invocation {
            reason: reason.into(),
            remote: None,
            source: None,
        }
    }

    /// Convenience constructor for invocation failures caused by another error.
    #[must_use]
    pub fn invocation_with(reason: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Invocation {
            reason: reason.into(),
            remote: None,
            source: Some(source.into()),
        }
    }

    /// Wraps a structured error reported by the remote side.
    #[must_use]
    pub fn remote(error: RemoteError) -> Self {
        Self::Invocation {
            reason: format!("remote error: {error}"),
            remote: Some(error),
            source: None,
        }
    }

    /// Convenience constructor for resolution failures.
    #[must_use]
    pub fn resolution(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Convenience constructor for rejected parameters.
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for configuration issues.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns the structured remote error, if the failure carried one.
    #[must_use]
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Self::Invocation { remote, .. } => remote.as_ref(),
            _ => None,
        }
    }
}

impl From<agent_primitives::Error> for TransportError {
    fn from(error: agent_primitives::Error) -> Self {
        Self::validation(error.to_string())
    }
}
