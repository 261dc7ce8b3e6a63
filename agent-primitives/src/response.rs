//! Response model correlated to requests by id.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RequestId;

const DEFAULT_REMOTE_KIND: &str = "remote_error";

/// A single inbound response, routed to its request by `id` only.
#[derive(Clone, Debug, PartialEq)]
pub struct CapabilityResponse {
    id: RequestId,
    payload: ResponsePayload,
}

impl CapabilityResponse {
    /// Creates a response for the supplied correlation token.
    #[must_use]
    pub fn new(id: RequestId, payload: ResponsePayload) -> Self {
        Self { id, payload }
    }

    /// Returns the correlation token.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &ResponsePayload {
        &self.payload
    }

    /// Splits the response into its parts.
    #[must_use]
    pub fn into_parts(self) -> (RequestId, ResponsePayload) {
        (self.id, self.payload)
    }
}

/// What a response carries.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponsePayload {
    /// Terminal single result.
    Result(Value),
    /// One element of a streamed sequence.
    Chunk(Value),
    /// Terminal failure reported by the remote side.
    Error(RemoteError),
    /// Terminal end-of-sequence marker without payload.
    Complete,
}

impl ResponsePayload {
    /// Returns `true` when no further responses follow for the same id.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }
}

/// Failure reported by a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    kind: String,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
}

impl RemoteError {
    /// Creates a remote error with the supplied kind and message.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches the remote cause description.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Interprets an `error` member as sent by peers.
    ///
    /// Peers send either a bare message string or an object in one of the
    /// common shapes: JSON-RPC (`code`, `message`), RFC 7807 problem details
    /// (`type`, `title`, `detail`) or ad-hoc (`type`, `message`, `cause`).
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::new(DEFAULT_REMOTE_KIND, message.clone()),
            Value::Object(map) => {
                let kind = map
                    .get("type")
                    .or_else(|| map.get("name"))
                    .or_else(|| map.get("code"))
                    .map_or_else(|| DEFAULT_REMOTE_KIND.to_owned(), value_to_text);

                let message = map
                    .get("message")
                    .or_else(|| map.get("detail"))
                    .or_else(|| map.get("title"))
                    .map_or_else(|| value.to_string(), value_to_text);

                let mut error = Self::new(kind, message);
                if let Some(cause) = map.get("cause").filter(|cause| !cause.is_null()) {
                    error = error.with_cause(value_to_text(cause));
                }
                error
            }
            other => Self::new(DEFAULT_REMOTE_KIND, other.to_string()),
        }
    }

    /// Returns the error category reported by the peer.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the remote cause, if reported.
    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_chunks_are_non_terminal() {
        assert!(!ResponsePayload::Chunk(json!(1)).is_terminal());
        assert!(ResponsePayload::Result(json!(1)).is_terminal());
        assert!(ResponsePayload::Complete.is_terminal());
        assert!(ResponsePayload::Error(RemoteError::new("x", "y")).is_terminal());
    }

    #[test]
    fn parses_string_error() {
        let error = RemoteError::from_value(&json!("boom"));
        assert_eq!(error.kind(), "remote_error");
        assert_eq!(error.message(), "boom");
    }

    #[test]
    fn parses_json_rpc_error() {
        let error = RemoteError::from_value(&json!({"code": -32601, "message": "Method not found"}));
        assert_eq!(error.kind(), "-32601");
        assert_eq!(error.message(), "Method not found");
    }

    #[test]
    fn parses_problem_detail() {
        let error = RemoteError::from_value(&json!({
            "type": "https://agent-uri.org/errors/capability-not-found",
            "title": "Capability not found",
            "status": 404,
            "detail": "no capability named `missing`"
        }));
        assert_eq!(error.message(), "no capability named `missing`");
        assert!(error.kind().ends_with("capability-not-found"));
    }

    #[test]
    fn display_includes_cause() {
        let error = RemoteError::new("ValueError", "bad input").with_cause("parse failure");
        assert_eq!(error.to_string(), "ValueError: bad input (caused by: parse failure)");
    }
}
