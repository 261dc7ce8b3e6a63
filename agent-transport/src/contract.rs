//! The uniform contract every binding implements.

use std::num::NonZeroUsize;
use std::pin::Pin;
use std::time::Duration;

use agent_primitives::{Headers, Params};
use async_trait::async_trait;
use futures::Stream;
use serde_json::{Map, Value};

use crate::error::TransportResult;

/// Ordered, lazily produced sequence of chunks returned by [`AgentTransport::stream`].
///
/// The stream ends after the last chunk on clean completion. A failure is
/// yielded as a final `Err` item; no items follow it. Dropping the stream
/// abandons the call and releases every resource held for it.
pub type ChunkStream = Pin<Box<dyn Stream<Item = TransportResult<Value>> + Send>>;

/// HTTP method used by request/response bindings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpMethod {
    /// Parameters travel as a JSON body.
    #[default]
    Post,
    /// Parameters travel as query string pairs.
    Get,
}

impl HttpMethod {
    /// Returns the method as an uppercase token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Get => "GET",
        }
    }
}

/// Per-call options for [`AgentTransport::invoke`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    headers: Headers,
    timeout: Option<Duration>,
    method: HttpMethod,
    json_rpc: bool,
    message_format: Map<String, Value>,
}

impl InvokeOptions {
    /// Creates empty options; every binding falls back to its configured defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header sent with the request (or the connection handshake).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces all headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Bounds the wait for the result.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Selects the HTTP method; ignored by non-HTTP bindings.
    #[must_use]
    pub const fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Frames WebSocket requests as JSON-RPC 2.0.
    #[must_use]
    pub const fn with_json_rpc(mut self, enabled: bool) -> Self {
        self.json_rpc = enabled;
        self
    }

    /// Extra members merged into WebSocket request frames. They never replace
    /// the correlation id or the capability fields.
    #[must_use]
    pub fn with_message_format(mut self, fields: Map<String, Value>) -> Self {
        self.message_format = fields;
        self
    }

    /// Returns the request headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the caller-supplied timeout, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the HTTP method.
    #[must_use]
    pub const fn method(&self) -> HttpMethod {
        self.method
    }

    /// Returns `true` when JSON-RPC framing is requested.
    #[must_use]
    pub const fn json_rpc(&self) -> bool {
        self.json_rpc
    }

    /// Returns the extra frame members.
    #[must_use]
    pub fn message_format(&self) -> &Map<String, Value> {
        &self.message_format
    }
}

/// Per-call options for [`AgentTransport::stream`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    headers: Headers,
    timeout: Option<Duration>,
    method: HttpMethod,
    json_rpc: bool,
    message_format: Map<String, Value>,
    close_on_complete: Option<bool>,
    buffer: Option<NonZeroUsize>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            headers: Headers::new(),
            timeout: None,
            method: HttpMethod::Post,
            json_rpc: false,
            message_format: Map::new(),
            close_on_complete: None,
            buffer: None,
        }
    }
}

impl StreamOptions {
    /// Creates empty options; every binding falls back to its configured defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header sent with the request (or the connection handshake).
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces all headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Bounds the wait for each chunk (idle timeout) or, for local calls, the
    /// whole stream.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Selects the HTTP method; ignored by non-HTTP bindings.
    #[must_use]
    pub const fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Frames WebSocket requests as JSON-RPC 2.0.
    #[must_use]
    pub const fn with_json_rpc(mut self, enabled: bool) -> Self {
        self.json_rpc = enabled;
        self
    }

    /// Extra members merged into WebSocket request frames.
    #[must_use]
    pub fn with_message_format(mut self, fields: Map<String, Value>) -> Self {
        self.message_format = fields;
        self
    }

    /// Closes a persistent connection once this stream completes, provided no
    /// other request is still using it. Overrides the binding default.
    #[must_use]
    pub const fn with_close_on_complete(mut self, close: bool) -> Self {
        self.close_on_complete = Some(close);
        self
    }

    /// Bounds the number of undelivered chunks held for this stream. Unbounded
    /// when unset.
    #[must_use]
    pub const fn with_buffer(mut self, capacity: NonZeroUsize) -> Self {
        self.buffer = Some(capacity);
        self
    }

    /// Returns the request headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the caller-supplied timeout, if any.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the HTTP method.
    #[must_use]
    pub const fn method(&self) -> HttpMethod {
        self.method
    }

    /// Returns `true` when JSON-RPC framing is requested.
    #[must_use]
    pub const fn json_rpc(&self) -> bool {
        self.json_rpc
    }

    /// Returns the extra frame members.
    #[must_use]
    pub fn message_format(&self) -> &Map<String, Value> {
        &self.message_format
    }

    /// Returns the caller override for closing after completion.
    #[must_use]
    pub const fn close_on_complete(&self) -> Option<bool> {
        self.close_on_complete
    }

    /// Returns the chunk buffer capacity, if bounded.
    #[must_use]
    pub const fn buffer(&self) -> Option<NonZeroUsize> {
        self.buffer
    }
}

/// A binding that carries capability calls over one transport family.
///
/// Implementations are shared behind `Arc` by the registry and must tolerate
/// concurrent calls from many tasks.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Scheme this binding serves, e.g. `https`, `wss` or `local`.
    fn protocol(&self) -> &str;

    /// Invokes `capability` at `endpoint` and waits for its single result.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`](crate::TransportError) when the endpoint is
    /// unreachable, the call exceeds its timeout, the parameters are rejected,
    /// or the capability itself reports a failure.
    async fn invoke(
        &self,
        endpoint: &str,
        capability: &str,
        params: Params,
        options: InvokeOptions,
    ) -> TransportResult<Value>;

    /// Starts a streaming call and returns its chunk sequence.
    ///
    /// Failures to start the call surface here; failures after the first chunk
    /// surface as the final item of the returned stream.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`](crate::TransportError) when the call could not
    /// be started.
    async fn stream(
        &self,
        endpoint: &str,
        capability: &str,
        params: Params,
        options: StreamOptions,
    ) -> TransportResult<ChunkStream>;

    /// Releases long-lived resources such as open connections. Outstanding
    /// calls fail with a connection-closed error.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_options_default_to_binding_behaviour() {
        let options = StreamOptions::new();
        assert_eq!(options.close_on_complete(), None);
        assert_eq!(options.buffer(), None);
        assert_eq!(options.method(), HttpMethod::Post);
    }

    #[test]
    fn later_headers_replace_earlier_ones() {
        let options = InvokeOptions::new()
            .with_header("x-trace", "a")
            .with_header("x-trace", "b");
        assert_eq!(options.headers().get("x-trace").map(String::as_str), Some("b"));
    }
}
