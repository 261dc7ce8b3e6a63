//! Stateless request/response binding over HTTP(S).
//!
//! Each call is an independent HTTP exchange: parameters travel as a JSON body
//! (`POST`) or query pairs (`GET`) to `<endpoint>/<capability>`. Streaming calls
//! ask for `text/event-stream` and decode server-sent events into chunks; a
//! plain JSON response is delivered as a single chunk, or one chunk per element
//! when the body is an array.

mod client;
mod event_stream;

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use agent_primitives::{CapabilityName, Headers, Params, RemoteError};
use async_trait::async_trait;
use futures::stream;
use hyper::body::{HttpBody, to_bytes};
use hyper::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use hyper::{Body, Request, StatusCode, Uri};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use self::client::{HyperClient, build_client};
use self::event_stream::{EventSignal, EventStreamDecoder, ServerEvent, interpret};
use crate::contract::{AgentTransport, ChunkStream, HttpMethod, InvokeOptions, StreamOptions};
use crate::error::{TransportError, TransportResult};
use crate::registry::{TransportFactory, factory_fn};

const APPLICATION_JSON: &str = "application/json";
const EVENT_STREAM: &str = "text/event-stream";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`HttpsTransport`].
#[derive(Clone, Debug)]
pub struct HttpsConfig {
    protocol: String,
    timeout: Duration,
    headers: Headers,
    user_agent: String,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            protocol: "https".to_owned(),
            timeout: DEFAULT_TIMEOUT,
            headers: Headers::new(),
            user_agent: concat!("agent-transport/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl HttpsConfig {
    /// Creates the default configuration: scheme `https`, 30 second timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scheme the transport registers under (`https` or `http`).
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Sets the default per-request timeout. For streams it bounds the wait for
    /// each chunk.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a header sent with every request. Per-call headers win on conflict.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Overrides the `User-Agent` header.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Returns the scheme.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns the default timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the default headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// HTTP(S) binding of the transport contract.
pub struct HttpsTransport {
    config: HttpsConfig,
    client: HyperClient,
}

impl fmt::Debug for HttpsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpsTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpsTransport {
    /// Builds a transport with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] if the timeout is zero or the
    /// scheme is not `http` or `https`.
    pub fn new(config: HttpsConfig) -> TransportResult<Self> {
        if config.timeout.is_zero() {
            return Err(TransportError::configuration(
                "HTTP timeout must be greater than zero",
            ));
        }
        if !matches!(config.protocol.as_str(), "http" | "https") {
            return Err(TransportError::configuration(format!(
                "HTTP transport cannot serve scheme `{}`",
                config.protocol
            )));
        }

        Ok(Self {
            config,
            client: build_client(),
        })
    }

    /// Returns a registry factory that builds transports from `config`.
    #[must_use]
    pub fn factory(config: HttpsConfig) -> impl TransportFactory + 'static {
        factory_fn(config.protocol.clone(), move || {
            Ok(Arc::new(Self::new(config.clone())?) as Arc<dyn AgentTransport>)
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &HttpsConfig {
        &self.config
    }

    fn build_request(
        &self,
        endpoint: &str,
        capability: &CapabilityName,
        params: &Params,
        method: HttpMethod,
        headers: &Headers,
        accept: &str,
    ) -> TransportResult<Request<Body>> {
        let uri = capability_uri(endpoint, capability.as_str(), method, params)?;

        let mut builder = Request::builder()
            .method(method.as_str())
            .uri(uri)
            .header(ACCEPT, accept)
            .header(USER_AGENT, self.config.user_agent.as_str());

        let mut merged = self.config.headers.clone();
        merged.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (name, value) in &merged {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let body = match method {
            HttpMethod::Post => {
                builder = builder.header(CONTENT_TYPE, APPLICATION_JSON);
                let encoded = serde_json::to_vec(params).map_err(|err| {
                    TransportError::validation(format!("parameters are not encodable: {err}"))
                })?;
                Body::from(encoded)
            }
            HttpMethod::Get => Body::empty(),
        };

        builder
            .body(body)
            .map_err(|err| TransportError::validation(format!("invalid request: {err}")))
    }
}

#[async_trait]
impl AgentTransport for HttpsTransport {
    fn protocol(&self) -> &str {
        &self.config.protocol
    }

    async fn invoke(
        &self,
        endpoint: &str,
        capability: &str,
        params: Params,
        options: InvokeOptions,
    ) -> TransportResult<Value> {
        let capability = CapabilityName::new(capability)?;
        let request = self.build_request(
            endpoint,
            &capability,
            &params,
            options.method(),
            options.headers(),
            APPLICATION_JSON,
        )?;
        let limit = options.timeout().unwrap_or(self.config.timeout);

        debug!(
            endpoint,
            capability = %capability,
            method = options.method().as_str(),
            "sending capability request"
        );

        let exchange = async {
            let response = self.client.request(request).await.map_err(|err| {
                TransportError::connection_with(format!("request to {endpoint} failed"), err)
            })?;
            let status = response.status();
            let bytes = to_bytes(response.into_body()).await.map_err(|err| {
                TransportError::connection_with("failed to read response body", err)
            })?;
            Ok::<_, TransportError>((status, bytes))
        };

        let (status, bytes) = timeout(limit, exchange)
            .await
            .map_err(|_| TransportError::timed_out(format!("invoke `{capability}`"), limit))??;

        if !status.is_success() {
            let err = describe_failure(status, &bytes);
            warn!(endpoint, capability = %capability, %status, "capability request rejected");
            return Err(err);
        }

        decode_body(&bytes)
    }

    async fn stream(
        &self,
        endpoint: &str,
        capability: &str,
        params: Params,
        options: StreamOptions,
    ) -> TransportResult<ChunkStream> {
        let capability = CapabilityName::new(capability)?;
        let request = self.build_request(
            endpoint,
            &capability,
            &params,
            options.method(),
            options.headers(),
            "text/event-stream, application/json",
        )?;
        let idle = options.timeout().unwrap_or(self.config.timeout);
        let label = format!("stream `{capability}`");

        debug!(endpoint, capability = %capability, "opening capability stream");

        let response = timeout(idle, self.client.request(request))
            .await
            .map_err(|_| TransportError::timed_out(label.clone(), idle))?
            .map_err(|err| {
                TransportError::connection_with(format!("request to {endpoint} failed"), err)
            })?;

        let status = response.status();
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with(EVENT_STREAM));

        if status.is_success() && is_event_stream {
            return Ok(event_stream(response.into_body(), idle, label));
        }

        let bytes = timeout(idle, to_bytes(response.into_body()))
            .await
            .map_err(|_| TransportError::timed_out(label, idle))?
            .map_err(|err| TransportError::connection_with("failed to read response body", err))?;

        if !status.is_success() {
            return Err(describe_failure(status, &bytes));
        }

        let chunks = match decode_body(&bytes)? {
            Value::Array(items) => items,
            other => vec![other],
        };
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

struct EventStreamState {
    body: Body,
    decoder: EventStreamDecoder,
    ready: VecDeque<ServerEvent>,
    idle: Duration,
    label: String,
    exhausted: bool,
}

fn event_stream(body: Body, idle: Duration, label: String) -> ChunkStream {
    let state = EventStreamState {
        body,
        decoder: EventStreamDecoder::new(),
        ready: VecDeque::new(),
        idle,
        label,
        exhausted: false,
    };

    let chunks = stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if let Some(event) = state.ready.pop_front() {
                trace!(id = event.id(), event = event.event(), "server event");
                match interpret(&event) {
                    EventSignal::Chunk(chunk) => return Some((Ok(chunk), Some(state))),
                    EventSignal::Failed(err) => return Some((Err(err), None)),
                    EventSignal::Done => return None,
                    EventSignal::Skip => continue,
                }
            }
            if state.exhausted {
                return None;
            }

            match timeout(state.idle, state.body.data()).await {
                Err(_) => {
                    let err = TransportError::timed_out(state.label.clone(), state.idle);
                    return Some((Err(err), None));
                }
                Ok(None) => {
                    state.exhausted = true;
                    state.ready.extend(state.decoder.finish());
                }
                Ok(Some(Err(err))) => {
                    let err = TransportError::connection_with("event stream interrupted", err);
                    return Some((Err(err), None));
                }
                Ok(Some(Ok(bytes))) => {
                    let events = state.decoder.push(&bytes);
                    state.ready.extend(events);
                }
            }
        }
    });

    Box::pin(chunks)
}

/// Joins the capability onto the endpoint path and, for `GET`, appends the
/// parameters as query pairs.
fn capability_uri(
    endpoint: &str,
    capability: &str,
    method: HttpMethod,
    params: &Params,
) -> TransportResult<Uri> {
    let endpoint = endpoint.trim();
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(TransportError::configuration(format!(
            "endpoint `{endpoint}` must start with http:// or https://"
        )));
    }

    let (base, existing_query) = match endpoint.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (endpoint, None),
    };
    let base = base.trim_end_matches('/');
    let capability = capability.trim_start_matches('/');
    let mut url = if base
        .strip_suffix(capability)
        .is_some_and(|rest| rest.ends_with('/') && !rest.ends_with("//"))
    {
        base.to_owned()
    } else {
        format!("{base}/{capability}")
    };

    let mut query: Vec<String> = existing_query
        .filter(|q| !q.is_empty())
        .map(str::to_owned)
        .into_iter()
        .collect();
    if method == HttpMethod::Get && !params.is_empty() {
        query.push(encode_query(params));
    }
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.join("&"));
    }

    url.parse::<Uri>()
        .map_err(|err| TransportError::configuration(format!("invalid endpoint `{url}`: {err}")))
}

fn encode_query(params: &Params) -> String {
    params
        .iter()
        .map(|(name, value)| {
            let text = match value {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            format!("{}={}", percent_encode(name), percent_encode(&text))
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

fn decode_body(bytes: &[u8]) -> TransportResult<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|err| TransportError::invocation_with(format!("malformed response body: {err}"), err))
}

/// Builds the error for a non-success response, preferring structured problem
/// details or an `error` member when the body carries them.
fn describe_failure(status: StatusCode, bytes: &[u8]) -> TransportError {
    let remote = match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => {
            let detail = map
                .get("error")
                .filter(|error| !error.is_null())
                .cloned()
                .unwrap_or(Value::Object(map));
            Some(RemoteError::from_value(&detail))
        }
        Ok(Value::String(message)) => Some(RemoteError::new("remote_error", message)),
        _ => None,
    };

    match remote {
        Some(remote) => TransportError::Invocation {
            reason: format!("HTTP {status}: {remote}"),
            remote: Some(remote),
            source: None,
        },
        None => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.trim();
            if text.is_empty() {
                TransportError::invocation(format!("HTTP {status}"))
            } else {
                TransportError::invocation(format!("HTTP {status}: {text}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    #[test]
    fn capability_is_joined_onto_endpoint_path() {
        let uri = capability_uri(
            "https://agents.example.com/api/",
            "summarize",
            HttpMethod::Post,
            &Params::new(),
        )
        .unwrap();
        assert_eq!(uri.to_string(), "https://agents.example.com/api/summarize");
    }

    #[test]
    fn capability_already_in_endpoint_is_not_repeated() {
        let uri = capability_uri(
            "https://agents.example.com/api/summarize/",
            "summarize",
            HttpMethod::Post,
            &Params::new(),
        )
        .unwrap();
        assert_eq!(uri.to_string(), "https://agents.example.com/api/summarize");

        let uri = capability_uri("https://summarize", "summarize", HttpMethod::Post, &Params::new())
            .unwrap();
        assert_eq!(uri.to_string(), "https://summarize/summarize");
    }

    #[test]
    fn get_parameters_are_percent_encoded() {
        let uri = capability_uri(
            "http://localhost:8080?tenant=a",
            "search",
            HttpMethod::Get,
            &params(json!({"q": "rust & tokio", "limit": 5})),
        )
        .unwrap();
        assert_eq!(
            uri.to_string(),
            "http://localhost:8080/search?tenant=a&limit=5&q=rust%20%26%20tokio"
        );
    }

    #[test]
    fn endpoint_without_http_scheme_is_rejected() {
        let err = capability_uri("agent://host", "echo", HttpMethod::Post, &Params::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn problem_details_become_remote_errors() {
        let body = br#"{"type":"https://errors.example/quota","title":"Quota","detail":"limit reached"}"#;
        let err = describe_failure(StatusCode::TOO_MANY_REQUESTS, body);
        let remote = err.remote_error().unwrap();
        assert_eq!(remote.kind(), "https://errors.example/quota");
        assert_eq!(remote.message(), "limit reached");
        assert!(err.to_string().contains("429"));
    }

    #[test]
    fn nested_error_member_is_preferred() {
        let body = br#"{"error":{"code":-32601,"message":"method not found"}}"#;
        let err = describe_failure(StatusCode::NOT_FOUND, body);
        assert_eq!(err.remote_error().unwrap().message(), "method not found");
    }

    #[test]
    fn plain_text_failures_keep_body() {
        let err = describe_failure(StatusCode::BAD_GATEWAY, b"upstream down");
        assert!(err.remote_error().is_none());
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn empty_and_malformed_bodies() {
        assert_eq!(decode_body(b" \n").unwrap(), Value::Null);
        assert_eq!(decode_body(b"not json").unwrap_err().kind(), ErrorKind::Invocation);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = HttpsTransport::new(HttpsConfig::new().with_timeout(Duration::ZERO)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
