//! Persistent, multiplexed binding over WebSocket.
//!
//! A transport holds at most one open connection, established lazily on the
//! first call and shared by every concurrent call after that. Each request
//! carries a fresh correlation id; inbound frames are routed back to their
//! caller by id alone, so responses may arrive in any order.
//!
//! Handshake headers come from the call that opens the connection; later
//! calls reuse it as is. Calling a different endpoint closes the current
//! connection (failing whatever is still outstanding on it) and opens a new
//! one.

mod connection;
mod frame;
mod state;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agent_primitives::{CapabilityName, CapabilityRequest, Headers, Params, RequestId};
use async_trait::async_trait;
use futures::stream;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use self::connection::{ChunkReceiver, Connection, PendingGuard, PendingRequest, chunk_channel};
use self::frame::encode_request;
pub use self::state::ConnectionState;
use self::state::Lifecycle;
use crate::contract::{AgentTransport, ChunkStream, InvokeOptions, StreamOptions};
use crate::error::{TransportError, TransportResult};
use crate::registry::{TransportFactory, factory_fn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for [`WebSocketTransport`].
#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    protocol: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    close_on_complete: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            protocol: "wss".to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_on_complete: true,
        }
    }
}

impl WebSocketConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scheme the transport registers under (`wss` or `ws`).
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Bounds the opening handshake.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Default wait for a result, or for each chunk of a stream.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Whether a completed stream closes an otherwise idle connection.
    #[must_use]
    pub const fn with_close_on_complete(mut self, close: bool) -> Self {
        self.close_on_complete = close;
        self
    }

    /// Returns the scheme.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns the handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the default request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the default close-on-complete behaviour.
    #[must_use]
    pub const fn close_on_complete(&self) -> bool {
        self.close_on_complete
    }
}

/// WebSocket binding of the transport contract.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    lifecycle: Arc<Lifecycle>,
    current: Mutex<Option<Arc<Connection>>>,
    connect_gate: tokio::sync::Mutex<()>,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl WebSocketTransport {
    /// Creates a transport; no connection is opened until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] for zero timeouts or a scheme
    /// other than `ws` or `wss`.
    pub fn new(config: WebSocketConfig) -> TransportResult<Self> {
        if config.connect_timeout.is_zero() || config.request_timeout.is_zero() {
            return Err(TransportError::configuration(
                "websocket timeouts must be greater than zero",
            ));
        }
        if !matches!(config.protocol.as_str(), "ws" | "wss") {
            return Err(TransportError::configuration(format!(
                "websocket transport cannot serve scheme `{}`",
                config.protocol
            )));
        }

        Ok(Self {
            config,
            lifecycle: Arc::new(Lifecycle::default()),
            current: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Returns a registry factory that builds transports from `config`.
    #[must_use]
    pub fn factory(config: WebSocketConfig) -> impl TransportFactory + 'static {
        factory_fn(config.protocol.clone(), move || {
            Ok(Arc::new(Self::new(config.clone())?) as Arc<dyn AgentTransport>)
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Number of requests awaiting a terminal response on the open connection.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.current().as_ref().map_or(0, |c| c.pending_count())
    }

    /// Endpoint of the open connection, if any.
    #[must_use]
    pub fn connected_endpoint(&self) -> Option<String> {
        self.current()
            .as_ref()
            .filter(|connection| connection.is_open())
            .map(|connection| connection.endpoint().to_owned())
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self, endpoint: &str) -> Option<Arc<Connection>> {
        self.current()
            .as_ref()
            .filter(|connection| connection.is_open() && connection.endpoint() == endpoint)
            .cloned()
    }

    /// Returns the open connection to `endpoint`, opening it if needed.
    /// Concurrent first callers wait for a single handshake.
    async fn connection(&self, endpoint: &str, headers: &Headers) -> TransportResult<Arc<Connection>> {
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(TransportError::configuration(format!(
                "endpoint `{endpoint}` must start with ws:// or wss://"
            )));
        }
        if let Some(connection) = self.live(endpoint) {
            return Ok(connection);
        }

        let _gate = self.connect_gate.lock().await;
        if let Some(connection) = self.live(endpoint) {
            return Ok(connection);
        }

        let previous = self.current().take();
        if let Some(previous) = previous.filter(|c| c.is_open()) {
            info!(from = previous.endpoint(), to = endpoint, "switching websocket endpoint");
            previous.close("endpoint changed").await;
        }

        let connection = Connection::open(
            endpoint,
            headers,
            self.config.connect_timeout,
            Arc::clone(&self.lifecycle),
        )
        .await?;
        *self.current() = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Registers a pending request on the open connection to `endpoint`.
    ///
    /// A completing stream may close an idle connection between the lookup
    /// and the registration. That close carries no I/O failure, so the
    /// request is retried once on a fresh connection.
    async fn attach<R, F>(
        &self,
        endpoint: &str,
        headers: &Headers,
        id: &RequestId,
        mut pending: F,
    ) -> TransportResult<(Arc<Connection>, R)>
    where
        F: FnMut() -> (PendingRequest, R),
    {
        let mut retried = false;
        loop {
            let connection = self.connection(endpoint, headers).await?;
            let (request, handle) = pending();
            match connection.register(id.clone(), request) {
                Ok(()) => return Ok((connection, handle)),
                Err(err) if !retried && !connection.is_open() => {
                    debug!(%id, %err, "connection closed before registration, reconnecting");
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn build_request(
        capability: &str,
        params: Params,
        headers: &Headers,
        timeout: Option<Duration>,
        streaming: bool,
    ) -> TransportResult<CapabilityRequest> {
        let request = CapabilityRequest::builder(CapabilityName::new(capability)?)
            .params(params)
            .headers(headers.clone())
            .timeout(timeout)
            .streaming(streaming)
            .build()?;
        Ok(request)
    }
}

fn encode(
    request: &CapabilityRequest,
    json_rpc: bool,
    extra: &Map<String, Value>,
) -> TransportResult<String> {
    encode_request(request, json_rpc, extra)
        .map_err(|err| TransportError::validation(format!("parameters are not encodable: {err}")))
}

#[async_trait]
impl AgentTransport for WebSocketTransport {
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
        let request = Self::build_request(
            capability,
            params,
            options.headers(),
            options.timeout(),
            false,
        )?;
        let frame = encode(&request, options.json_rpc(), options.message_format())?;
        let limit = request.timeout().unwrap_or(self.config.request_timeout);

        let id = request.id().clone();
        let (connection, rx) = self
            .attach(endpoint, request.headers(), &id, || {
                let (tx, rx) = oneshot::channel();
                (PendingRequest::single(tx, limit), rx)
            })
            .await?;
        let _guard = PendingGuard::new(Arc::clone(&connection), id.clone());
        connection.send(frame)?;
        debug!(%id, capability = %request.capability(), "request sent");

        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::connection_closed(
                "connection dropped before responding",
            )),
            Err(_) => {
                warn!(%id, capability = %request.capability(), "request timed out");
                Err(TransportError::timed_out(
                    format!("invoke `{}`", request.capability()),
                    limit,
                ))
            }
        }
    }

    async fn stream(
        &self,
        endpoint: &str,
        capability: &str,
        params: Params,
        options: StreamOptions,
    ) -> TransportResult<ChunkStream> {
        let request = Self::build_request(
            capability,
            params,
            options.headers(),
            options.timeout(),
            true,
        )?;
        let frame = encode(&request, options.json_rpc(), options.message_format())?;
        let idle = request.timeout().unwrap_or(self.config.request_timeout);

        let id = request.id().clone();
        let buffer = options.buffer();
        let (connection, receiver) = self
            .attach(endpoint, request.headers(), &id, || {
                let (tx, receiver) = chunk_channel(buffer);
                (PendingRequest::stream(tx), receiver)
            })
            .await?;
        let guard = PendingGuard::new(Arc::clone(&connection), id);
        connection.send(frame)?;
        debug!(id = %guard.id(), capability = %request.capability(), "stream requested");

        let state = ChunkState {
            receiver,
            guard,
            idle,
            label: format!("stream `{}`", request.capability()),
            close_on_complete: options
                .close_on_complete()
                .unwrap_or(self.config.close_on_complete),
        };
        Ok(Box::pin(stream::unfold(Some(state), next_chunk)))
    }

    async fn close(&self) {
        let _gate = self.connect_gate.lock().await;
        let current = self.current().take();
        if let Some(connection) = current {
            connection.close("transport closed").await;
        }
    }
}

struct ChunkState {
    receiver: ChunkReceiver,
    guard: PendingGuard,
    idle: Duration,
    label: String,
    close_on_complete: bool,
}

async fn next_chunk(state: Option<ChunkState>) -> Option<(TransportResult<Value>, Option<ChunkState>)> {
    let mut state = state?;
    match timeout(state.idle, state.receiver.recv()).await {
        Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(state))),
        Ok(Some(Err(err))) => Some((Err(err), None)),
        Ok(None) => {
            debug!(id = %state.guard.id(), "stream complete");
            if state.close_on_complete {
                let connection = Arc::clone(state.guard.connection());
                drop(state);
                connection.close_if_idle("stream complete").await;
            }
            None
        }
        Err(_) => {
            warn!(id = %state.guard.id(), "stream idle timeout");
            Some((
                Err(TransportError::timed_out(state.label.clone(), state.idle)),
                None,
            ))
        }
    }
}
