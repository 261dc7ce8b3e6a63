//! One live socket and the requests multiplexed over it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use agent_primitives::{Headers, RequestId, ResponsePayload};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use super::frame::decode_response;
use super::state::{ConnectionEvent, Lifecycle};
use crate::error::{TransportError, TransportResult};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Item delivered to a waiting caller.
pub(crate) type Delivered = TransportResult<Value>;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Producer half of a stream's chunk queue.
#[derive(Clone)]
pub(crate) enum ChunkSender {
    Bounded(mpsc::Sender<Delivered>),
    Unbounded(mpsc::UnboundedSender<Delivered>),
}

impl ChunkSender {
    /// Queues an item, waiting for space when bounded. Returns `false` once the
    /// consumer is gone.
    async fn deliver(&self, item: Delivered) -> bool {
        match self {
            Self::Bounded(tx) => tx.send(item).await.is_ok(),
            Self::Unbounded(tx) => tx.send(item).is_ok(),
        }
    }

    /// Queues a terminal error without blocking the caller.
    fn fail(self, err: TransportError) {
        match self {
            Self::Unbounded(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Bounded(tx) => {
                if let Err(TrySendError::Full(item)) = tx.try_send(Err(err)) {
                    tokio::spawn(async move {
                        let _ = tx.send(item).await;
                    });
                }
            }
        }
    }
}

/// Consumer half of a stream's chunk queue.
pub(crate) enum ChunkReceiver {
    Bounded(mpsc::Receiver<Delivered>),
    Unbounded(mpsc::UnboundedReceiver<Delivered>),
}

impl ChunkReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Delivered> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}

pub(crate) fn chunk_channel(capacity: Option<NonZeroUsize>) -> (ChunkSender, ChunkReceiver) {
    match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.get());
            (ChunkSender::Bounded(tx), ChunkReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (ChunkSender::Unbounded(tx), ChunkReceiver::Unbounded(rx))
        }
    }
}

enum Delivery {
    Single(oneshot::Sender<Delivered>),
    Stream(ChunkSender),
}

/// Book-keeping for one outstanding request.
pub(crate) struct PendingRequest {
    delivery: Delivery,
    created_at: Instant,
    deadline: Option<Instant>,
}

impl PendingRequest {
    pub(crate) fn single(tx: oneshot::Sender<Delivered>, timeout: Duration) -> Self {
        let created_at = Instant::now();
        Self {
            delivery: Delivery::Single(tx),
            created_at,
            deadline: created_at.checked_add(timeout),
        }
    }

    pub(crate) fn stream(tx: ChunkSender) -> Self {
        Self {
            delivery: Delivery::Stream(tx),
            created_at: Instant::now(),
            deadline: None,
        }
    }

    fn fail(self, err: TransportError) {
        match self.delivery {
            Delivery::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Delivery::Stream(tx) => tx.fail(err),
        }
    }

    /// Completes the request with a terminal payload. A `result` on a stream is
    /// its final chunk; a `null` result only ends it.
    async fn settle(self, payload: ResponsePayload) {
        match (self.delivery, payload) {
            (Delivery::Single(tx), ResponsePayload::Result(value)) => {
                let _ = tx.send(Ok(value));
            }
            (Delivery::Single(tx), ResponsePayload::Complete) => {
                let _ = tx.send(Ok(Value::Null));
            }
            (Delivery::Single(tx), ResponsePayload::Error(error)) => {
                let _ = tx.send(Err(TransportError::remote(error)));
            }
            (Delivery::Stream(tx), ResponsePayload::Result(value)) if !value.is_null() => {
                tx.deliver(Ok(value)).await;
            }
            (Delivery::Stream(tx), ResponsePayload::Error(error)) => {
                tx.deliver(Err(TransportError::remote(error))).await;
            }
            // Dropping the sender ends the stream cleanly.
            (Delivery::Stream(_), _) | (_, ResponsePayload::Chunk(_)) => {}
        }
    }
}

enum Outbound {
    Frame(String),
    Close,
}

struct Shared {
    endpoint: String,
    epoch: u64,
    lifecycle: Arc<Lifecycle>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, event: ConnectionEvent) {
        if let Err(err) = self.lifecycle.transition(self.epoch, event) {
            debug!(endpoint = %self.endpoint, %err, "ignored connection event");
        }
    }

    /// Marks the connection closed and fails every outstanding request.
    /// Returns `false` if it was already sealed, or if `only_if_idle` is set and
    /// requests are still outstanding.
    fn seal(&self, reason: &str, only_if_idle: bool) -> bool {
        let drained = {
            let mut pending = self.pending();
            if only_if_idle && !pending.is_empty() {
                return false;
            }
            if !self.open.swap(false, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *pending)
        };

        if !drained.is_empty() {
            warn!(
                endpoint = %self.endpoint,
                pending = drained.len(),
                reason,
                "failing outstanding requests"
            );
        }
        for (_, request) in drained {
            request.fail(TransportError::connection_closed(reason));
        }

        let _ = self.outbound.send(Outbound::Close);
        true
    }

    /// Reader-side teardown after the socket went away.
    fn lost(&self, reason: &str) {
        if self.seal(reason, false) {
            self.advance(ConnectionEvent::Lost);
            info!(endpoint = %self.endpoint, reason, "websocket disconnected");
        }
    }

    async fn dispatch(&self, text: &str) {
        let response = match decode_response(text) {
            Ok(response) => response,
            Err(err) => {
                warn!(endpoint = %self.endpoint, %err, "dropping malformed frame");
                return;
            }
        };
        let (id, payload) = response.into_parts();

        if let ResponsePayload::Chunk(chunk) = payload {
            let sender = {
                let pending = self.pending();
                match pending.get(&id).map(|request| &request.delivery) {
                    Some(Delivery::Stream(tx)) => tx.clone(),
                    Some(Delivery::Single(_)) => {
                        warn!(%id, "dropping chunk for non-streaming request");
                        return;
                    }
                    None => {
                        debug!(%id, "dropping chunk for unknown request");
                        return;
                    }
                }
            };
            if !sender.deliver(Ok(chunk)).await {
                debug!(%id, "stream consumer went away");
            }
            return;
        }

        let Some(request) = self.pending().remove(&id) else {
            debug!(%id, "dropping response for unknown request");
            return;
        };
        if request
            .deadline
            .is_some_and(|deadline| Instant::now() > deadline)
        {
            debug!(%id, "response arrived after its deadline");
        }
        trace!(%id, elapsed = ?request.created_at.elapsed(), "request settled");
        request.settle(payload).await;
    }
}

/// A connected socket with its reader and writer tasks.
pub(crate) struct Connection {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Performs the handshake and spawns the socket tasks.
    pub(crate) async fn open(
        endpoint: &str,
        headers: &Headers,
        connect_timeout: Duration,
        lifecycle: Arc<Lifecycle>,
    ) -> TransportResult<Arc<Self>> {
        let epoch = lifecycle.begin_connect();

        let attempt = async {
            let request = handshake_request(endpoint, headers)?;
            match timeout(connect_timeout, connect_async(request)).await {
                Err(_) => Err(TransportError::timed_out(
                    format!("connect to {endpoint}"),
                    connect_timeout,
                )),
                Ok(Err(err)) => Err(TransportError::connection_with(
                    format!("failed to connect to {endpoint}"),
                    err,
                )),
                Ok(Ok((socket, _response))) => Ok(socket),
            }
        };

        let socket = match attempt.await {
            Ok(socket) => socket,
            Err(err) => {
                let _ = lifecycle.transition(epoch, ConnectionEvent::HandshakeFailed);
                warn!(endpoint, %err, "websocket handshake failed");
                return Err(err);
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            endpoint: endpoint.to_owned(),
            epoch,
            lifecycle,
            pending: Mutex::new(HashMap::new()),
            outbound,
            open: AtomicBool::new(true),
        });
        shared.advance(ConnectionEvent::HandshakeSucceeded);
        info!(endpoint, "websocket connected");

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        Ok(Arc::new(Self {
            shared,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }))
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub(crate) fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Registers a request before its frame is sent so a fast reply is never
    /// missed.
    pub(crate) fn register(&self, id: RequestId, request: PendingRequest) -> TransportResult<()> {
        let mut pending = self.shared.pending();
        if !self.is_open() {
            return Err(TransportError::connection_closed(format!(
                "connection to {} is closed",
                self.shared.endpoint
            )));
        }
        if pending.contains_key(&id) {
            return Err(TransportError::validation(format!(
                "request id `{id}` is already in flight"
            )));
        }
        pending.insert(id, request);
        Ok(())
    }

    pub(crate) fn deregister(&self, id: &RequestId) -> bool {
        self.shared.pending().remove(id).is_some()
    }

    pub(crate) fn send(&self, frame: String) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::connection_closed(format!(
                "connection to {} is closed",
                self.shared.endpoint
            )));
        }
        self.shared
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::connection_closed("websocket writer stopped"))
    }

    /// Closes the socket, failing any outstanding requests with `reason`.
    pub(crate) async fn close(&self, reason: &str) {
        self.shutdown(reason, false).await;
    }

    /// Closes the socket only when no request is outstanding.
    pub(crate) async fn close_if_idle(&self, reason: &str) -> bool {
        self.shutdown(reason, true).await
    }

    async fn shutdown(&self, reason: &str, only_if_idle: bool) -> bool {
        if !self.is_open() {
            return false;
        }
        let connected = self.shared.lifecycle.state().is_connected();
        if !self.shared.seal(reason, only_if_idle) {
            return false;
        }
        if connected {
            self.shared.advance(ConnectionEvent::Close);
        }

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let abort = reader.abort_handle();
            if timeout(CLOSE_GRACE, reader).await.is_err() {
                debug!(endpoint = %self.shared.endpoint, "peer did not acknowledge close");
                abort.abort();
            }
        }

        self.shared.advance(ConnectionEvent::Closed);
        info!(endpoint = %self.shared.endpoint, reason, "websocket closed");
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in [&mut self.reader, &mut self.writer] {
            if let Some(handle) = task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
                handle.abort();
            }
        }
    }
}

/// Removes a request from the pending table when its caller stops waiting,
/// whether it finished, timed out or was dropped.
pub(crate) struct PendingGuard {
    connection: Arc<Connection>,
    id: RequestId,
}

impl PendingGuard {
    pub(crate) fn new(connection: Arc<Connection>, id: RequestId) -> Self {
        Self { connection, id }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.connection.deregister(&self.id) {
            debug!(id = %self.id, "abandoned request deregistered");
        }
    }
}

fn handshake_request(
    endpoint: &str,
    headers: &Headers,
) -> TransportResult<http::Request<()>> {
    let mut request = endpoint.into_client_request().map_err(|err| {
        TransportError::configuration(format!("invalid websocket endpoint `{endpoint}`: {err}"))
    })?;

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| TransportError::validation(format!("invalid header `{name}`: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| TransportError::validation(format!("invalid value for `{name}`: {err}")))?;
        request.headers_mut().insert(name, value);
    }

    Ok(request)
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(text) => {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    warn!(endpoint = %shared.endpoint, %err, "websocket send failed");
                    shared.lost(&format!("send failed: {err}"));
                    break;
                }
            }
            Outbound::Close => {
                if let Err(err) = sink.close().await {
                    debug!(endpoint = %shared.endpoint, %err, "close handshake failed");
                }
                break;
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, shared: Arc<Shared>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()).await,
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => shared.dispatch(text).await,
                Err(_) => warn!(endpoint = %shared.endpoint, "dropping non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "closed by peer".to_owned(),
                    |frame| format!("closed by peer: {}", frame.reason.as_str()),
                );
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => break format!("receive failed: {err}"),
            None => break "connection ended".to_owned(),
        }
    };
    shared.lost(&reason);
}
