//! In-process binding: dispatches capabilities to callables resolved from
//! dotted paths.
//!
//! The endpoint supplies an optional base namespace (`local://text.tools`
//! turns capability `count` into `text.tools.count`). Resolved callables are
//! cached for the life of the transport. Registering through the transport
//! evicts the affected entries; changes made directly on a shared
//! [`ModuleCatalog`] go unnoticed until [`LocalTransport::clear_cache`].
//!
//! Blocking shapes run on tokio's blocking pool and async shapes on spawned
//! tasks, so one slow callable never stalls unrelated calls. At most
//! [`LocalConfig::max_concurrency`] calls execute at a time.

mod callable;
mod module;
mod pool;
mod resolver;
mod signature;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use agent_primitives::Params;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

pub use self::callable::{
    Arguments, CallError, CallResult, Callable, ShapeKind, ValueIter, ValueStream,
};
use self::callable::Shape;
pub use self::module::{Member, Module, ModuleCatalog, ModuleLoader, StaticModule};
use self::pool::ExecutionPool;
pub use self::resolver::ResolvedCallable;
use self::resolver::{Resolver, qualify};
pub use self::signature::{ParamKind, Parameter, Signature};
use crate::contract::{AgentTransport, ChunkStream, InvokeOptions, StreamOptions};
use crate::error::{TransportError, TransportResult};
use crate::registry::{TransportFactory, factory_fn};

const DEFAULT_MAX_CONCURRENCY: usize = 32;
const DEFAULT_STREAM_BUFFER: usize = 16;

/// Configuration for [`LocalTransport`].
#[derive(Clone, Debug)]
pub struct LocalConfig {
    protocol: String,
    timeout: Option<Duration>,
    max_concurrency: NonZeroUsize,
    stream_buffer: NonZeroUsize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            protocol: "local".to_owned(),
            timeout: None,
            max_concurrency: NonZeroUsize::new(DEFAULT_MAX_CONCURRENCY).unwrap_or(NonZeroUsize::MIN),
            stream_buffer: NonZeroUsize::new(DEFAULT_STREAM_BUFFER).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl LocalConfig {
    /// Creates the default configuration: no timeout, 32 concurrent calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scheme the transport registers under.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Bounds total execution time of each call unless the caller sets one.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Caps how many calls execute at once.
    #[must_use]
    pub const fn with_max_concurrency(mut self, limit: NonZeroUsize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Number of chunks a producer may run ahead of the consumer.
    #[must_use]
    pub const fn with_stream_buffer(mut self, capacity: NonZeroUsize) -> Self {
        self.stream_buffer = capacity;
        self
    }

    /// Returns the scheme.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Returns the default execution timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the concurrency cap.
    #[must_use]
    pub const fn max_concurrency(&self) -> NonZeroUsize {
        self.max_concurrency
    }

    /// Returns the default stream buffer.
    #[must_use]
    pub const fn stream_buffer(&self) -> NonZeroUsize {
        self.stream_buffer
    }
}

/// Local binding of the transport contract.
pub struct LocalTransport {
    config: LocalConfig,
    catalog: Arc<ModuleCatalog>,
    resolver: Arc<Resolver>,
    pool: ExecutionPool,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("config", &self.config)
            .field("catalog", &self.catalog)
            .field("in_flight", &self.pool.in_flight())
            .finish_non_exhaustive()
    }
}

impl LocalTransport {
    /// Creates a transport with an empty runtime catalog. Modules submitted
    /// with [`StaticModule`] are visible immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Configuration`] for a zero timeout or an
    /// empty scheme.
    pub fn new(config: LocalConfig) -> TransportResult<Self> {
        Self::with_catalog(config, Arc::new(ModuleCatalog::new()))
    }

    /// Creates a transport that resolves against a shared catalog.
    ///
    /// # Errors
    ///
    /// Same as [`LocalTransport::new`].
    pub fn with_catalog(config: LocalConfig, catalog: Arc<ModuleCatalog>) -> TransportResult<Self> {
        if config.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(TransportError::configuration(
                "local timeout must be greater than zero",
            ));
        }
        if config.protocol.trim().is_empty() {
            return Err(TransportError::configuration("local protocol cannot be empty"));
        }

        Ok(Self {
            pool: ExecutionPool::new(config.max_concurrency),
            resolver: Arc::new(Resolver::new(Arc::clone(&catalog))),
            catalog,
            config,
        })
    }

    /// Returns a registry factory that builds transports from `config`,
    /// all sharing `catalog`.
    #[must_use]
    pub fn factory(config: LocalConfig, catalog: Arc<ModuleCatalog>) -> impl TransportFactory + 'static {
        factory_fn(config.protocol.clone(), move || {
            Ok(Arc::new(Self::with_catalog(config.clone(), Arc::clone(&catalog))?)
                as Arc<dyn AgentTransport>)
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Returns the catalog callables are resolved from.
    #[must_use]
    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    /// Registers a module under `path`. Cached resolutions below `path` are
    /// evicted so the new module takes effect.
    pub fn register_module(&self, path: impl Into<String>, module: Module) {
        let path = path.into();
        self.catalog.register_module(path.clone(), module);
        self.resolver.evict_namespace(&path);
    }

    /// Registers a lazily built module under `path`.
    pub fn register_loader<F>(&self, path: impl Into<String>, loader: F)
    where
        F: Fn() -> Result<Module, String> + Send + Sync + 'static,
    {
        let path = path.into();
        self.catalog.register_loader(path.clone(), loader);
        self.resolver.evict_namespace(&path);
    }

    /// Exposes `module` as a local agent and returns its address,
    /// `agent+local://<name>`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Validation`] if `name` is empty or contains
    /// characters other than letters, digits, `_`, `-` and `.`.
    pub fn register_agent(&self, name: &str, module: Module) -> TransportResult<String> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.ends_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(TransportError::validation(format!(
                "`{name}` is not a valid local agent name"
            )));
        }

        self.register_module(name, module);
        info!(agent = name, "local agent registered");
        Ok(format!("agent+{}://{name}", self.config.protocol))
    }

    /// Removes a local agent and forgets its cached callables. Returns `true`
    /// if the agent was registered.
    pub fn unregister_agent(&self, name: &str) -> bool {
        let removed = self.catalog.unregister(name);
        let evicted = self.resolver.evict_namespace(name);
        if removed {
            info!(agent = name, evicted, "local agent unregistered");
        }
        removed
    }

    /// Resolves `capability` against an optional base namespace without
    /// calling it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Resolution`] when the path does not lead to
    /// a callable.
    pub fn resolve(&self, capability: &str, base: Option<&str>) -> TransportResult<Arc<ResolvedCallable>> {
        self.resolver.resolve(&qualify(capability, base))
    }

    /// Drops every cached resolution. Returns how many were dropped.
    pub fn clear_cache(&self) -> usize {
        let cleared = self.resolver.clear();
        debug!(cleared, "resolution cache cleared");
        cleared
    }

    /// Paths currently cached, sorted.
    #[must_use]
    pub fn cached_paths(&self) -> Vec<String> {
        self.resolver.cached_paths()
    }

    /// Returns `true` if `path` has been resolved and cached.
    #[must_use]
    pub fn is_cached(&self, path: &str) -> bool {
        self.resolver.is_cached(path)
    }

    /// Number of calls currently executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Resolves and binds a call. Cache misses import on the blocking pool
    /// so a slow loader never stalls the async workers.
    async fn prepare(
        &self,
        endpoint: &str,
        capability: &str,
        params: Params,
    ) -> TransportResult<(Arc<ResolvedCallable>, Arguments)> {
        let path = qualify(capability, base_namespace(endpoint).as_deref());
        let resolved = match self.resolver.cached(&path) {
            Some(hit) => hit,
            None => {
                let resolver = Arc::clone(&self.resolver);
                let target = path.clone();
                tokio::task::spawn_blocking(move || resolver.resolve(&target))
                    .await
                    .map_err(|_| TransportError::resolution(path, "module import panicked"))??
            }
        };
        let args = resolved.callable().signature().bind(params)?;
        Ok((resolved, args))
    }
}

/// Base namespace carried by a local endpoint: `agent+local://text/tools`
/// and `local://text.tools` both give `text.tools`.
fn base_namespace(endpoint: &str) -> Option<String> {
    let rest = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let namespace = rest.trim_matches('/').replace('/', ".");
    (!namespace.is_empty()).then_some(namespace)
}

#[async_trait]
impl AgentTransport for LocalTransport {
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
        let (resolved, args) = self.prepare(endpoint, capability, params).await?;
        let permit = self.pool.acquire().await?;
        debug!(path = resolved.path(), kind = ?resolved.kind(), "local invoke");

        let call = execute(Arc::clone(resolved.callable()), args, permit);
        match options.timeout().or(self.config.timeout) {
            None => call.await,
            Some(limit) => timeout(limit, call).await.unwrap_or_else(|_| {
                warn!(path = resolved.path(), "local call timed out");
                Err(TransportError::timed_out(
                    format!("invoke `{}`", resolved.path()),
                    limit,
                ))
            }),
        }
    }

    async fn stream(
        &self,
        endpoint: &str,
        capability: &str,
        params: Params,
        options: StreamOptions,
    ) -> TransportResult<ChunkStream> {
        let (resolved, args) = self.prepare(endpoint, capability, params).await?;
        let permit = self.pool.acquire().await?;
        debug!(path = resolved.path(), kind = ?resolved.kind(), "local stream");

        let limit = options.timeout().or(self.config.timeout);
        let buffer = options.buffer().unwrap_or(self.config.stream_buffer);
        let (tx, receiver) = mpsc::channel(buffer.get());
        let producer = produce(Arc::clone(resolved.callable()), args, tx, permit);

        let state = Produced {
            receiver,
            deadline: limit.map(|limit| (Instant::now() + limit, limit)),
            label: format!("stream `{}`", resolved.path()),
            _producer: producer,
        };
        Ok(Box::pin(stream::unfold(Some(state), next_chunk)))
    }

    async fn close(&self) {
        self.pool.close();
        debug!(protocol = %self.config.protocol, "local transport closed");
    }
}

/// Aborts a spawned task when dropped, so abandoning a call stops its work
/// at the next await point.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn execution_failed(err: CallError) -> TransportError {
    TransportError::invocation_with(format!("function execution failed: {err}"), err)
}

fn streaming_failed(err: CallError) -> TransportError {
    TransportError::invocation_with(format!("streaming function failed: {err}"), err)
}

fn join_failed(err: &JoinError) -> TransportError {
    if err.is_panic() {
        TransportError::invocation("function execution failed: callable panicked")
    } else {
        TransportError::invocation("function execution failed: call was cancelled")
    }
}

/// Runs `callable` to completion. Generators are drained into an array.
///
/// Blocking shapes take `permit` onto their thread, so an abandoned call
/// keeps its slot until the thread actually finishes.
async fn execute(
    callable: Arc<Callable>,
    args: Arguments,
    permit: OwnedSemaphorePermit,
) -> TransportResult<Value> {
    let shape = callable.shape().clone();
    match shape {
        Shape::Plain(body) => tokio::task::spawn_blocking(move || {
            let _permit = permit;
            body(args)
        })
        .await
        .map_err(|err| join_failed(&err))?
        .map_err(execution_failed),
        Shape::Generator(body) => tokio::task::spawn_blocking(move || {
            let _permit = permit;
            body(args)?.collect::<CallResult<Vec<Value>>>()
        })
        .await
        .map_err(|err| join_failed(&err))?
        .map(Value::Array)
        .map_err(execution_failed),
        Shape::Awaitable(body) => {
            let _permit = permit;
            let handle = tokio::spawn(body(args));
            let _abort = AbortOnDrop(handle.abort_handle());
            handle
                .await
                .map_err(|err| join_failed(&err))?
                .map_err(execution_failed)
        }
        Shape::AsyncGenerator(body) => {
            let _permit = permit;
            let handle = tokio::spawn(body(args).try_collect::<Vec<Value>>());
            let _abort = AbortOnDrop(handle.abort_handle());
            handle
                .await
                .map_err(|err| join_failed(&err))?
                .map(Value::Array)
                .map_err(execution_failed)
        }
    }
}

enum Item {
    Chunk(Value),
    Failed(TransportError),
    Done,
}

/// Keeps a stream's producer alive, and its execution slot when the slot is
/// not already owned by a blocking thread.
struct Producer {
    _task: Option<AbortOnDrop>,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Starts the producer for a stream. Items flow through `tx`; a producer that
/// stops without sending [`Item::Done`] or [`Item::Failed`] has crashed.
fn produce(
    callable: Arc<Callable>,
    args: Arguments,
    tx: mpsc::Sender<Item>,
    permit: OwnedSemaphorePermit,
) -> Producer {
    let shape = callable.shape().clone();
    match shape {
        Shape::Generator(body) => {
            // Blocking threads cannot be aborted; the generator stops at its
            // next item once the consumer is gone.
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let items = match body(args) {
                    Ok(items) => items,
                    Err(err) => {
                        let _ = tx.blocking_send(Item::Failed(streaming_failed(err)));
                        return;
                    }
                };
                for item in items {
                    let (item, last) = match item {
                        Ok(chunk) => (Item::Chunk(chunk), false),
                        Err(err) => (Item::Failed(streaming_failed(err)), true),
                    };
                    if tx.blocking_send(item).is_err() || last {
                        return;
                    }
                }
                let _ = tx.blocking_send(Item::Done);
            });
            Producer {
                _task: None,
                _permit: None,
            }
        }
        Shape::AsyncGenerator(body) => {
            let handle = tokio::spawn(async move {
                let mut items = body(args);
                while let Some(item) = items.next().await {
                    let (item, last) = match item {
                        Ok(chunk) => (Item::Chunk(chunk), false),
                        Err(err) => (Item::Failed(streaming_failed(err)), true),
                    };
                    if tx.send(item).await.is_err() || last {
                        return;
                    }
                }
                let _ = tx.send(Item::Done).await;
            });
            Producer {
                _task: Some(AbortOnDrop(handle.abort_handle())),
                _permit: Some(permit),
            }
        }
        Shape::Plain(_) | Shape::Awaitable(_) => {
            let handle = tokio::spawn(async move {
                let item = match execute(callable, args, permit).await {
                    Ok(value) => Item::Chunk(value),
                    Err(err) => Item::Failed(err),
                };
                if tx.send(item).await.is_ok() {
                    let _ = tx.send(Item::Done).await;
                }
            });
            Producer {
                _task: Some(AbortOnDrop(handle.abort_handle())),
                _permit: None,
            }
        }
    }
}

struct Produced {
    receiver: mpsc::Receiver<Item>,
    deadline: Option<(Instant, Duration)>,
    label: String,
    _producer: Producer,
}

async fn next_chunk(state: Option<Produced>) -> Option<(TransportResult<Value>, Option<Produced>)> {
    let mut state = state?;
    let next = match state.deadline {
        None => state.receiver.recv().await,
        Some((at, limit)) => {
            if let Ok(next) = timeout_at(at, state.receiver.recv()).await {
                next
            } else {
                warn!(stream = %state.label, "local stream timed out");
                let err = TransportError::timed_out(state.label.clone(), limit);
                return Some((Err(err), None));
            }
        }
    };

    match next {
        Some(Item::Chunk(chunk)) => Some((Ok(chunk), Some(state))),
        Some(Item::Failed(err)) => Some((Err(err), None)),
        Some(Item::Done) => None,
        None => Some((
            Err(TransportError::invocation(
                "streaming function failed: producer terminated unexpectedly",
            )),
            None,
        )),
    }
}
