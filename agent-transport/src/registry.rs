//! Scheme-keyed registry of transport bindings.
//!
//! The registry maps a URI scheme (`https`, `wss`, `local`, ...) to a factory
//! and lazily builds at most one transport instance per scheme. Lookups are
//! case-insensitive, tolerate the `agent+` prefix used by composite schemes,
//! and resolve aliases such as the bare `agent` scheme.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::contract::AgentTransport;
use crate::error::{TransportError, TransportResult};

const AGENT_SCHEME: &str = "agent";
const DEFAULT_AGENT_TARGET: &str = "https";

/// Builds transport instances for a single scheme.
pub trait TransportFactory: Send + Sync {
    /// Scheme served by the transports this factory builds.
    fn protocol(&self) -> &str;

    /// Creates a new transport instance.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport cannot be configured.
    fn create(&self) -> TransportResult<Arc<dyn AgentTransport>>;
}

/// Factory backed by a closure, see [`factory_fn`].
pub struct FnFactory<F> {
    protocol: String,
    build: F,
}

impl<F> TransportFactory for FnFactory<F>
where
    F: Fn() -> TransportResult<Arc<dyn AgentTransport>> + Send + Sync,
{
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn create(&self) -> TransportResult<Arc<dyn AgentTransport>> {
        (self.build)()
    }
}

/// Wraps a closure as a [`TransportFactory`] for `protocol`.
#[must_use]
pub fn factory_fn<F>(protocol: impl Into<String>, build: F) -> FnFactory<F>
where
    F: Fn() -> TransportResult<Arc<dyn AgentTransport>> + Send + Sync,
{
    FnFactory {
        protocol: protocol.into(),
        build,
    }
}

/// Shared instance slot; filled on first lookup.
type InstanceSlot = Arc<Mutex<Option<Arc<dyn AgentTransport>>>>;

#[derive(Clone)]
struct Entry {
    factory: Arc<dyn TransportFactory>,
    instance: InstanceSlot,
}

impl Entry {
    fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            instance: Arc::new(Mutex::new(None)),
        }
    }

    fn with_instance(transport: Arc<dyn AgentTransport>) -> Self {
        let protocol = transport.protocol().to_owned();
        let slot = Arc::new(Mutex::new(Some(Arc::clone(&transport))));
        Self {
            factory: Arc::new(InstanceFactory {
                protocol,
                transport,
            }),
            instance: slot,
        }
    }

    fn instance(&self) -> TransportResult<Arc<dyn AgentTransport>> {
        let mut slot = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(transport) = slot.as_ref() {
            return Ok(Arc::clone(transport));
        }

        let transport = self.factory.create()?;
        debug!(protocol = self.factory.protocol(), "transport instance created");
        *slot = Some(Arc::clone(&transport));
        Ok(transport)
    }

    fn cached(&self) -> Option<Arc<dyn AgentTransport>> {
        self.instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct InstanceFactory {
    protocol: String,
    transport: Arc<dyn AgentTransport>,
}

impl TransportFactory for InstanceFactory {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn create(&self) -> TransportResult<Arc<dyn AgentTransport>> {
        Ok(Arc::clone(&self.transport))
    }
}

/// Registry mapping schemes to transport bindings.
pub struct TransportRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert(AGENT_SCHEME.to_owned(), DEFAULT_AGENT_TARGET.to_owned());
        Self {
            entries: RwLock::new(HashMap::new()),
            aliases: RwLock::new(aliases),
        }
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("registered", &self.list_supported_protocols())
            .finish()
    }
}

impl TransportRegistry {
    /// Creates an empty registry in which `agent` aliases `https`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for its scheme, replacing any prior registration and
    /// discarding the instance it had built.
    pub fn register<F>(&self, factory: F)
    where
        F: TransportFactory + 'static,
    {
        self.register_shared(Arc::new(factory));
    }

    /// Registers a shared factory for its scheme.
    pub fn register_shared(&self, factory: Arc<dyn TransportFactory>) {
        let protocol = normalize(factory.protocol());
        self.insert(protocol, Entry::new(factory));
    }

    /// Registers an already-built transport under its own scheme.
    pub fn register_instance(&self, transport: Arc<dyn AgentTransport>) {
        let protocol = normalize(transport.protocol());
        self.insert(protocol, Entry::with_instance(transport));
    }

    fn insert(&self, protocol: String, entry: Entry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.insert(protocol.clone(), entry).is_some() {
            info!(%protocol, "transport registration replaced");
        } else {
            debug!(%protocol, "transport registered");
        }
    }

    /// Points `alias` at another registered scheme.
    pub fn set_alias(&self, alias: &str, target: &str) {
        let mut aliases = self.aliases.write().unwrap_or_else(PoisonError::into_inner);
        aliases.insert(normalize(alias), normalize(target));
    }

    /// Returns the transport registered for `protocol`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnsupportedProtocol`] when nothing is registered
    /// for the scheme, or the factory's error if building the instance fails.
    pub fn get(&self, protocol: &str) -> TransportResult<Arc<dyn AgentTransport>> {
        let key = self.resolve_key(protocol);
        let entry = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.get(&key).cloned()
        };

        entry
            .ok_or_else(|| TransportError::unsupported(protocol))?
            .instance()
    }

    /// Removes the registration for `protocol`. Returns `true` if one existed.
    pub fn unregister(&self, protocol: &str) -> bool {
        let key = normalize(protocol);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(&key).is_some();
        if removed {
            debug!(protocol = %key, "transport unregistered");
        }
        removed
    }

    /// Lists every scheme that [`get`](Self::get) currently accepts, aliases
    /// included, in sorted order.
    #[must_use]
    pub fn list_supported_protocols(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let aliases = self.aliases.read().unwrap_or_else(PoisonError::into_inner);

        let mut protocols: Vec<String> = entries.keys().cloned().collect();
        protocols.extend(
            aliases
                .iter()
                .filter(|(alias, target)| {
                    !entries.contains_key(*alias) && entries.contains_key(*target)
                })
                .map(|(alias, _)| alias.clone()),
        );
        protocols.sort();
        protocols
    }

    /// Returns `true` if [`get`](Self::get) would find a binding for `protocol`.
    #[must_use]
    pub fn is_supported(&self, protocol: &str) -> bool {
        let key = self.resolve_key(protocol);
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    /// Closes every transport instance built so far.
    pub async fn close_all(&self) {
        let instances: Vec<_> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.values().filter_map(Entry::cached).collect()
        };

        for transport in instances {
            transport.close().await;
        }
    }

    fn resolve_key(&self, protocol: &str) -> String {
        let key = normalize(protocol);
        if self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
        {
            return key;
        }

        self.aliases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
            .unwrap_or(key)
    }
}

/// Lowercases a scheme and strips the `agent+` prefix and any `://` suffix.
fn normalize(protocol: &str) -> String {
    let lower = protocol
        .trim()
        .trim_end_matches('/')
        .trim_end_matches(':')
        .to_ascii_lowercase();
    match lower.strip_prefix("agent+") {
        Some(inner) if !inner.is_empty() => inner.to_owned(),
        _ => lower,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agent_primitives::Params;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::contract::{ChunkStream, InvokeOptions, StreamOptions};
    use crate::error::ErrorKind;

    struct Fixed(&'static str);

    #[async_trait]
    impl AgentTransport for Fixed {
        fn protocol(&self) -> &str {
            self.0
        }

        async fn invoke(
            &self,
            _endpoint: &str,
            _capability: &str,
            _params: Params,
            _options: InvokeOptions,
        ) -> TransportResult<Value> {
            Ok(json!(self.0))
        }

        async fn stream(
            &self,
            _endpoint: &str,
            _capability: &str,
            _params: Params,
            _options: StreamOptions,
        ) -> TransportResult<ChunkStream> {
            Ok(Box::pin(futures::stream::iter(vec![Ok(json!(self.0))])))
        }
    }

    fn counting_factory(
        protocol: &'static str,
        counter: Arc<AtomicUsize>,
    ) -> impl TransportFactory + 'static {
        factory_fn(protocol, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Fixed(protocol)) as Arc<dyn AgentTransport>)
        })
    }

    #[test]
    fn get_builds_one_instance_per_scheme() {
        let registry = TransportRegistry::new();
        let built = Arc::new(AtomicUsize::new(0));
        registry.register(counting_factory("https", Arc::clone(&built)));

        let first = registry.get("https").unwrap();
        let second = registry.get("HTTPS").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn composite_and_alias_schemes_resolve() {
        let registry = TransportRegistry::new();
        registry.register(factory_fn("https", || {
            Ok(Arc::new(Fixed("https")) as Arc<dyn AgentTransport>)
        }));
        registry.register_instance(Arc::new(Fixed("local")));

        assert_eq!(registry.get("agent+https").unwrap().protocol(), "https");
        assert_eq!(registry.get("agent").unwrap().protocol(), "https");
        assert_eq!(registry.get("Agent+Local").unwrap().protocol(), "local");
        assert!(registry.is_supported("agent"));
    }

    #[test]
    fn unknown_scheme_is_unsupported() {
        let registry = TransportRegistry::new();
        let err = registry.get("gopher").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnsupportedProtocol);
        assert!(err.to_string().contains("gopher"));
        assert!(!registry.is_supported("agent"));
    }

    #[test]
    fn re_registration_replaces_cached_instance() {
        let registry = TransportRegistry::new();
        registry.register_instance(Arc::new(Fixed("wss")));
        let before = registry.get("wss").unwrap();

        let built = Arc::new(AtomicUsize::new(0));
        registry.register(counting_factory("wss", Arc::clone(&built)));
        let after = registry.get("wss").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_and_listing() {
        let registry = TransportRegistry::new();
        registry.register_instance(Arc::new(Fixed("https")));
        registry.register_instance(Arc::new(Fixed("local")));
        registry.set_alias("ws", "local");

        assert_eq!(
            registry.list_supported_protocols(),
            vec!["agent", "https", "local", "ws"]
        );

        assert!(registry.unregister("https"));
        assert!(!registry.unregister("https"));
        assert_eq!(registry.list_supported_protocols(), vec!["local", "ws"]);
    }

    #[test]
    fn factory_errors_propagate_and_are_retried() {
        let registry = TransportRegistry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        registry.register(factory_fn("wss", move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::configuration("missing endpoint"))
        }));

        assert_eq!(
            registry.get("wss").err().unwrap().kind(),
            ErrorKind::Configuration
        );
        assert!(registry.get("wss").is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_lookups_share_instance() {
        let registry = Arc::new(TransportRegistry::new());
        let built = Arc::new(AtomicUsize::new(0));
        registry.register(counting_factory("local", Arc::clone(&built)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.get("local").unwrap())
            })
            .collect();
        let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
