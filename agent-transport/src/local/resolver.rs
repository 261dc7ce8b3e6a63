//! Dotted-path resolution with a process-lifetime cache.
//!
//! A path such as `text.tools.Summarizer.run` resolves in two stages. First
//! the longest prefix that names a registered module is imported
//! (`text.tools`); then the remaining segments are walked as attributes
//! (`Summarizer`, then `run`). Every segment but the last must be a nested
//! module and the last must be a callable.
//!
//! Loaders run outside the cache lock. Concurrent first resolutions of one
//! path wait on a per-path gate, so each path is loaded once while lookups of
//! other paths proceed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::debug;

use super::callable::{Callable, ShapeKind};
use super::module::{Member, Module, ModuleCatalog};
use crate::error::{TransportError, TransportResult};

/// A callable found at a fully qualified path.
#[derive(Debug)]
pub struct ResolvedCallable {
    path: String,
    module_path: String,
    callable: Arc<Callable>,
}

impl ResolvedCallable {
    /// Fully qualified path the callable was resolved from.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path of the module that was imported to reach the callable.
    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    /// The callable itself.
    #[must_use]
    pub fn callable(&self) -> &Arc<Callable> {
        &self.callable
    }

    /// Execution shape of the callable.
    #[must_use]
    pub fn kind(&self) -> ShapeKind {
        self.callable.kind()
    }
}

/// Joins a capability onto the endpoint's base namespace.
pub(crate) fn qualify(capability: &str, base: Option<&str>) -> String {
    match base.map(str::trim).filter(|base| !base.is_empty()) {
        Some(base) => format!("{base}.{capability}"),
        None => capability.to_owned(),
    }
}

pub(crate) struct Resolver {
    catalog: Arc<ModuleCatalog>,
    cache: RwLock<HashMap<String, Arc<ResolvedCallable>>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Bumped on every eviction so a load that raced one is not cached.
    generation: AtomicU64,
}

impl Resolver {
    pub(crate) fn new(catalog: Arc<ModuleCatalog>) -> Self {
        Self {
            catalog,
            cache: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the cached resolution of `path` without loading anything.
    pub(crate) fn cached(&self, path: &str) -> Option<Arc<ResolvedCallable>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Resolves `path`, consulting the cache first. Entries stay valid until
    /// explicitly evicted.
    pub(crate) fn resolve(&self, path: &str) -> TransportResult<Arc<ResolvedCallable>> {
        if let Some(hit) = self.cached(path) {
            return Ok(hit);
        }

        let gate = Arc::clone(
            self.gates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(path.to_owned())
                .or_default(),
        );
        let _loading = gate.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have resolved it while we waited at the gate.
        if let Some(hit) = self.cached(path) {
            return Ok(hit);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let outcome = self.resolve_uncached(path).map(Arc::new);
        if let Ok(resolved) = &outcome {
            debug!(%path, module = %resolved.module_path, kind = ?resolved.kind(), "callable resolved");
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            if self.generation.load(Ordering::Acquire) == generation {
                cache.insert(path.to_owned(), Arc::clone(resolved));
            }
        }

        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if gates.get(path).is_some_and(|current| Arc::ptr_eq(current, &gate)) {
            gates.remove(path);
        }
        outcome
    }

    fn resolve_uncached(&self, path: &str) -> TransportResult<ResolvedCallable> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|segment| segment.trim().is_empty()) {
            return Err(TransportError::resolution(
                path,
                "path contains an empty segment",
            ));
        }
        if segments.len() < 2 {
            return Err(TransportError::resolution(
                path,
                "path must name a module and a symbol inside it",
            ));
        }

        for split in (1..segments.len()).rev() {
            let module_path = segments[..split].join(".");
            match self.catalog.load(&module_path) {
                None => continue,
                Some(Err(reason)) => {
                    return Err(TransportError::resolution(
                        path,
                        format!("failed to import module `{module_path}`: {reason}"),
                    ));
                }
                Some(Ok(module)) => {
                    let callable = lookup(&module, &module_path, &segments[split..])
                        .map_err(|reason| TransportError::resolution(path, reason))?;
                    callable
                        .signature()
                        .check()
                        .map_err(|reason| TransportError::resolution(path, reason))?;
                    return Ok(ResolvedCallable {
                        path: path.to_owned(),
                        module_path,
                        callable,
                    });
                }
            }
        }

        let attempted = segments[..segments.len() - 1].join(".");
        Err(TransportError::resolution(
            path,
            format!("failed to import module `{attempted}`: no such module"),
        ))
    }

    pub(crate) fn clear(&self) -> usize {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let evicted = cache.len();
        cache.clear();
        evicted
    }

    /// Evicts every entry at or below `namespace`.
    pub(crate) fn evict_namespace(&self, namespace: &str) -> usize {
        let prefix = format!("{namespace}.");
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = cache.len();
        cache.retain(|path, _| path != namespace && !path.starts_with(&prefix));
        before - cache.len()
    }

    pub(crate) fn cached_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub(crate) fn is_cached(&self, path: &str) -> bool {
        self.cached(path).is_some()
    }
}

/// Walks `attributes` from `module`, returning the final callable.
fn lookup(module: &Module, module_path: &str, attributes: &[&str]) -> Result<Arc<Callable>, String> {
    let Some((last, parents)) = attributes.split_last() else {
        return Err("path must name a symbol inside the module".into());
    };

    let mut current = module;
    let mut walked = module_path.to_owned();
    for name in parents {
        match current.get(name) {
            Some(Member::Module(inner)) => current = inner,
            Some(_) => return Err(format!("attribute `{name}` of `{walked}` is not a namespace")),
            None => return Err(format!("attribute `{name}` not found in `{walked}`")),
        }
        walked.push('.');
        walked.push_str(name);
    }

    match current.get(last) {
        Some(Member::Callable(callable)) => Ok(Arc::clone(callable)),
        Some(_) => Err(format!("attribute `{last}` is not callable")),
        None => Err(format!("function `{last}` not found in module `{walked}`")),
    }
}
