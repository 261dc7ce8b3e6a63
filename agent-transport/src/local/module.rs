//! Loadable units of callables addressed by dotted paths.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use super::callable::Callable;

/// One named attribute of a module.
#[derive(Debug, Clone)]
pub enum Member {
    /// An invocable capability.
    Callable(Arc<Callable>),
    /// A nested namespace.
    Module(Module),
    /// A plain value; not invocable.
    Constant(Value),
}

/// A namespace of callables, nested modules and constants.
#[derive(Debug, Clone, Default)]
pub struct Module {
    members: BTreeMap<String, Member>,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callable under `name`.
    #[must_use]
    pub fn with_callable(mut self, name: impl Into<String>, callable: Callable) -> Self {
        self.members
            .insert(name.into(), Member::Callable(Arc::new(callable)));
        self
    }

    /// Adds a nested module under `name`.
    #[must_use]
    pub fn with_module(mut self, name: impl Into<String>, module: Module) -> Self {
        self.members.insert(name.into(), Member::Module(module));
        self
    }

    /// Adds a constant under `name`.
    #[must_use]
    pub fn with_constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.members
            .insert(name.into(), Member::Constant(value.into()));
        self
    }

    /// Looks up a direct member.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Names of the direct members, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }
}

/// Produces a module on demand. Loaders run at most once per resolution of
/// an uncached path.
pub type ModuleLoader = Arc<dyn Fn() -> Result<Module, String> + Send + Sync>;

/// A module registered at link time with [`inventory::submit!`].
///
/// ```ignore
/// inventory::submit! {
///     StaticModule::new("text.tools", text_tools)
/// }
/// ```
pub struct StaticModule {
    path: &'static str,
    loader: fn() -> Result<Module, String>,
}

impl StaticModule {
    /// Declares a module at `path` built by `loader`.
    #[must_use]
    pub const fn new(path: &'static str, loader: fn() -> Result<Module, String>) -> Self {
        Self { path, loader }
    }

    /// Returns the dotted path the module is registered under.
    #[must_use]
    pub const fn path(&self) -> &'static str {
        self.path
    }
}

inventory::collect!(StaticModule);

/// Modules importable by the local binding, keyed by dotted path.
///
/// Runtime registrations take precedence over link-time [`StaticModule`]s
/// with the same path.
#[derive(Default)]
pub struct ModuleCatalog {
    loaders: RwLock<HashMap<String, ModuleLoader>>,
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("modules", &self.paths())
            .finish()
    }
}

impl ModuleCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loader for `path`, replacing any previous one.
    pub fn register_loader<F>(&self, path: impl Into<String>, loader: F)
    where
        F: Fn() -> Result<Module, String> + Send + Sync + 'static,
    {
        let path = path.into();
        debug!(%path, "module registered");
        self.loaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, Arc::new(loader));
    }

    /// Registers an already-built module for `path`.
    pub fn register_module(&self, path: impl Into<String>, module: Module) {
        self.register_loader(path, move || Ok(module.clone()));
    }

    /// Removes the runtime registration for `path`. Returns `true` if one existed.
    pub fn unregister(&self, path: &str) -> bool {
        self.loaders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }

    /// Returns `true` if a module is importable at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.loader(path).is_some()
    }

    /// Every importable path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .loaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        paths.extend(
            inventory::iter::<StaticModule>
                .into_iter()
                .map(|module| module.path.to_owned()),
        );
        paths.sort();
        paths.dedup();
        paths
    }

    /// Imports the module at `path`. `None` means nothing is registered there;
    /// `Some(Err(_))` means the loader failed.
    pub(crate) fn load(&self, path: &str) -> Option<Result<Module, String>> {
        self.loader(path).map(|loader| loader())
    }

    fn loader(&self, path: &str) -> Option<ModuleLoader> {
        let runtime = self
            .loaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned();
        runtime.or_else(|| {
            inventory::iter::<StaticModule>
                .into_iter()
                .find(|module| module.path == path)
                .map(|module| {
                    let build = module.loader;
                    Arc::new(build) as ModuleLoader
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::Signature;

    fn constants() -> Result<Module, String> {
        Ok(Module::new().with_constant("answer", 42))
    }

    inventory::submit! {
        StaticModule::new("linked.constants", constants)
    }

    #[test]
    fn runtime_modules_are_listed_and_loaded() {
        let catalog = ModuleCatalog::new();
        catalog.register_module(
            "tools",
            Module::new().with_callable("noop", Callable::plain(Signature::new(), |_| Ok(Value::Null))),
        );

        assert!(catalog.contains("tools"));
        let module = catalog.load("tools").unwrap().unwrap();
        assert_eq!(module.names().collect::<Vec<_>>(), vec!["noop"]);
        assert!(catalog.load("missing").is_none());
    }

    #[test]
    fn loader_failures_are_reported() {
        let catalog = ModuleCatalog::new();
        catalog.register_loader("broken", || Err("dependency unavailable".into()));
        assert_eq!(
            catalog.load("broken").unwrap().unwrap_err(),
            "dependency unavailable"
        );
    }

    #[test]
    fn link_time_modules_are_visible() {
        let catalog = ModuleCatalog::new();
        assert!(catalog.paths().contains(&"linked.constants".to_owned()));
        let module = catalog.load("linked.constants").unwrap().unwrap();
        assert!(matches!(module.get("answer"), Some(Member::Constant(_))));
    }

    #[test]
    fn unregister_removes_runtime_modules() {
        let catalog = ModuleCatalog::new();
        catalog.register_module("tmp", Module::new());
        assert!(catalog.unregister("tmp"));
        assert!(!catalog.contains("tmp"));
        assert!(!catalog.unregister("tmp"));
    }
}
