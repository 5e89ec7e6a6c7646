use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::RoutingError;
use crate::executor::ExecutorBackend;
use crate::run::Namespace;

/// A resolved backend and the name it was registered under.
#[derive(Clone)]
pub struct Route {
    pub name: String,
    pub backend: Arc<dyn ExecutorBackend>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route").field("name", &self.name).finish()
    }
}

#[derive(Default)]
struct RoutingTable {
    backends: HashMap<String, Arc<dyn ExecutorBackend>>,
    namespace_overrides: HashMap<Namespace, String>,
    default_backend: Option<String>,
}

/// Read-mostly table selecting the executor backend for each run.
///
/// Resolution order: the backend named on the request, then the namespace
/// override, then the default. The first backend registered becomes the
/// default unless one is set explicitly.
#[derive(Default)]
pub struct ExecutorRouter {
    table: RwLock<RoutingTable>,
}

impl fmt::Debug for ExecutorRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        let mut names: Vec<&String> = table.backends.keys().collect();
        names.sort();
        f.debug_struct("ExecutorRouter")
            .field("backends", &names)
            .field("overrides", &table.namespace_overrides.len())
            .field("default", &table.default_backend)
            .finish()
    }
}

impl ExecutorRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, backend: Arc<dyn ExecutorBackend>) {
        let name = name.into();
        let mut table = self.table.write();
        if table.default_backend.is_none() {
            table.default_backend = Some(name.clone());
        }
        tracing::info!(backend = %name, "executor backend registered");
        table.backends.insert(name, backend);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_backend(self, name: impl Into<String>, backend: Arc<dyn ExecutorBackend>) -> Self {
        self.register(name, backend);
        self
    }

    pub fn set_default(&self, name: impl Into<String>) -> Result<(), RoutingError> {
        let name = name.into();
        let mut table = self.table.write();
        if !table.backends.contains_key(&name) {
            return Err(RoutingError::UnknownBackend(name));
        }
        table.default_backend = Some(name);
        Ok(())
    }

    /// Send every run in `namespace` to `name` unless the request says otherwise.
    pub fn route_namespace(&self, namespace: Namespace, name: impl Into<String>) {
        self.table
            .write()
            .namespace_overrides
            .insert(namespace, name.into());
    }

    pub fn clear_namespace_route(&self, namespace: &Namespace) {
        self.table.write().namespace_overrides.remove(namespace);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn ExecutorBackend>> {
        let mut table = self.table.write();
        if table.default_backend.as_deref() == Some(name) {
            table.default_backend = None;
        }
        table.backends.remove(name)
    }

    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.read().backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn resolve(
        &self,
        requested: Option<&str>,
        namespace: &Namespace,
    ) -> Result<Route, RoutingError> {
        let table = self.table.read();
        let name = requested
            .map(str::to_string)
            .or_else(|| table.namespace_overrides.get(namespace).cloned())
            .or_else(|| table.default_backend.clone())
            .ok_or(RoutingError::NoBackend)?;

        let backend = table
            .backends
            .get(&name)
            .cloned()
            .ok_or_else(|| RoutingError::UnknownBackend(name.clone()))?;
        Ok(Route { name, backend })
    }
}
