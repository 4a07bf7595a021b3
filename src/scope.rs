//! Parent/child service scopes used to construct work handlers.
//!
//! A scope is a typed map of shared services with an optional parent;
//! lookups walk the parent chain. The worker session builds a child scope on
//! top of the scope it was handed, exposing the argument-codec registry, the
//! metadata cache, the problem reporter, and the code resolver to handler
//! factories.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ServiceScope {
    parent: Option<Arc<ServiceScope>>,
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceScope {
    /// Start building a root scope with no parent.
    pub fn root() -> ServiceScopeBuilder {
        ServiceScopeBuilder {
            parent: None,
            entries: HashMap::new(),
        }
    }

    /// Start building a child of `parent`. Registrations in the child shadow
    /// the parent's for the same type.
    pub fn child_of(parent: &Arc<ServiceScope>) -> ServiceScopeBuilder {
        ServiceScopeBuilder {
            parent: Some(Arc::clone(parent)),
            entries: HashMap::new(),
        }
    }

    /// Look up a service by type, walking up the parent chain.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        if let Some(entry) = self.entries.get(&TypeId::of::<T>()) {
            return Arc::clone(entry).downcast::<T>().ok();
        }
        self.parent.as_ref().and_then(|parent| parent.get::<T>())
    }
}

pub struct ServiceScopeBuilder {
    parent: Option<Arc<ServiceScope>>,
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceScopeBuilder {
    /// Register a singleton service instance.
    pub fn register<T: Send + Sync + 'static>(mut self, value: Arc<T>) -> Self {
        self.entries.insert(TypeId::of::<T>(), value);
        self
    }

    pub fn build(self) -> Arc<ServiceScope> {
        Arc::new(ServiceScope {
            parent: self.parent,
            entries: self.entries,
        })
    }
}
