//! Work handler abstractions.
//!
//! A work kind is identified by a string id and backed by a
//! [`HandlerFactory`] registered at compile time in a [`WorkRegistry`]. The
//! factory/registry pair stands in for reflective, annotation-driven
//! instantiation: handlers are constructed explicitly against the worker's
//! service scope, never resolved by runtime type name.

pub mod builtin;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::WorkError;
use crate::isolation::ResolverHandle;
use crate::scope::ServiceScope;

/// Bootstrap handler id served by a worker session unless overridden.
pub const DISPATCHER_KIND: &str = "core.dispatch";

/// User-supplied logic executed once per request inside the worker process.
pub trait WorkHandler: Send + Sync {
    fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, WorkError>;
}

/// Builds handler instances inside the worker's service scope. Factories are
/// the injection seam: anything a handler needs it pulls from the scope here.
pub trait HandlerFactory: Send + Sync {
    fn metadata(&self) -> HandlerMetadata;
    fn create(&self, services: &Arc<ServiceScope>) -> Result<Box<dyn WorkHandler>, WorkError>;
}

impl std::fmt::Debug for dyn HandlerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerFactory")
            .field("metadata", &self.metadata())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HandlerMetadata {
    pub kind: String,
    pub display_name: String,
}

/// Registry of handler factories keyed by work kind.
#[derive(Default, Clone)]
pub struct WorkRegistry {
    factories: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn HandlerFactory>) {
        self.factories.insert(factory.metadata().kind, factory);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.factories.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// A copy of this registry restricted to the named kinds. Unknown names
    /// are ignored; they surface later as type-not-found on resolution.
    pub fn filtered(&self, kinds: &[String]) -> WorkRegistry {
        let factories = self
            .factories
            .iter()
            .filter(|(kind, _)| kinds.iter().any(|k| k == *kind))
            .map(|(kind, factory)| (kind.clone(), Arc::clone(factory)))
            .collect();
        WorkRegistry { factories }
    }
}

/// Non-evicting, concurrency-safe cache of handler metadata.
///
/// Simpler than a long-lived daemon's cache: this process lives for exactly
/// one session, so entries are held strongly and never evicted. Nested
/// handler construction can race on insertion even under single-request
/// delivery; the first insert wins.
#[derive(Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<String, Arc<HandlerMetadata>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(
        &self,
        kind: &str,
        describe: impl FnOnce() -> HandlerMetadata,
    ) -> Arc<HandlerMetadata> {
        if let Ok(entries) = self.entries.read()
            && let Some(found) = entries.get(kind)
        {
            return Arc::clone(found);
        }
        let metadata = Arc::new(describe());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(entries.entry(kind.to_string()).or_insert(metadata))
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The payload shape understood by the dispatcher: which work kind to run,
/// its input, and (isolated namespace only) the per-request declaration of
/// allowed work kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    pub kind: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Vec<String>>,
}

impl WorkSpec {
    pub fn new(kind: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            input,
            manifest: None,
        }
    }

    pub fn with_manifest(mut self, manifest: Vec<String>) -> Self {
        self.manifest = Some(manifest);
        self
    }
}

/// Bootstrap handler that resolves the requested work kind through the
/// session's code-resolution policy and runs it.
///
/// This is the piece that must be loadable before any request arrives; the
/// actual work kind is named inside each request's payload and resolved per
/// request, which is what keeps the isolated namespace honest.
pub struct DispatchHandler {
    resolver: Arc<ResolverHandle>,
    cache: Arc<MetadataCache>,
    services: Arc<ServiceScope>,
}

impl WorkHandler for DispatchHandler {
    fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, WorkError> {
        let spec: WorkSpec = serde_json::from_value(input)
            .map_err(|e| WorkError::InvalidArgument(e.to_string()))?;
        let factory = self.resolver.0.resolve(&spec.kind, spec.manifest.as_deref())?;
        let metadata = self
            .cache
            .get_or_insert_with(&spec.kind, || factory.metadata());
        tracing::debug!(kind = %metadata.kind, "dispatching work item");
        let handler = factory.create(&self.services)?;
        handler.execute(spec.input)
    }
}

pub struct DispatchFactory;

impl HandlerFactory for DispatchFactory {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            kind: DISPATCHER_KIND.to_string(),
            display_name: "work dispatcher".to_string(),
        }
    }

    fn create(&self, services: &Arc<ServiceScope>) -> Result<Box<dyn WorkHandler>, WorkError> {
        let missing = |service: &str| WorkError::Instantiation {
            kind: DISPATCHER_KIND.to_string(),
            reason: format!("{service} not registered in service scope"),
        };
        let resolver = services
            .get::<ResolverHandle>()
            .ok_or_else(|| missing("code resolver"))?;
        let cache = services
            .get::<MetadataCache>()
            .ok_or_else(|| missing("metadata cache"))?;
        Ok(Box::new(DispatchHandler {
            resolver,
            cache,
            services: Arc::clone(services),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_registry_register_and_filter() {
        let mut registry = builtin::catalog();
        registry.register(Arc::new(DispatchFactory));
        assert!(registry.contains(DISPATCHER_KIND));

        let filtered = registry.filtered(&["arith.double".to_string(), "nope".to_string()]);
        assert!(filtered.contains("arith.double"));
        assert!(!filtered.contains("arith.fail"));
        assert!(!filtered.contains("nope"));
    }

    #[test]
    fn test_metadata_cache_computes_once() {
        let cache = MetadataCache::new();
        let calls = AtomicUsize::new(0);
        let describe = || {
            calls.fetch_add(1, Ordering::SeqCst);
            HandlerMetadata {
                kind: "arith.double".to_string(),
                display_name: "double".to_string(),
            }
        };

        let first = cache.get_or_insert_with("arith.double", describe);
        let second = cache.get_or_insert_with("arith.double", describe);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_work_spec_manifest_optional_on_wire() {
        let spec = WorkSpec::new("arith.double", serde_json::json!(5));
        let json = serde_json::to_string(&spec).unwrap();
        assert!(!json.contains("manifest"));

        let spec = spec.with_manifest(vec!["arith.double".to_string()]);
        let json = serde_json::to_string(&spec).unwrap();
        let decoded: WorkSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.manifest.unwrap(), vec!["arith.double"]);
    }
}
