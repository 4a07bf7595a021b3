//! Code-resolution policies for the worker's two namespaces.
//!
//! The bootstrap namespace holds the handlers needed to run the session
//! itself and is always resolvable. How work kinds resolve depends on the
//! isolation mode chosen at daemon start:
//!
//! - [`IsolationMode::Flat`]: work kinds are pre-declared at spawn time into
//!   a namespace shared with the bootstrap kinds. No per-request
//!   declarations; lowest per-request overhead. Intended for trusted,
//!   high-volume work.
//! - [`IsolationMode::Hierarchical`]: work kinds stay out of the bootstrap
//!   namespace and must be declared on each request, preserving isolation at
//!   a performance cost.
//!
//! A work-namespace resolution failure during request execution is the
//! signal for a misconfigured isolation boundary, and the session reports it
//! as an infrastructure failure rather than a work failure.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::WorkError;
use crate::work::{HandlerFactory, WorkRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Work kinds share a namespace with the worker runtime.
    Flat,
    /// Work kinds are kept separate and supplied per request.
    Hierarchical,
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMode::Flat => f.write_str("flat"),
            IsolationMode::Hierarchical => f.write_str("hierarchical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Bootstrap,
    Work,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Bootstrap => f.write_str("bootstrap"),
            Namespace::Work => f.write_str("work"),
        }
    }
}

/// Resolution policy behind both isolation modes.
pub trait CodeResolver: Send + Sync {
    fn bootstrap(&self) -> &WorkRegistry;

    /// Resolve a kind in the work namespace, given whatever declaration the
    /// request carried.
    fn resolve_work(
        &self,
        kind: &str,
        manifest: Option<&[String]>,
    ) -> Result<Arc<dyn HandlerFactory>, WorkError>;

    /// Resolve a kind, consulting the bootstrap namespace first.
    fn resolve(
        &self,
        kind: &str,
        manifest: Option<&[String]>,
    ) -> Result<Arc<dyn HandlerFactory>, WorkError> {
        if let Some(factory) = self.bootstrap().get(kind) {
            return Ok(factory);
        }
        self.resolve_work(kind, manifest)
    }

    /// Resolve a kind that must live in the bootstrap namespace.
    fn resolve_bootstrap(&self, kind: &str) -> Result<Arc<dyn HandlerFactory>, WorkError> {
        self.bootstrap()
            .get(kind)
            .ok_or_else(|| WorkError::TypeNotFound {
                kind: kind.to_string(),
                namespace: Namespace::Bootstrap,
            })
    }
}

/// Newtype so the resolver can be registered in a service scope.
pub struct ResolverHandle(pub Arc<dyn CodeResolver>);

/// Flat mode: the work namespace was fixed when the process was spawned.
pub struct SharedNamespace {
    bootstrap: WorkRegistry,
    work: WorkRegistry,
}

impl CodeResolver for SharedNamespace {
    fn bootstrap(&self) -> &WorkRegistry {
        &self.bootstrap
    }

    fn resolve_work(
        &self,
        kind: &str,
        _manifest: Option<&[String]>,
    ) -> Result<Arc<dyn HandlerFactory>, WorkError> {
        self.work.get(kind).ok_or_else(|| WorkError::TypeNotFound {
            kind: kind.to_string(),
            namespace: Namespace::Work,
        })
    }
}

/// Hierarchical mode: the catalog is only reachable through a per-request
/// declaration. Bootstrap kinds stay resolvable regardless.
pub struct IsolatedNamespace {
    bootstrap: WorkRegistry,
    catalog: WorkRegistry,
}

impl CodeResolver for IsolatedNamespace {
    fn bootstrap(&self) -> &WorkRegistry {
        &self.bootstrap
    }

    fn resolve_work(
        &self,
        kind: &str,
        manifest: Option<&[String]>,
    ) -> Result<Arc<dyn HandlerFactory>, WorkError> {
        let declared = manifest
            .map(|kinds| kinds.iter().any(|k| k == kind))
            .unwrap_or(false);
        if declared
            && let Some(factory) = self.catalog.get(kind)
        {
            return Ok(factory);
        }
        Err(WorkError::TypeNotFound {
            kind: kind.to_string(),
            namespace: Namespace::Work,
        })
    }
}

/// Build the resolver for an isolation mode. `predeclared` names the work
/// kinds pre-declared at spawn time; it is only meaningful in flat mode.
pub fn resolver_for(
    mode: IsolationMode,
    bootstrap: WorkRegistry,
    catalog: WorkRegistry,
    predeclared: &[String],
) -> Arc<dyn CodeResolver> {
    match mode {
        IsolationMode::Flat => Arc::new(SharedNamespace {
            bootstrap,
            work: catalog.filtered(predeclared),
        }),
        IsolationMode::Hierarchical => Arc::new(IsolatedNamespace {
            bootstrap,
            catalog,
        }),
    }
}
