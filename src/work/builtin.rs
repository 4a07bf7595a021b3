//! Compiled-in work handlers.
//!
//! The bootstrap registry holds the kinds the session itself needs; the
//! catalog holds the work kinds a daemon may be asked to run. Which catalog
//! entries are actually resolvable is decided by the isolation mode, not
//! here.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::{DispatchFactory, HandlerFactory, HandlerMetadata, WorkHandler, WorkRegistry};
use crate::error::WorkError;
use crate::scope::ServiceScope;

/// Work kinds required to bootstrap a session.
pub fn bootstrap() -> WorkRegistry {
    let mut registry = WorkRegistry::new();
    registry.register(Arc::new(DispatchFactory));
    registry
}

/// All work kinds this binary can execute.
pub fn catalog() -> WorkRegistry {
    let mut registry = WorkRegistry::new();
    registry.register(simple("arith.double", "double an integer", || {
        Box::new(DoubleHandler)
    }));
    registry.register(simple("arith.fail", "fail with a message", || {
        Box::new(FailHandler)
    }));
    registry.register(simple("clock.sleep", "sleep for some milliseconds", || {
        Box::new(SleepHandler)
    }));
    registry.register(simple(
        "proc.halt",
        "terminate the worker process immediately",
        || Box::new(HaltHandler),
    ));
    registry
}

fn simple(
    kind: &'static str,
    display_name: &'static str,
    build: fn() -> Box<dyn WorkHandler>,
) -> Arc<dyn HandlerFactory> {
    Arc::new(SimpleFactory {
        kind,
        display_name,
        build,
    })
}

struct SimpleFactory {
    kind: &'static str,
    display_name: &'static str,
    build: fn() -> Box<dyn WorkHandler>,
}

impl HandlerFactory for SimpleFactory {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata {
            kind: self.kind.to_string(),
            display_name: self.display_name.to_string(),
        }
    }

    fn create(&self, _services: &Arc<ServiceScope>) -> Result<Box<dyn WorkHandler>, WorkError> {
        Ok((self.build)())
    }
}

struct DoubleHandler;

impl WorkHandler for DoubleHandler {
    fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, WorkError> {
        let n = input
            .as_i64()
            .ok_or_else(|| WorkError::InvalidArgument(format!("expected an integer, got {input}")))?;
        tracing::info!("doubling {n}");
        Ok(json!(n * 2))
    }
}

struct FailHandler;

impl WorkHandler for FailHandler {
    fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, WorkError> {
        let message = input
            .as_str()
            .unwrap_or("work failed without a message")
            .to_string();
        Err(WorkError::Domain(message))
    }
}

struct SleepHandler;

impl WorkHandler for SleepHandler {
    fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, WorkError> {
        let millis = input
            .as_u64()
            .ok_or_else(|| WorkError::InvalidArgument("expected milliseconds".to_string()))?;
        // Handlers run on the blocking pool, so a plain sleep is fine here
        std::thread::sleep(Duration::from_millis(millis));
        Ok(json!(millis))
    }
}

/// Ends the worker process without emitting a response. Exists to drill the
/// controller's handling of a daemon dying mid-request; the pending execute
/// must resolve to a lost-daemon error rather than hang.
struct HaltHandler;

impl WorkHandler for HaltHandler {
    fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, WorkError> {
        let code = input.as_i64().unwrap_or(1) as i32;
        tracing::warn!("halting worker process with code {code}");
        std::process::exit(code);
    }
}
