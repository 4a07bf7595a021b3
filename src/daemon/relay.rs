//! Log correlation adapter.
//!
//! Routes log output produced during a request through the same sink as, and
//! strictly before, that request's response. The relay owns the "current
//! operation" slot; [`WorkerSession::run`](super::session::WorkerSession::run)
//! enters an operation for the duration of a request via a scope guard, and
//! the [`RelayLayer`] installed in the worker's tracing subscriber tags every
//! log event with whatever operation is current - including events emitted by
//! code with no awareness of request boundaries.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::Level;
use tracing_subscriber::layer::Context;

use super::protocol::{LogEvent, OperationId, Response, WorkerEvent};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("correlation context poisoned")]
    Poisoned,
}

struct RelayInner {
    sink: UnboundedSender<WorkerEvent>,
    current: Mutex<Option<OperationId>>,
}

/// Shared handle to the worker's single outgoing event channel.
#[derive(Clone)]
pub struct LogRelay {
    inner: Arc<RelayInner>,
}

impl LogRelay {
    pub fn new(sink: UnboundedSender<WorkerEvent>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                sink,
                current: Mutex::new(None),
            }),
        }
    }

    /// Enter `operation` for the duration of the returned guard. The guard
    /// clears the slot on drop, so the operation is released on every exit
    /// path.
    pub fn enter(&self, operation: OperationId) -> Result<OperationGuard<'_>, RelayError> {
        let mut slot = self
            .inner
            .current
            .lock()
            .map_err(|_| RelayError::Poisoned)?;
        *slot = Some(operation);
        drop(slot);
        Ok(OperationGuard { relay: self })
    }

    /// The operation currently being executed, if any.
    pub fn current(&self) -> Option<OperationId> {
        self.inner.current.lock().ok().and_then(|slot| *slot)
    }

    /// Clear any ambient operation. Safe to call from any thread.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.inner.current.lock() {
            *slot = None;
        }
    }

    /// Queue a log line behind any output already queued and ahead of any
    /// later response. Best effort: a closed sink means the controller is
    /// gone and there is nobody left to log to.
    pub fn log(&self, level: Level, message: String) {
        let event = LogEvent {
            operation: self.current(),
            level: level.to_string(),
            message,
        };
        let _ = self.inner.sink.send(WorkerEvent::Log(event));
    }

    /// Queue a response. Returns false if the sink is closed.
    pub fn respond(&self, response: Response) -> bool {
        self.inner.sink.send(WorkerEvent::Response(response)).is_ok()
    }
}

pub struct OperationGuard<'a> {
    relay: &'a LogRelay,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.relay.clear();
    }
}

/// Problem-reporting facade handed to work handlers through the service
/// scope. Reports travel the response channel, so they interleave correctly
/// with request outcomes on the receiving side.
#[derive(Clone)]
pub struct ProblemReporter {
    relay: LogRelay,
}

impl ProblemReporter {
    pub fn new(relay: LogRelay) -> Self {
        Self { relay }
    }

    pub fn report(&self, message: impl Into<String>) {
        self.relay.log(Level::WARN, message.into());
    }
}

/// Tracing layer that forwards formatted events into the relay.
///
/// Installed in the worker binary's subscriber alongside the file layer, so
/// ordinary `tracing` macros in work implementations reach the controller
/// without those implementations knowing about the transport.
pub struct RelayLayer {
    relay: LogRelay,
}

impl RelayLayer {
    pub fn new(relay: LogRelay) -> Self {
        Self { relay }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::layer::Layer<S> for RelayLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if !visitor.message.is_empty() {
            self.relay.log(*event.metadata().level(), visitor.message);
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::Outcome;
    use tokio::sync::mpsc;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_guard_clears_on_drop() {
        let (sink, _events) = mpsc::unbounded_channel();
        let relay = LogRelay::new(sink);
        let operation = OperationId::new();

        {
            let _guard = relay.enter(operation).unwrap();
            assert_eq!(relay.current(), Some(operation));
        }
        assert_eq!(relay.current(), None);
    }

    #[test]
    fn test_log_tagged_with_current_operation() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let relay = LogRelay::new(sink);
        let operation = OperationId::new();

        relay.log(Level::INFO, "before".into());
        {
            let _guard = relay.enter(operation).unwrap();
            relay.log(Level::INFO, "during".into());
        }

        let WorkerEvent::Log(before) = events.try_recv().unwrap() else {
            panic!("expected Log");
        };
        assert_eq!(before.operation, None);

        let WorkerEvent::Log(during) = events.try_recv().unwrap() else {
            panic!("expected Log");
        };
        assert_eq!(during.operation, Some(operation));
        assert_eq!(during.level, "INFO");
    }

    #[test]
    fn test_logs_precede_response_in_channel_order() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let relay = LogRelay::new(sink);
        let operation = OperationId::new();

        {
            let _guard = relay.enter(operation).unwrap();
            relay.log(Level::INFO, "working".into());
        }
        relay.respond(Response {
            operation,
            outcome: Outcome::Completed {
                result: serde_json::json!(null),
            },
        });

        assert!(matches!(events.try_recv().unwrap(), WorkerEvent::Log(_)));
        assert!(matches!(
            events.try_recv().unwrap(),
            WorkerEvent::Response(_)
        ));
    }

    #[test]
    fn test_relay_layer_forwards_tracing_events() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let relay = LogRelay::new(sink);
        let subscriber =
            tracing_subscriber::registry().with(RelayLayer::new(relay.clone()));

        let operation = OperationId::new();
        tracing::subscriber::with_default(subscriber, || {
            let _guard = relay.enter(operation).unwrap();
            tracing::info!("from unaware code");
        });

        let WorkerEvent::Log(log) = events.try_recv().unwrap() else {
            panic!("expected Log");
        };
        assert_eq!(log.operation, Some(operation));
        assert_eq!(log.message, "from unaware code");
    }

    #[test]
    fn test_problem_reporter_uses_response_channel() {
        let (sink, mut events) = mpsc::unbounded_channel();
        let relay = LogRelay::new(sink);
        let reporter = ProblemReporter::new(relay);

        reporter.report("work input looks odd");

        let WorkerEvent::Log(log) = events.try_recv().unwrap() else {
            panic!("expected Log");
        };
        assert_eq!(log.level, "WARN");
        assert_eq!(log.message, "work input looks odd");
    }
}
