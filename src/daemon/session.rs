//! Worker-side request executor.
//!
//! Exactly one [`WorkerSession`] exists per worker process. It owns the work
//! implementation instance, the outgoing event channel (shared with the log
//! relay), and the termination gate. Requests are delivered one at a time;
//! each emits exactly one response, always after all log output produced
//! while it ran. The session's main path blocks only on the termination
//! gate.

use std::any::Any;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use tokio::net::UnixStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use super::codec::{ArgumentCodecs, CodecMode};
use super::protocol::{
    self, Outcome, RemoteFailure, Request, Response, WorkerEvent, WorkerRequest,
};
use super::relay::{LogRelay, ProblemReporter};
use crate::error::{CrucibleError, WorkError};
use crate::isolation::{CodeResolver, ResolverHandle};
use crate::scope::ServiceScope;
use crate::work::{MetadataCache, WorkHandler};

/// Releases exactly once no matter how many signals request termination.
pub struct TerminationGate {
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl TerminationGate {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Release the gate. Returns true only for the call that actually
    /// released it.
    pub fn release(&self) -> bool {
        let mut slot = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

pub struct WorkerSession {
    /// None when initialization failed; requests are then dropped silently.
    implementation: Option<Box<dyn WorkHandler>>,
    codec_mode: CodecMode,
    relay: LogRelay,
    gate: TerminationGate,
}

impl WorkerSession {
    /// Build the session for this process.
    ///
    /// Constructs a child service scope exposing the argument-codec registry,
    /// the metadata cache, the problem reporter, and the code resolver, then
    /// instantiates the bootstrap work implementation from it. On failure the
    /// session enters permanent failure mode: a single startup notice is
    /// emitted and every later request is dropped without execution or
    /// response, with the argument codec switched to discard-only.
    ///
    /// Returns the session and the receiver side of its termination gate.
    pub fn initialize(
        bootstrap_kind: &str,
        parent: &Arc<ServiceScope>,
        resolver: Arc<dyn CodeResolver>,
        relay: LogRelay,
    ) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (gate, released) = TerminationGate::new();
        let codecs = Arc::new(ArgumentCodecs::new());
        let cache = Arc::new(MetadataCache::new());
        let scope = ServiceScope::child_of(parent)
            .register(Arc::clone(&codecs))
            .register(Arc::clone(&cache))
            .register(Arc::new(ProblemReporter::new(relay.clone())))
            .register(Arc::new(ResolverHandle(Arc::clone(&resolver))))
            .build();

        let implementation = resolver.resolve_bootstrap(bootstrap_kind).and_then(|factory| {
            cache.get_or_insert_with(bootstrap_kind, || factory.metadata());
            factory.create(&scope)
        });

        let session = match implementation {
            Ok(handler) => Self {
                implementation: Some(handler),
                codec_mode: CodecMode::Registered(codecs),
                relay,
                gate,
            },
            Err(err) => {
                tracing::error!("worker session initialization failed: {err}");
                // The one startup failure notice this session will ever send
                relay.respond(Response {
                    operation: protocol::OperationId::nil(),
                    outcome: Outcome::InfrastructureFailed {
                        error: RemoteFailure::new(err.to_string()),
                    },
                });
                Self {
                    implementation: None,
                    codec_mode: CodecMode::Discard,
                    relay,
                    gate,
                }
            }
        };
        (Arc::new(session), released)
    }

    /// Execute one request, emitting exactly one response.
    ///
    /// Runs under the request's correlation context so that log output from
    /// the work implementation is tagged with the operation and travels the
    /// same channel as the eventual response.
    pub fn run(&self, request: Request) {
        let Some(implementation) = self.implementation.as_deref() else {
            // Failure mode: the startup notice already went out
            return;
        };
        let CodecMode::Registered(codecs) = &self.codec_mode else {
            return;
        };

        let operation = request.operation;
        let outcome = match self.relay.enter(operation) {
            Err(err) => Outcome::InfrastructureFailed {
                error: RemoteFailure::new(err.to_string()),
            },
            Ok(_ctx) => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    codecs
                        .decode(&request.argument)
                        .and_then(|input| implementation.execute(input))
                }));
                match result {
                    Ok(Ok(result)) => Outcome::Completed { result },
                    Ok(Err(err @ WorkError::TypeNotFound { .. })) => Outcome::InfrastructureFailed {
                        error: RemoteFailure::new(err.to_string()),
                    },
                    Ok(Err(err)) => Outcome::Failed {
                        error: RemoteFailure::new(err.to_string()),
                    },
                    Err(panic) => Outcome::Failed {
                        error: RemoteFailure::new(panic_message(panic.as_ref())),
                    },
                }
            }
        };

        if !self.relay.respond(Response { operation, outcome }) {
            tracing::warn!(%operation, "response channel closed before the outcome was delivered");
        }
    }

    /// `run` followed unconditionally by `stop`.
    pub fn run_then_stop(&self, request: Request) {
        let run = catch_unwind(AssertUnwindSafe(|| self.run(request)));
        self.stop();
        if run.is_err() {
            tracing::error!("request execution escaped its panic handling");
        }
    }

    /// Release the termination gate and clear any ambient correlation
    /// context. Idempotent under concurrent calls.
    pub fn stop(&self) {
        if self.gate.release() {
            tracing::debug!("termination gate released");
        }
        self.relay.clear();
    }

    /// The transport closed unexpectedly, most likely because the controlling
    /// process died. Must never leave the worker hanging.
    pub fn on_stream_closed(&self) {
        self.stop();
    }

    /// A transport-level failure while a response may be outstanding.
    /// Forwarded as a failed response so the controller is never left waiting
    /// indefinitely; the session itself keeps running.
    pub fn on_transport_failure(&self, error: &str) {
        let operation = self
            .relay
            .current()
            .unwrap_or_else(protocol::OperationId::nil);
        self.relay.respond(Response {
            operation,
            outcome: Outcome::Failed {
                error: RemoteFailure::new(error),
            },
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("work implementation panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("work implementation panicked: {s}")
    } else {
        "work implementation panicked".to_string()
    }
}

/// Serve the session over an accepted transport until the termination gate
/// releases.
///
/// One task drains the event channel into the socket (the single shared
/// sink); another reads requests and executes them on the blocking pool, one
/// in flight at a time. After the gate releases, buffered events - including
/// the final response of a `RunThenStop` - are flushed before returning.
///
/// # Errors
///
/// Only genuine interruption of the termination wait is an error; no further
/// progress is possible and the process should abort.
pub async fn serve(
    session: Arc<WorkerSession>,
    stream: UnixStream,
    mut events: UnboundedReceiver<WorkerEvent>,
    released: oneshot::Receiver<()>,
) -> crate::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    let (flush_tx, mut flush_rx) = oneshot::channel::<()>();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                maybe = events.recv() => match maybe {
                    Some(event) => {
                        if protocol::write_worker_event(&mut writer, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut flush_rx => {
                    while let Ok(event) = events.try_recv() {
                        if protocol::write_worker_event(&mut writer, &event).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
    });

    let reader_session = Arc::clone(&session);
    let reader_task = tokio::spawn(async move {
        loop {
            match protocol::read_worker_request(&mut reader).await {
                Ok(WorkerRequest::Run(request)) => {
                    let session = Arc::clone(&reader_session);
                    if tokio::task::spawn_blocking(move || session.run(request))
                        .await
                        .is_err()
                    {
                        tracing::error!("request execution task failed");
                    }
                }
                Ok(WorkerRequest::RunThenStop(request)) => {
                    let session = Arc::clone(&reader_session);
                    let _ = tokio::task::spawn_blocking(move || session.run_then_stop(request))
                        .await;
                    break;
                }
                Ok(WorkerRequest::Stop) => {
                    reader_session.stop();
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    // Undecodable frame: report it, keep the session alive
                    reader_session.on_transport_failure(&err.to_string());
                }
                Err(_) => {
                    reader_session.on_stream_closed();
                    break;
                }
            }
        }
    });

    released
        .await
        .map_err(|_| CrucibleError::SessionInterrupted("termination gate abandoned".into()))?;

    reader_task.abort();
    drop(session);
    let _ = flush_tx.send(());
    let _ = writer_task.await;
    Ok(())
}
