//! Controller-side handle to a running worker daemon.
//!
//! A [`WorkerClient`] owns the connection and the child process. Requests are
//! submitted one at a time; while a response is pending the client relays the
//! worker's log events into the local tracing output, so worker log lines
//! always appear before the request's outcome. Once the transport fails the
//! client is marked lost and every further call reports the daemon as lost.

use serde_json::value::RawValue;
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::time::{Duration, timeout};

use super::protocol::{
    EnvelopeCodec, OperationId, Outcome, Request, WorkerEvent, WorkerRequest, read_frame,
    write_frame,
};
use crate::error::{CrucibleError, Result};
use crate::work::WorkSpec;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct WorkerClient {
    stream: UnixStream,
    child: Child,
    codec: EnvelopeCodec,
    worker_id: String,
    lost: bool,
}

impl WorkerClient {
    pub(crate) fn new(
        stream: UnixStream,
        child: Child,
        codec: EnvelopeCodec,
        worker_id: String,
    ) -> Self {
        Self {
            stream,
            child,
            codec,
            worker_id,
            lost: false,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute one work item and wait for its outcome.
    ///
    /// # Errors
    ///
    /// - `WorkFailed` when the work implementation reported a domain error;
    ///   the daemon remains usable.
    /// - `InfrastructureFailed` when the worker's execution environment is
    ///   broken; the daemon should not be reused.
    /// - `DaemonLost` when the transport failed, most likely because the
    ///   worker process died. The client is permanently unusable afterwards.
    pub async fn execute(&mut self, work: WorkSpec) -> Result<serde_json::Value> {
        self.submit(work, false).await
    }

    /// Execute one work item, instructing the worker to terminate as soon as
    /// the response has been sent.
    pub async fn execute_once(mut self, work: WorkSpec) -> Result<serde_json::Value> {
        let result = self.submit(work, true).await;
        // The worker is stopping on its own; just collect the exit
        let _ = timeout(SHUTDOWN_GRACE, self.child.wait()).await;
        result
    }

    async fn submit(&mut self, work: WorkSpec, then_stop: bool) -> Result<serde_json::Value> {
        if self.lost {
            return Err(CrucibleError::DaemonLost(format!(
                "worker {} connection previously failed",
                self.worker_id
            )));
        }

        let operation = OperationId::new();
        let argument = RawValue::from_string(serde_json::to_string(&work)?)?;
        let request = Request::new(operation, argument);
        let message = if then_stop {
            WorkerRequest::RunThenStop(request)
        } else {
            WorkerRequest::Run(request)
        };

        self.send(&message).await?;
        self.await_response(operation).await
    }

    async fn send(&mut self, message: &WorkerRequest) -> Result<()> {
        let data = self
            .codec
            .encode_request(message)
            .map_err(|e| CrucibleError::DaemonProtocol(e.to_string()))?;
        if let Err(err) = write_frame(&mut self.stream, &data).await {
            return Err(self.mark_lost(&err.to_string()));
        }
        Ok(())
    }

    /// Drain events until the response for `operation` arrives, relaying log
    /// events into the local tracing output as they come in.
    ///
    /// Responses carrying the nil token are accepted too: they are notices
    /// not tied to this request (startup failure, transport-failure
    /// forwards), and there is nothing better to attribute them to.
    async fn await_response(&mut self, operation: OperationId) -> Result<serde_json::Value> {
        loop {
            let data = match read_frame(&mut self.stream).await {
                Ok(data) => data,
                Err(err) => return Err(self.mark_lost(&err.to_string())),
            };
            let event = self
                .codec
                .decode_event(&data)
                .map_err(|e| CrucibleError::DaemonProtocol(e.to_string()))?;

            match event {
                WorkerEvent::Log(log) => self.relay_log(&log.level, &log.message),
                WorkerEvent::Response(response) => {
                    if response.operation != operation && !response.operation.is_nil() {
                        tracing::warn!(
                            worker_id = %self.worker_id,
                            operation = %response.operation,
                            "dropping response for unknown operation"
                        );
                        continue;
                    }
                    return match response.outcome {
                        Outcome::Completed { result } => Ok(result),
                        Outcome::Failed { error } => Err(CrucibleError::WorkFailed(error)),
                        Outcome::InfrastructureFailed { error } => {
                            Err(CrucibleError::InfrastructureFailed(error))
                        }
                    };
                }
            }
        }
    }

    fn relay_log(&self, level: &str, message: &str) {
        let worker_id = self.worker_id.as_str();
        match level {
            "ERROR" => tracing::error!(worker_id, "{message}"),
            "WARN" => tracing::warn!(worker_id, "{message}"),
            "INFO" => tracing::info!(worker_id, "{message}"),
            "DEBUG" => tracing::debug!(worker_id, "{message}"),
            _ => tracing::trace!(worker_id, "{message}"),
        }
    }

    fn mark_lost(&mut self, reason: &str) -> CrucibleError {
        self.lost = true;
        CrucibleError::DaemonLost(format!("worker {}: {reason}", self.worker_id))
    }

    /// Ask the worker to stop and wait for the process to exit.
    ///
    /// If the worker does not exit within the grace period it is killed.
    /// Safe to call on a lost client; the process is reaped either way.
    pub async fn shutdown(mut self) -> Result<()> {
        if !self.lost {
            // Best effort; the worker may already be gone
            let _ = self.send(&WorkerRequest::Stop).await;
        }

        match timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::debug!(worker_id = %self.worker_id, %status, "worker daemon exited");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    worker_id = %self.worker_id,
                    "worker did not exit within grace period, killing"
                );
                self.child.start_kill()?;
                let _ = self.child.wait().await;
                Ok(())
            }
        }
    }
}
