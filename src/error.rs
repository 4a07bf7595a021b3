use thiserror::Error;

use crate::daemon::protocol::RemoteFailure;
use crate::isolation::Namespace;

#[derive(Error, Debug)]
pub enum CrucibleError {
    #[error("Failed to connect to worker daemon: {0}")]
    DaemonConnection(String),

    #[error("Worker daemon lost: {0}. Discard this client and start a new daemon.")]
    DaemonLost(String),

    #[error("Worker protocol error: {0}")]
    DaemonProtocol(String),

    #[error("Failed to spawn worker daemon: {0}")]
    DaemonSpawn(String),

    #[error("Work failed: {0}")]
    WorkFailed(RemoteFailure),

    #[error("Worker infrastructure failed: {0}")]
    InfrastructureFailed(RemoteFailure),

    #[error("Worker session interrupted: {0}")]
    SessionInterrupted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised inside the worker process while handling a single request.
///
/// The session classifies these when building the response: a
/// [`WorkError::TypeNotFound`] strongly implies a misconfigured isolation
/// boundary rather than a legitimate work failure, so it is reported as an
/// infrastructure failure; everything else is an ordinary work failure.
#[derive(Error, Debug)]
pub enum WorkError {
    #[error("{0}")]
    Domain(String),

    #[error("work kind '{kind}' not found in {namespace} namespace")]
    TypeNotFound { kind: String, namespace: Namespace },

    #[error("invalid work argument: {0}")]
    InvalidArgument(String),

    #[error("failed to instantiate work handler '{kind}': {reason}")]
    Instantiation { kind: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CrucibleError>;
