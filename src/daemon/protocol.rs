//! Wire protocol between the controlling process and a worker daemon.
//!
//! Messages are framed using a simple length-delimited format:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded message
//!
//! Requests flow controller -> worker as [`WorkerRequest`] envelopes; log
//! output and responses flow back as [`WorkerEvent`]s on a single stream, so
//! a request's log lines always arrive before its response. The request
//! payload is carried as a raw JSON value and stays undecoded until the
//! session's argument codec runs (or is dropped outright when the session is
//! in discard mode).

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

/// Maximum message size (16 MB) to prevent memory exhaustion attacks
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Correlation token tying log output and an outcome to the originating
/// request. Opaque to everything except equality checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil token, used for notices not tied to any single request
    /// (e.g. the startup failure notice).
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A single unit of work sent to the worker.
///
/// Produced by the controlling side and consumed exactly once. The argument
/// is opaque at this layer; the worker session decodes it through its
/// argument-codec registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation token for this request's log output and outcome.
    pub operation: OperationId,
    /// Raw payload, decoded worker-side.
    pub argument: Box<RawValue>,
}

impl Request {
    pub fn new(operation: OperationId, argument: Box<RawValue>) -> Self {
        Self {
            operation,
            argument,
        }
    }
}

/// A failure that crossed the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub message: String,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of exactly one request, always emitted after all of that
/// request's log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Outcome {
    /// The work implementation ran to completion.
    Completed { result: serde_json::Value },
    /// The work implementation ran and raised a domain error. Session health
    /// is unaffected.
    Failed { error: RemoteFailure },
    /// The execution environment appears broken; the controller should treat
    /// the daemon as unreliable.
    InfrastructureFailed { error: RemoteFailure },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub operation: OperationId,
    pub outcome: Outcome,
}

/// Messages from the controller to the worker session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkerRequest {
    /// Execute a request; exactly one response will be emitted.
    Run(Request),
    /// Execute a request, then release the termination gate unconditionally.
    RunThenStop(Request),
    /// Release the termination gate.
    Stop,
}

/// A log line produced inside the worker, tagged with the operation that was
/// current when it was emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub operation: Option<OperationId>,
    pub level: String,
    pub message: String,
}

/// Messages from the worker back to the controller. Log events and responses
/// share this one stream; their relative order is the ordering contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkerEvent {
    Log(LogEvent),
    Response(Response),
}

/// Codec for the outer request/response envelopes.
///
/// The starter constructs this before spawning the worker, independent of any
/// codec a work implementation registers for its own payload type inside the
/// session.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn encode_request(&self, message: &WorkerRequest) -> io::Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    pub fn decode_request(&self, data: &[u8]) -> io::Result<WorkerRequest> {
        serde_json::from_slice(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn encode_event(&self, message: &WorkerEvent) -> io::Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    pub fn decode_event(&self, data: &[u8]) -> io::Result<WorkerEvent> {
        serde_json::from_slice(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Write a length-delimited frame to an async writer.
///
/// # Errors
///
/// Returns an error if the data exceeds MAX_MESSAGE_SIZE or if writing fails.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "message too large: {} bytes (max {})",
                data.len(),
                MAX_MESSAGE_SIZE
            ),
        ));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited frame from an async reader.
///
/// # Errors
///
/// Returns an error if:
/// - The connection is closed (EOF when reading length)
/// - The message size exceeds MAX_MESSAGE_SIZE
/// - Reading fails
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "message too large: {} bytes (max {})",
                len, MAX_MESSAGE_SIZE
            ),
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serialize and write a controller-to-worker message.
pub async fn write_worker_request<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &WorkerRequest,
) -> io::Result<()> {
    let data = EnvelopeCodec.encode_request(message)?;
    write_frame(writer, &data).await
}

/// Read and deserialize a controller-to-worker message.
pub async fn read_worker_request<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> io::Result<WorkerRequest> {
    let data = read_frame(reader).await?;
    EnvelopeCodec.decode_request(&data)
}

/// Serialize and write a worker-to-controller event.
pub async fn write_worker_event<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &WorkerEvent,
) -> io::Result<()> {
    let data = EnvelopeCodec.encode_event(message)?;
    write_frame(writer, &data).await
}

/// Read and deserialize a worker-to-controller event.
pub async fn read_worker_event<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<WorkerEvent> {
    let data = read_frame(reader).await?;
    EnvelopeCodec.decode_event(&data)
}
