//! Out-of-process work execution.
//!
//! A controller spawns a worker daemon (`crucibled`), connects to its Unix
//! socket, and submits work items one at a time. Inside the worker a single
//! [`WorkerSession`] executes requests and multiplexes log output and
//! responses onto the one outgoing stream, preserving their relative order.

pub mod client;
pub mod codec;
pub mod listener;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod starter;

pub use client::WorkerClient;
pub use listener::WorkerListener;
pub use protocol::{Outcome, Request, Response, WorkerEvent, WorkerRequest};
pub use relay::LogRelay;
pub use session::{WorkerSession, serve};
pub use starter::{DaemonStartSpec, start};
