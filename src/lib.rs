//! Crucible - out-of-process execution of build work items
//!
//! Crucible runs user-supplied work in a separate worker process and relays
//! outcomes back to the controlling process. The controlling side starts a
//! worker daemon with [`daemon::starter::start`] and drives it through a
//! [`daemon::WorkerClient`]; the worker side runs a single
//! [`daemon::WorkerSession`] that serves requests until it is told to stop or
//! its transport closes.

pub mod config;
pub mod daemon;
pub mod error;
pub mod isolation;
pub mod retention;
pub mod scope;
pub mod work;

pub use error::{CrucibleError, Result, WorkError};
