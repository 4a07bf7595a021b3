//! Spawning worker daemons.
//!
//! The starter owns the spawn-and-handshake sequence: pick a worker id and
//! socket path, construct the envelope codec, launch the `crucibled` binary
//! with its isolation mode and (in flat mode) the pre-declared work kinds,
//! then connect to the socket with backoff until the worker is listening.
//! The connected [`WorkerClient`] is the handle callers use from then on.
//!
//! Isolation mode and the flat-mode work declaration are spawn-time
//! decisions; nothing about them can change for the lifetime of the worker.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::time::sleep;

use super::client::WorkerClient;
use super::protocol::EnvelopeCodec;
use crate::config;
use crate::error::{CrucibleError, Result};
use crate::isolation::IsolationMode;

/// Everything the starter needs to know to bring up one worker.
pub struct DaemonStartSpec {
    pub mode: IsolationMode,
    /// Work kinds pre-declared into the shared namespace. Only consulted in
    /// flat mode.
    pub work_manifest: Vec<String>,
    /// Directory for the socket and log files. Defaults to
    /// `~/.crucible/daemon`.
    pub daemon_dir: Option<PathBuf>,
    /// Worker binary to launch. Defaults to `crucibled` next to the current
    /// executable.
    pub worker_binary: Option<PathBuf>,
    pub handshake_timeout: Duration,
}

impl Default for DaemonStartSpec {
    fn default() -> Self {
        Self {
            mode: IsolationMode::Hierarchical,
            work_manifest: Vec::new(),
            daemon_dir: None,
            worker_binary: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl DaemonStartSpec {
    pub fn new(mode: IsolationMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_work_manifest(mut self, kinds: Vec<String>) -> Self {
        self.work_manifest = kinds;
        self
    }

    pub fn with_daemon_dir(mut self, dir: PathBuf) -> Self {
        self.daemon_dir = Some(dir);
        self
    }

    pub fn with_worker_binary(mut self, binary: PathBuf) -> Self {
        self.worker_binary = Some(binary);
        self
    }
}

/// Spawn a worker daemon and connect to it.
///
/// # Errors
///
/// Returns `DaemonSpawn` if the worker binary is missing or the process
/// exits before it starts listening, and `DaemonConnection` if the socket
/// never comes up within the handshake timeout.
pub async fn start(spec: DaemonStartSpec) -> Result<WorkerClient> {
    let daemon_dir = match spec.daemon_dir {
        Some(dir) => dir,
        None => config::daemon_dir()?,
    };
    std::fs::create_dir_all(&daemon_dir)?;

    let worker_id = config::new_worker_id();
    let socket_path = config::worker_socket_path(&daemon_dir, &worker_id);
    let log_dir = config::worker_log_dir(&daemon_dir);
    let log_path = config::worker_log_path(&log_dir, &worker_id);

    let binary = match spec.worker_binary {
        Some(binary) => binary,
        None => std::env::current_exe()?.with_file_name("crucibled"),
    };
    if !binary.exists() {
        return Err(CrucibleError::DaemonSpawn(format!(
            "worker binary not found at {}",
            binary.display()
        )));
    }

    // The envelope codec exists before the process does; a codec problem
    // must surface here, not after a worker has been launched.
    let codec = EnvelopeCodec::default();

    let mut command = Command::new(&binary);
    command
        .arg("--socket")
        .arg(&socket_path)
        .arg("--worker-id")
        .arg(&worker_id)
        .arg("--isolation")
        .arg(spec.mode.to_string())
        .arg("--log-dir")
        .arg(&log_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if spec.mode == IsolationMode::Flat {
        for kind in &spec.work_manifest {
            command.arg("--work").arg(kind);
        }
    }

    tracing::debug!(worker_id, mode = %spec.mode, "spawning worker daemon");
    let mut child = command.spawn()?;

    // The worker binds the socket; connect with backoff until it appears
    let deadline = Instant::now() + spec.handshake_timeout;
    let mut attempt = 0u64;
    loop {
        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            tracing::debug!(worker_id, "connected to worker daemon");
            return Ok(WorkerClient::new(stream, child, codec, worker_id));
        }

        if let Some(status) = child.try_wait()? {
            return Err(CrucibleError::DaemonSpawn(format!(
                "worker exited during startup with {status}. Check {} for details.",
                log_path.display()
            )));
        }

        if Instant::now() >= deadline {
            child.start_kill().ok();
            return Err(CrucibleError::DaemonConnection(format!(
                "worker did not start listening within {:?}. Check {} for details.",
                spec.handshake_timeout,
                log_path.display()
            )));
        }

        attempt += 1;
        sleep(Duration::from_millis(50 * attempt.min(10))).await;
    }
}
