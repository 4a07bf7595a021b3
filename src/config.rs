//! Filesystem layout for worker daemons.
//!
//! Everything lives under `~/.crucible/daemon/`: one socket file and one log
//! file per worker, named after the worker id. The directory is created
//! lazily by whichever side touches it first.

use std::path::{Path, PathBuf};

use crate::error::{CrucibleError, Result};

/// Root directory for persistent state (`~/.crucible`).
pub fn runtime_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CrucibleError::Config("could not determine home directory".to_string()))?;
    Ok(home.join(".crucible"))
}

/// Directory holding worker sockets and log files.
pub fn daemon_dir() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("daemon"))
}

/// Socket path for a worker within a daemon directory.
pub fn worker_socket_path(daemon_dir: &Path, worker_id: &str) -> PathBuf {
    daemon_dir.join(format!("{worker_id}.sock"))
}

/// Directory a worker writes its log file into.
pub fn worker_log_dir(daemon_dir: &Path) -> PathBuf {
    daemon_dir.join("logs")
}

/// Log file path for a worker.
pub fn worker_log_path(log_dir: &Path, worker_id: &str) -> PathBuf {
    log_dir.join(format!("{worker_id}.log"))
}

/// Generate a fresh worker id.
pub fn new_worker_id() -> String {
    format!("worker-{}", nanoid::nanoid!(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_paths() {
        let dir = Path::new("/tmp/crucible-test");
        assert_eq!(
            worker_socket_path(dir, "worker-abc"),
            Path::new("/tmp/crucible-test/worker-abc.sock")
        );
        assert_eq!(
            worker_log_path(&worker_log_dir(dir), "worker-abc"),
            Path::new("/tmp/crucible-test/logs/worker-abc.log")
        );
    }

    #[test]
    fn test_new_worker_id_unique() {
        let a = new_worker_id();
        let b = new_worker_id();
        assert!(a.starts_with("worker-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_daemon_dir_under_runtime_dir() {
        if let (Ok(runtime), Ok(daemon)) = (runtime_dir(), daemon_dir()) {
            assert!(daemon.starts_with(&runtime));
        }
    }
}
