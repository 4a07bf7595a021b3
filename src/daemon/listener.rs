//! Unix socket listener the worker binds before its controller connects.
//!
//! The worker creates the socket, the starter connects to it once the path
//! appears. The socket file is created with mode 0600 (owner only) and is
//! removed when the listener is dropped. A worker serves exactly one
//! controller, so unlike a general-purpose daemon listener this one hands
//! over the raw stream of its single accepted connection.

use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use crate::error::Result;

pub struct WorkerListener {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl WorkerListener {
    /// Bind to a Unix domain socket at the given path.
    ///
    /// Creates the parent directory if needed, removes any stale socket file
    /// from a previous run, then binds and restricts permissions to the
    /// owning user.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, a stale
    /// socket file cannot be removed, the bind fails, or permissions cannot
    /// be set.
    pub fn bind(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Stale from a previous run with the same worker id
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept the controller's connection.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting the connection fails.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for WorkerListener {
    fn drop(&mut self) {
        // Ignore errors since we're in drop
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn temp_socket_path() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.sock");
        (dir, path)
    }

    #[tokio::test]
    async fn test_bind_creates_socket() {
        let (_dir, socket_path) = temp_socket_path();

        let listener = WorkerListener::bind(&socket_path).unwrap();

        assert!(socket_path.exists());
        assert_eq!(listener.socket_path(), socket_path);
    }

    #[tokio::test]
    async fn test_bind_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("nested").join("dir").join("worker.sock");

        let _listener = WorkerListener::bind(&socket_path).unwrap();

        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_removes_stale_socket() {
        let (_dir, socket_path) = temp_socket_path();

        let listener = WorkerListener::bind(&socket_path).unwrap();
        drop(listener);
        assert!(!socket_path.exists());

        std::fs::write(&socket_path, b"stale").unwrap();
        assert!(socket_path.exists());

        let _listener = WorkerListener::bind(&socket_path).unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_drop_cleans_up_socket() {
        let (_dir, socket_path) = temp_socket_path();

        {
            let _listener = WorkerListener::bind(&socket_path).unwrap();
            assert!(socket_path.exists());
        }

        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_socket_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, socket_path) = temp_socket_path();

        let _listener = WorkerListener::bind(&socket_path).unwrap();

        let metadata = std::fs::metadata(&socket_path).unwrap();
        let mode = metadata.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_accept_connection() {
        let (_dir, socket_path) = temp_socket_path();
        let socket_path_clone = socket_path.clone();

        let listener = WorkerListener::bind(&socket_path).unwrap();

        let client_handle =
            tokio::spawn(async move { UnixStream::connect(&socket_path_clone).await.unwrap() });

        let stream = timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap();

        assert!(stream.peer_addr().is_ok());
        client_handle.await.unwrap();
    }
}
