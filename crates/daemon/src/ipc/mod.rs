//! Local control channel between the `termhub` CLI and a running daemon.
//!
//! Newline-delimited JSON over a Unix domain socket. The socket lives at
//! `$XDG_RUNTIME_DIR/termhub/daemon.sock`, falling back to
//! `/tmp/termhub-$UID/daemon.sock`.
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! # async fn check() -> Result<(), daemon::ipc::IpcError> {
//! let mut client = IpcClient::connect(&get_socket_path()).await?;
//! if client.ping().await? {
//!     println!("daemon is up");
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running, PidFile};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

pub fn get_socket_path() -> PathBuf {
    socket_path_in(std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from))
}

fn socket_path_in(runtime_dir: Option<PathBuf>) -> PathBuf {
    match runtime_dir {
        Some(dir) => dir.join("termhub").join("daemon.sock"),
        None => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/termhub-{}", uid)).join("daemon.sock")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_under_runtime_dir() {
        let path = socket_path_in(Some(PathBuf::from("/run/user/1000")));
        assert_eq!(path, PathBuf::from("/run/user/1000/termhub/daemon.sock"));
    }

    #[test]
    fn test_socket_path_fallback_is_per_user() {
        let path = socket_path_in(None);
        let text = path.to_string_lossy();
        assert!(text.starts_with("/tmp/termhub-"));
        assert!(text.ends_with("/daemon.sock"));
    }

    #[test]
    fn test_socket_path_is_absolute() {
        assert!(get_socket_path().is_absolute());
    }
}
