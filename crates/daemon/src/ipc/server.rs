//! Daemon side of the control socket.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// Control socket listener. Removes its socket file when dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind at `path`, creating the parent directory (mode 0700) and
    /// replacing a stale socket left by a previous run.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        // Only the owning user may drive the daemon.
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One CLI connection. Newline-delimited JSON in both directions.
pub struct IpcConnection {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Next request, or `None` once the client hangs up.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        read_json_line(&mut self.reader).await
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        write_json_line(&mut self.writer, response).await
    }
}

pub(super) async fn read_json_line<T: serde::de::DeserializeOwned>(
    reader: &mut BufReader<ReadHalf<UnixStream>>,
) -> Result<Option<T>, IpcError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim())?))
}

pub(super) async fn write_json_line<T: serde::Serialize>(
    writer: &mut WriteHalf<UnixStream>,
    value: &T,
) -> Result<(), IpcError> {
    let mut json = serde_json::to_string(value)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Control-channel failures.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon did not answer in time")]
    Timeout,

    #[error("daemon closed the connection")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bind_creates_private_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("run").join("termhub").join("daemon.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(socket_path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_request_response_over_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let client = tokio::spawn(async move {
            let stream = UnixStream::connect(&path).await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            write_json_line(
                &mut write_half,
                &IpcRequest::KillSession {
                    session_id: "s-1".to_string(),
                },
            )
            .await
            .unwrap();
            read_json_line::<IpcResponse>(&mut reader).await.unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        let request = conn.read_request().await.unwrap().unwrap();
        assert_eq!(
            request,
            IpcRequest::KillSession {
                session_id: "s-1".to_string()
            }
        );
        conn.send_response(&IpcResponse::SessionKilled {
            session_id: "s-1".to_string(),
        })
        .await
        .unwrap();

        let response = client.await.unwrap();
        assert_eq!(
            response,
            Some(IpcResponse::SessionKilled {
                session_id: "s-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_read_returns_none_on_hangup() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&path).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        assert!(conn.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_request_is_json_error() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let writer = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            stream.write_all(b"{not json}\n").await.unwrap();
            stream
        });

        let mut conn = server.accept().await.unwrap();
        let result = conn.read_request().await;
        assert!(matches!(result, Err(IpcError::Json(_))));
        drop(writer.await.unwrap());
    }
}
