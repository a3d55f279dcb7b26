//! CLI side of the control socket.

use std::path::Path;
use std::time::Duration;

use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::{read_json_line, write_json_line, IpcError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/response client for a running daemon.
pub struct IpcClient {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect with the default timeout. Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| IpcError::Timeout)??;
        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send one request and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.round_trip(&request))
            .await
            .map_err(|_| IpcError::Timeout)?
    }

    async fn round_trip(&mut self, request: &IpcRequest) -> Result<IpcResponse, IpcError> {
        write_json_line(&mut self.writer, request).await?;
        read_json_line(&mut self.reader)
            .await?
            .ok_or(IpcError::Disconnected)
    }

    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(IpcRequest::Ping).await?, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    pub async fn kill_session(&mut self, session_id: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::KillSession { session_id }).await
    }
}
