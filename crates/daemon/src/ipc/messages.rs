//! Control-channel messages between the CLI and the daemon.

use serde::{Deserialize, Serialize};

use crate::session::SessionSummary;

/// Requests sent by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    Ping,
    Status,
    /// Stop the daemon gracefully.
    Stop,
    ListSessions,
    /// Destroy a session. The client sees a close frame with reason
    /// "killed by administrator".
    KillSession { session_id: String },
}

/// Responses sent by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    Pong,
    Status {
        running: bool,
        uptime_secs: u64,
        session_count: usize,
        /// Sessions created since start.
        sessions_created: u64,
        /// Resolved process backend ("pty" or "pipe").
        backend: String,
        /// Address the gateway listens on.
        bind_addr: String,
    },
    Stopping,
    Sessions {
        sessions: Vec<IpcSessionInfo>,
    },
    SessionKilled {
        session_id: String,
    },
    Error {
        message: String,
    },
}

/// One row of `termhub sessions list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    pub id: String,
    pub target: String,
    pub principal: String,
    pub state: String,
    pub backend: String,
    pub remote: bool,
    pub pid: Option<u32>,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Unix timestamp of the last input or output.
    pub last_activity: u64,
}

impl From<SessionSummary> for IpcSessionInfo {
    fn from(summary: SessionSummary) -> Self {
        Self {
            id: summary.id,
            target: summary.target_ref,
            principal: summary.principal,
            state: summary.state.as_str().to_string(),
            backend: summary.backend,
            remote: summary.remote,
            pid: summary.pid,
            created_at: summary.created_at,
            last_activity: summary.last_activity,
        }
    }
}
