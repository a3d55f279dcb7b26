//! Session management module.
//!
//! This module owns terminal processes and their lifetime. A session wraps
//! one process backend (a PTY, or plain pipes where PTYs are unavailable),
//! tracks its state and activity, and lives in the registry until it is
//! destroyed by the client, by process exit, by the idle sweep, or by an
//! operator.

pub mod backend;
pub mod lifecycle;
pub mod pipe;
pub mod pty;
pub mod registry;
pub mod remote;

use thiserror::Error;

pub use backend::{BackendKind, ExitInfo, ProcessBackend, ProcessEvent, ProcessSpec};
pub use lifecycle::{
    CloseReason, Session, SessionMetadata, SessionOptions, SessionState, SessionSummary,
};
pub use registry::{CreateRequest, RegistryStats, SessionRegistry};
pub use remote::RemoteOptions;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The id is held by a live session or was used by a destroyed one.
    #[error("session id already in use: {0}")]
    DuplicateSessionId(SessionId),

    /// The configured session limit is reached.
    #[error("session limit reached ({0} active)")]
    LimitReached(usize),

    /// The session is closing or destroyed.
    #[error("session is not active: {0}")]
    Inactive(SessionId),

    /// Remote-connect parameters were rejected.
    #[error("invalid connection parameters: {0}")]
    InvalidConnection(String),

    /// Failed to spawn the process.
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    /// Failed to write to the process.
    #[error("failed to write to process: {0}")]
    WriteFailed(String),

    /// Failed to resize the terminal.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
