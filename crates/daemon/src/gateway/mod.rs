//! WebSocket gateway.
//!
//! Browsers connect over a WebSocket, authenticate with an `init` frame and
//! are bound to a fresh session. From then on the connection relays input to
//! the process and output back to the browser until either side ends it.
//!
//! ## Handshake
//!
//! ```text
//! PendingConnection --init ok--> BoundConnection --close/exit/drop--> session destroyed
//!        |
//!        +--init rejected--> error frame, close, no session
//! ```

mod connection;
mod listener;

use std::sync::Arc;

use protocol::{FrameCodec, ProtocolError};
use thiserror::Error;

use crate::auth::{AuthError, IdentityVerifier};
use crate::session::{SessionError, SessionRegistry};
use crate::targets::{TargetError, TargetResolver};

pub use connection::{handle_connection, BoundConnection, PendingConnection};
pub use listener::GatewayServer;

/// Shared state for all gateway connections.
pub struct GatewayState {
    pub registry: Arc<SessionRegistry>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub resolver: Arc<dyn TargetResolver>,
    pub codec: FrameCodec,
    /// Honor client-supplied remote-connect parameters.
    pub allow_client_params: bool,
    /// Terminal size used when `init` carries none.
    pub default_size: (u16, u16),
}

impl GatewayState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
        resolver: Arc<dyn TargetResolver>,
    ) -> Self {
        Self {
            registry,
            verifier,
            resolver,
            codec: FrameCodec::new(),
            allow_client_params: false,
            default_size: (protocol::DEFAULT_COLS, protocol::DEFAULT_ROWS),
        }
    }
}

/// Reasons an `init` frame is rejected. Each one ends the connection without
/// a session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    TargetNotFound(#[from] TargetError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("session already initialized")]
    AlreadyInitialized,
}

impl HandshakeError {
    /// Text for the `error` frame sent to the client.
    pub fn client_message(&self) -> String {
        match self {
            HandshakeError::AlreadyInitialized => self.to_string(),
            _ => format!("could not start session: {}", self),
        }
    }
}

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
