//! Terminal session frames exchanged between the browser client and the daemon.
//!
//! Every frame is one JSON object carried in a single WebSocket text message
//! and tagged by its `type` field. Field names follow the camelCase convention
//! used by the dashboard client.

use serde::{Deserialize, Deserializer, Serialize};

/// Current protocol version, reported in `connected` metadata.
pub const PROTOCOL_VERSION: u8 = 1;

/// Terminal width used when the client does not send one.
pub const DEFAULT_COLS: u16 = 80;

/// Terminal height used when the client does not send one.
pub const DEFAULT_ROWS: u16 = 24;

/// Default SSH port for remote-connect parameters.
pub const DEFAULT_SSH_PORT: u16 = 22;

// ============================================================================
// Client -> daemon
// ============================================================================

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start a session and bind it to this connection.
    Init(InitRequest),
    /// Raw keystrokes for the process stdin.
    Input(InputData),
    /// Terminal size change.
    Resize(ResizeRequest),
    /// Liveness probe.
    Ping,
    /// Client is done with the session.
    Close,
}

impl ClientMessage {
    /// Short name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Init(_) => "init",
            ClientMessage::Input(_) => "input",
            ClientMessage::Resize(_) => "resize",
            ClientMessage::Ping => "ping",
            ClientMessage::Close => "close",
        }
    }
}

/// Handshake request. Exactly one per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    /// Bearer token checked by the identity verifier.
    #[serde(default, alias = "token")]
    pub auth_token: String,
    /// Logical target (appliance or host record) the session runs against.
    #[serde(
        default,
        alias = "applianceId",
        deserialize_with = "string_or_number"
    )]
    pub target_ref: String,
    /// Caller-chosen session id. Generated by the daemon when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Remote-connect parameters supplied by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionParams>,
    /// Initial terminal columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Initial terminal rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl InitRequest {
    /// Create an init request for a target with the given token.
    pub fn new(auth_token: impl Into<String>, target_ref: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            target_ref: target_ref.into(),
            session_id: None,
            connection: None,
            cols: None,
            rows: None,
        }
    }

    /// Requested terminal size, falling back to 80x24.
    pub fn size(&self) -> (u16, u16) {
        self.size_or((DEFAULT_COLS, DEFAULT_ROWS))
    }

    /// Requested terminal size. Missing or zero dimensions take the
    /// matching value from `default`.
    pub fn size_or(&self, default: (u16, u16)) -> (u16, u16) {
        (
            self.cols.filter(|c| *c > 0).unwrap_or(default.0),
            self.rows.filter(|r| *r > 0).unwrap_or(default.1),
        )
    }
}

/// Resolved remote endpoint for a session that should open an SSH shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    /// Remote host name or address.
    pub host: String,
    /// Remote SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login name on the remote host.
    pub username: String,
    /// Private key to authenticate with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Keystrokes or pasted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputData {
    /// Raw input as text.
    pub data: String,
}

/// Terminal resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// New column count.
    pub cols: u16,
    /// New row count.
    pub rows: u16,
}

// ============================================================================
// Daemon -> client
// ============================================================================

/// Frames sent by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake succeeded and the process is running.
    Connected(Connected),
    /// Process output.
    Output(OutputData),
    /// Handshake or runtime failure.
    Error(ErrorData),
    /// Session ended; the client should stop sending.
    Close(CloseData),
    /// Answer to `ping`.
    Pong,
}

impl ServerMessage {
    /// Build an `output` frame.
    pub fn output(data: impl Into<String>) -> Self {
        ServerMessage::Output(OutputData { data: data.into() })
    }

    /// Build an `error` frame.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorData {
            error: message.into(),
        })
    }

    /// Build a `close` frame with an optional reason.
    pub fn close(reason: Option<String>) -> Self {
        ServerMessage::Close(CloseData { reason })
    }

    /// Short name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected(_) => "connected",
            ServerMessage::Output(_) => "output",
            ServerMessage::Error(_) => "error",
            ServerMessage::Close(_) => "close",
            ServerMessage::Pong => "pong",
        }
    }
}

/// Handshake acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    /// Display name of the resolved target.
    pub hostname: String,
    /// Id of the session bound to this connection.
    pub session_id: String,
    /// Extra information for the client header bar.
    pub metadata: ConnectedMetadata,
}

/// Metadata attached to the `connected` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedMetadata {
    /// Target reference the session was created for.
    pub target_ref: String,
    /// Whether the session opens a remote shell.
    pub remote: bool,
    /// Process backend in use (`pty` or `pipe`).
    pub backend: String,
    /// Protocol version spoken by the daemon.
    pub protocol_version: u8,
}

/// Output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputData {
    /// Process output decoded as UTF-8.
    pub data: String,
}

/// Error notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Human-readable message.
    pub error: String,
}

/// Close notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseData {
    /// Why the session ended, when it was not a plain process exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Accepts `"42"` or `42` for target references; the dashboard sends numeric
/// appliance ids.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Unsigned(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Unsigned(n) => n.to_string(),
    })
}
