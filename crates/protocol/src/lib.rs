//! # TermHub Protocol Library
//!
//! Wire definitions for the TermHub terminal gateway.
//!
//! ## Overview
//!
//! A browser terminal talks to the daemon over a WebSocket. Each text message
//! is a single JSON frame tagged by `type`:
//!
//! ```text
//! client -> daemon   init | input | resize | ping | close
//! daemon -> client   connected | output | error | close | pong
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, FrameCodec, ServerMessage};
//!
//! let codec = FrameCodec::new();
//! let frame = codec.decode(r#"{"type":"ping"}"#).unwrap();
//! assert_eq!(frame, ClientMessage::Ping);
//!
//! let reply = codec.encode(&ServerMessage::Pong).unwrap();
//! assert_eq!(reply, r#"{"type":"pong"}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Frame definitions
//! - [`framing`]: JSON frame codec and UTF-8 output decoder
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{FrameCodec, Utf8StreamDecoder, MAX_FRAME_SIZE};
pub use messages::{
    ClientMessage, CloseData, Connected, ConnectedMetadata, ConnectionParams, ErrorData,
    InitRequest, InputData, OutputData, ResizeRequest, ServerMessage, DEFAULT_COLS,
    DEFAULT_ROWS, DEFAULT_SSH_PORT, PROTOCOL_VERSION,
};
