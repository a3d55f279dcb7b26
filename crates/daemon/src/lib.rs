//! # TermHub Daemon Library
//!
//! Browser terminal sessions over WebSocket. A client opens a WebSocket,
//! authenticates with an `init` frame and gets a shell (local, or remote via
//! `ssh`) whose output is streamed back as JSON frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐   ┌──────────────┐   ┌──────────────┐  │
//! │  │ Gateway          │──>│   Session    │──>│    Audit     │  │
//! │  │ (WebSocket)      │   │   Registry   │   │    Bridge    │  │
//! │  └──────────────────┘   └──────┬───────┘   └──────────────┘  │
//! │           │                    │                             │
//! │  ┌────────┴─────────┐   ┌──────┴───────┐   ┌──────────────┐  │
//! │  │ Auth / Targets   │   │ PTY / Pipe   │   │ Control      │  │
//! │  │                  │   │ processes    │   │ socket (IPC) │  │
//! │  └──────────────────┘   └──────────────┘   └──────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config).await?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`session`]: Process backends, session lifecycle and the registry
//! - [`gateway`]: WebSocket listener and per-connection handler
//! - [`auth`]: Client token verification
//! - [`targets`]: Target resolution
//! - [`audit`]: Session start/end audit events
//! - [`ipc`]: Local control socket for the CLI
//! - [`orchestrator`]: Main daemon coordinator

pub mod audit;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod ipc;
pub mod orchestrator;
pub mod session;
pub mod targets;

pub use protocol;

pub use config::Config;

pub use session::{
    BackendKind, CloseReason, Session, SessionError, SessionId, SessionRegistry, SessionState,
};

pub use auth::{IdentityVerifier, TokenVerifier};
pub use targets::{ResolvedTarget, StaticTargetResolver, TargetResolver};

pub use audit::{AuditBridge, AuditEvent, AuditSink};

pub use gateway::{GatewayServer, GatewayState};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
