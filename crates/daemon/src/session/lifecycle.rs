//! The session object.
//!
//! A session owns exactly one process backend for its whole life. State moves
//! forward only:
//!
//! ```text
//! Created -> Connected -> Active -> Closing -> Destroyed
//!    \__________\____________\______/
//! ```
//!
//! Any state before `Closing` may jump straight to `Closing`. The first
//! `destroy` call wins: it records the close reason, cancels the session token
//! and kills the process. Later calls are no-ops. `Destroyed` is reached once
//! the process has been reaped, or after [`EXIT_CONFIRM_TIMEOUT`].

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::backend::{
    BackendKind, ExitInfo, InputSender, ProcessBackend, ProcessEvent, ProcessSpec,
};
use super::remote::{self, RemoteOptions};
use super::{SessionError, SessionId};
use crate::targets::ResolvedTarget;

/// How long `destroy` waits for the killed process to be reaped.
pub const EXIT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Connected = 1,
    Active = 2,
    Closing = 3,
    Destroyed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Connected,
            2 => SessionState::Active,
            3 => SessionState::Closing,
            _ => SessionState::Destroyed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Connected => "connected",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Destroyed => "destroyed",
        }
    }

    /// Whether `self -> next` is a legal transition.
    fn can_advance_to(self, next: SessionState) -> bool {
        match next {
            SessionState::Created => false,
            SessionState::Connected => self == SessionState::Created,
            SessionState::Active => self == SessionState::Connected,
            SessionState::Closing => self < SessionState::Closing,
            SessionState::Destroyed => self == SessionState::Closing,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `close` or closed the socket cleanly.
    ClientClosed,
    /// The connection dropped or errored.
    ConnectionLost,
    /// No activity within the idle threshold.
    IdleTimeout,
    /// The process exited on its own.
    ProcessExited { code: Option<i32> },
    /// The process never started.
    SpawnFailed,
    /// Killed through the management interface.
    AdminKill,
    /// The daemon is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Classify a backend exit.
    pub fn from_exit(info: &ExitInfo) -> Self {
        if info.error.is_some() {
            CloseReason::SpawnFailed
        } else {
            CloseReason::ProcessExited { code: info.code }
        }
    }

    /// Stable snake_case name for audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::ConnectionLost => "connection_lost",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::ProcessExited { .. } => "process_exited",
            CloseReason::SpawnFailed => "spawn_failed",
            CloseReason::AdminKill => "admin_kill",
            CloseReason::Shutdown => "shutdown",
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CloseReason::ProcessExited { code } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("closed by client"),
            CloseReason::ConnectionLost => f.write_str("connection lost"),
            CloseReason::IdleTimeout => f.write_str("idle timeout"),
            CloseReason::ProcessExited { code: Some(code) } => {
                write!(f, "process exited with code {}", code)
            }
            CloseReason::ProcessExited { code: None } => f.write_str("process exited"),
            CloseReason::SpawnFailed => f.write_str("process failed to start"),
            CloseReason::AdminKill => f.write_str("killed by administrator"),
            CloseReason::Shutdown => f.write_str("server shutting down"),
        }
    }
}

/// Who opened the session and from where. Used for audit and logging only.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub principal: String,
    pub origin: Option<String>,
}

/// Per-session process settings.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Shell started for every session.
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Capacity of the backend event channel, in chunks.
    pub output_buffer: usize,
    pub remote: RemoteOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            cols: protocol::DEFAULT_COLS,
            rows: protocol::DEFAULT_ROWS,
            env: Vec::new(),
            cwd: None,
            output_buffer: super::backend::DEFAULT_EVENT_BUFFER,
            remote: RemoteOptions::default(),
        }
    }
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub target_ref: String,
    pub display_name: String,
    pub principal: String,
    pub state: SessionState,
    pub backend: String,
    pub remote: bool,
    pub pid: Option<u32>,
    /// Unix timestamp (seconds).
    pub created_at: u64,
    /// Unix timestamp (seconds).
    pub last_activity: u64,
}

/// A terminal session.
pub struct Session {
    id: SessionId,
    target: ResolvedTarget,
    metadata: SessionMetadata,
    backend: Mutex<ProcessBackend>,
    /// Stdin queue. Writes never touch the backend lock.
    input: Option<InputSender>,
    /// Cancelled once the process has been reaped.
    process_exited: CancellationToken,
    backend_name: &'static str,
    spawn_error: Option<String>,
    pid: Option<u32>,
    state: AtomicU8,
    created: Instant,
    created_unix: u64,
    /// Milliseconds since `created`. Only ever raised.
    last_activity_ms: AtomicU64,
    size: StdMutex<(u16, u16)>,
    close_reason: StdMutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Session {
    /// Spawn the process for a new session.
    ///
    /// A spawn failure does not fail this call: the returned stream yields a
    /// single `Exited` carrying the error. Invalid remote-connect parameters
    /// are rejected before anything is spawned.
    ///
    /// For remote targets the connect line is queued as the first input. The
    /// tty or pipe holds it until the shell starts reading, so it does not
    /// wait for a prompt.
    pub fn start(
        id: SessionId,
        target: ResolvedTarget,
        metadata: SessionMetadata,
        options: &SessionOptions,
        kind: BackendKind,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ProcessEvent>), SessionError> {
        let connect_line = match target.connection {
            Some(ref params) => Some(remote::connect_command(params, &options.remote)?),
            None => None,
        };

        let mut spec = ProcessSpec::new(&options.shell).size(options.cols, options.rows);
        spec.env = options.env.clone();
        spec.cwd = options.cwd.clone();

        let (backend, events) = ProcessBackend::spawn(kind, &spec, options.output_buffer);
        let input = backend.input();

        if let (Some(line), Some(input)) = (connect_line, input.as_ref()) {
            // The queue is fresh, so only a dead writer can refuse this.
            if input.try_send(line.into_bytes()).is_err() {
                tracing::warn!(session_id = %id, "Failed to send remote connect command");
            }
        }

        let session = Arc::new(Self {
            input,
            process_exited: backend.exited(),
            backend_name: backend.kind_name(),
            spawn_error: backend.spawn_error().map(str::to_string),
            pid: backend.pid(),
            backend: Mutex::new(backend),
            id,
            target,
            metadata,
            state: AtomicU8::new(SessionState::Created as u8),
            created: Instant::now(),
            created_unix: unix_now(),
            last_activity_ms: AtomicU64::new(0),
            size: StdMutex::new((options.cols, options.rows)),
            close_reason: StdMutex::new(None),
            cancel: CancellationToken::new(),
        });

        tracing::info!(
            session_id = %session.id,
            target = %session.target.target_ref,
            backend = session.backend_name,
            pid = ?session.pid,
            remote = session.is_remote(),
            "Session started"
        );

        Ok((session, events))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn target(&self) -> &ResolvedTarget {
        &self.target
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    /// Backend in use: `pty`, `pipe`, or `none` after a failed spawn.
    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Error message if the process never started.
    pub fn spawn_error(&self) -> Option<&str> {
        self.spawn_error.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once the process has been reaped.
    pub fn process_exited(&self) -> bool {
        self.process_exited.is_cancelled()
    }

    pub fn is_remote(&self) -> bool {
        self.target.connection.is_some()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// True until destruction has been requested.
    pub fn is_active(&self) -> bool {
        self.state() < SessionState::Closing
    }

    /// Current terminal size.
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    /// Unix timestamp of creation.
    pub fn created_at(&self) -> u64 {
        self.created_unix
    }

    pub fn duration_seconds(&self) -> u64 {
        self.created.elapsed().as_secs()
    }

    /// Instant of the last recorded activity.
    pub fn last_activity(&self) -> Instant {
        self.created + Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst))
    }

    /// Time since the last activity, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Record activity now. Never moves the timestamp backwards.
    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    /// Record activity and promote `Connected` to `Active`.
    pub fn record_activity(&self) {
        self.touch();
        self.advance(SessionState::Active);
    }

    /// Mark the handshake as complete.
    pub fn mark_connected(&self) -> bool {
        self.advance(SessionState::Connected)
    }

    /// Try to move to `next`. Returns false if the transition is not legal
    /// from the current state.
    fn advance(&self, next: SessionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if !SessionState::from_u8(current).can_advance_to(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Queue input for the process.
    ///
    /// Waits while the stdin queue is full and gives up with `Inactive` as
    /// soon as the session is destroyed. Cancel safe: nothing is queued if
    /// the future is dropped before it completes.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive(self.id.clone()));
        }
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| SessionError::WriteFailed("process is not running".into()))?;
        tokio::select! {
            sent = input.send(data.to_vec()) => {
                sent.map_err(|_| SessionError::WriteFailed("process input is closed".into()))?;
            }
            _ = self.cancel.cancelled() => return Err(SessionError::Inactive(self.id.clone())),
        }
        self.record_activity();
        Ok(())
    }

    /// Resize the terminal. Has no visible effect on the pipe backend.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive(self.id.clone()));
        }
        if cols == 0 || rows == 0 {
            return Err(SessionError::ResizeFailed(format!(
                "invalid size {}x{}",
                cols, rows
            )));
        }
        self.backend.lock().await.resize(cols, rows)?;
        if let Ok(mut size) = self.size.lock() {
            *size = (cols, rows);
        }
        self.record_activity();
        Ok(())
    }

    /// Tear the session down. Only the first call does anything and returns
    /// true.
    pub async fn destroy(&self, reason: CloseReason) -> bool {
        if !self.advance(SessionState::Closing) {
            return false;
        }
        if let Ok(mut slot) = self.close_reason.lock() {
            slot.get_or_insert(reason);
        }
        self.cancel.cancel();

        {
            let mut backend = self.backend.lock().await;
            if let Err(e) = backend.kill() {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to kill session process");
            }
        }

        if tokio::time::timeout(EXIT_CONFIRM_TIMEOUT, self.process_exited.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.id, pid = ?self.pid, "Process not reaped after kill");
        }

        self.advance(SessionState::Destroyed);
        tracing::info!(
            session_id = %self.id,
            reason = reason.as_str(),
            duration_secs = self.duration_seconds(),
            "Session destroyed"
        );
        true
    }

    /// Reason recorded by the first `destroy`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|r| *r)
    }

    /// Resolves once the session has been destroyed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of kill signals delivered to the process.
    pub async fn kills_delivered(&self) -> usize {
        self.backend.lock().await.kills_delivered()
    }

    pub fn summary(&self) -> SessionSummary {
        let idle = self.last_activity_ms.load(Ordering::SeqCst) / 1000;
        SessionSummary {
            id: self.id.clone(),
            target_ref: self.target.target_ref.clone(),
            display_name: self.target.display_name.clone(),
            principal: self.metadata.principal.clone(),
            state: self.state(),
            backend: self.backend_name.to_string(),
            remote: self.is_remote(),
            pid: self.pid,
            created_at: self.created_unix,
            last_activity: self.created_unix + idle,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target.target_ref)
            .field("state", &self.state())
            .field("backend", &self.backend_name)
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::backend::drain_until_exit;

    fn local_target() -> ResolvedTarget {
        ResolvedTarget::local("local", "Local shell")
    }

    fn pipe_options(shell: &str) -> SessionOptions {
        SessionOptions {
            shell: shell.to_string(),
            ..SessionOptions::default()
        }
    }

    fn start(shell: &str) -> (Arc<Session>, mpsc::Receiver<ProcessEvent>) {
        Session::start(
            "s-1".to_string(),
            local_target(),
            SessionMetadata::default(),
            &pipe_options(shell),
            BackendKind::Pipe,
        )
        .unwrap()
    }

    #[test]
    fn test_state_transitions_forward_only() {
        use SessionState::*;
        assert!(Created.can_advance_to(Connected));
        assert!(Connected.can_advance_to(Active));
        assert!(!Created.can_advance_to(Active));
        assert!(Created.can_advance_to(Closing));
        assert!(Active.can_advance_to(Closing));
        assert!(!Closing.can_advance_to(Closing));
        assert!(!Destroyed.can_advance_to(Closing));
        assert!(!Active.can_advance_to(Connected));
        assert!(Closing.can_advance_to(Destroyed));
    }

    #[test]
    fn test_close_reason_from_exit() {
        let exited = CloseReason::from_exit(&ExitInfo {
            code: Some(2),
            error: None,
        });
        assert_eq!(exited, CloseReason::ProcessExited { code: Some(2) });
        assert_eq!(exited.exit_code(), Some(2));
        assert_eq!(exited.to_string(), "process exited with code 2");

        let failed = CloseReason::from_exit(&ExitInfo::spawn_failure("nope"));
        assert_eq!(failed, CloseReason::SpawnFailed);
        assert_eq!(failed.as_str(), "spawn_failed");
    }

    #[tokio::test]
    async fn test_session_lifecycle_states() {
        let (session, _rx) = start("cat");
        assert_eq!(session.state(), SessionState::Created);
        assert!(session.is_active());

        // Activity before the handshake does not skip Connected.
        session.record_activity();
        assert_eq!(session.state(), SessionState::Created);

        assert!(session.mark_connected());
        assert!(!session.mark_connected());
        session.write(b"x").await.unwrap();
        assert_eq!(session.state(), SessionState::Active);

        assert!(session.destroy(CloseReason::ClientClosed).await);
        assert_eq!(session.state(), SessionState::Destroyed);
        assert!(!session.is_active());
        assert!(!session.mark_connected());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_kills_once() {
        let (session, mut rx) = start("cat");

        assert!(session.destroy(CloseReason::AdminKill).await);
        assert!(!session.destroy(CloseReason::IdleTimeout).await);
        assert_eq!(session.close_reason(), Some(CloseReason::AdminKill));
        assert_eq!(session.kills_delivered().await, 1);
        assert!(session.cancel_token().is_cancelled());

        let (_, exit) = drain_until_exit(&mut rx, Duration::from_secs(5)).await;
        assert!(exit.is_some());
    }

    #[tokio::test]
    async fn test_destroy_waits_for_process_reap() {
        let (session, _rx) = start("cat");
        assert!(!session.process_exited());

        assert!(session.destroy(CloseReason::ClientClosed).await);
        assert!(session.process_exited());
        assert_eq!(session.state(), SessionState::Destroyed);
    }

    #[tokio::test]
    async fn test_blocked_write_does_not_stall_destroy() {
        let options = SessionOptions {
            shell: "/bin/sh".to_string(),
            ..SessionOptions::default()
        };
        let (session, _rx) = Session::start(
            "stuck".to_string(),
            local_target(),
            SessionMetadata::default(),
            &options,
            BackendKind::Pipe,
        )
        .unwrap();
        session.write(b"sleep 30\n").await.unwrap();

        // Far more than the pipe buffer and the input queue can hold while
        // sleep is in the foreground.
        let writer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let chunk = vec![b'x'; 16 * 1024];
                for _ in 0..600 {
                    session.write(&chunk).await?;
                }
                Ok::<(), SessionError>(())
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!writer.is_finished());

        let destroyed = tokio::time::timeout(
            Duration::from_secs(5),
            session.destroy(CloseReason::ConnectionLost),
        )
        .await;
        assert_eq!(destroyed, Ok(true));
        assert_eq!(session.state(), SessionState::Destroyed);
        assert_eq!(session.kills_delivered().await, 1);

        let pending = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(pending, Err(SessionError::Inactive(_))));
    }

    #[tokio::test]
    async fn test_write_and_resize_rejected_when_inactive() {
        let (session, _rx) = start("cat");
        session.destroy(CloseReason::ClientClosed).await;

        assert!(matches!(
            session.write(b"hello").await,
            Err(SessionError::Inactive(_))
        ));
        assert!(matches!(
            session.resize(100, 30).await,
            Err(SessionError::Inactive(_))
        ));
    }

    #[tokio::test]
    async fn test_pipe_resize_is_accepted_noop() {
        let (session, _rx) = start("cat");
        session.resize(120, 40).await.unwrap();
        assert_eq!(session.size(), (120, 40));
        assert!(session.resize(0, 40).await.is_err());
        session.destroy(CloseReason::ClientClosed).await;
    }

    #[tokio::test]
    async fn test_last_activity_monotonic() {
        let (session, _rx) = start("cat");
        let first = session.last_activity();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.touch();
        let second = session.last_activity();
        assert!(second > first);
        assert!(session.idle_for(first) == Duration::ZERO);
        session.destroy(CloseReason::ClientClosed).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_in_stream() {
        let (session, mut rx) = start("/nonexistent/termhub-shell");
        assert!(session.spawn_error().is_some());
        assert_eq!(session.backend_name(), "none");

        let (_, exit) = drain_until_exit(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(exit.unwrap().code, Some(127));
        assert!(session.write(b"x").await.is_err());
        assert!(session.destroy(CloseReason::SpawnFailed).await);
        assert_eq!(session.kills_delivered().await, 0);
    }

    #[tokio::test]
    async fn test_remote_session_types_connect_line() {
        let mut target = local_target();
        target.connection = Some(protocol::ConnectionParams {
            host: "example.invalid".to_string(),
            port: 22,
            username: "ops".to_string(),
            key_path: None,
        });
        // cat echoes whatever the session types into it.
        let (session, mut rx) = Session::start(
            "r-1".to_string(),
            target,
            SessionMetadata::default(),
            &pipe_options("cat"),
            BackendKind::Pipe,
        )
        .unwrap();
        assert!(session.is_remote());

        let mut seen = Vec::new();
        while let Ok(Some(ProcessEvent::Output(chunk))) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            seen.extend_from_slice(&chunk);
            if seen.ends_with(b"\n") {
                break;
            }
        }
        let line = String::from_utf8_lossy(&seen);
        assert!(line.starts_with("ssh -tt"));
        assert!(line.contains("ops@example.invalid"));
        session.destroy(CloseReason::ClientClosed).await;
    }

    #[test]
    fn test_invalid_remote_params_rejected_before_spawn() {
        let mut target = local_target();
        target.connection = Some(protocol::ConnectionParams {
            host: "-oProxyCommand=id".to_string(),
            port: 22,
            username: "ops".to_string(),
            key_path: None,
        });
        let result = Session::start(
            "r-2".to_string(),
            target,
            SessionMetadata::default(),
            &pipe_options("cat"),
            BackendKind::Pipe,
        );
        assert!(matches!(result, Err(SessionError::InvalidConnection(_))));
    }
}
