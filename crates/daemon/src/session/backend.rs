//! Process backend abstraction.
//!
//! A backend runs one child process and turns its output into a stream of
//! [`ProcessEvent`]s: any number of `Output` chunks followed by exactly one
//! `Exited`. Each backend has a single producer for its channel, and that
//! producer sends `Exited` last and then drops the sender, so nothing can be
//! observed after the exit event.
//!
//! The channel is bounded. Reader threads block when it is full, which stalls
//! the child on its next write instead of buffering unbounded output.
//!
//! Input goes the other way through a bounded [`InputSender`] drained by a
//! writer thread, so a child that stops reading its stdin only ever blocks
//! that thread.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::thread;

use portable_pty::{native_pty_system, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::pipe::PipeProcess;
use super::pty::PtyProcess;
use super::SessionError;

/// Maximum size of one output chunk.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Exit code reported when the process could not be started.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Default capacity of a backend event channel, in chunks.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Capacity of the stdin queue, in writes.
pub const INPUT_QUEUE: usize = 64;

/// Queue feeding the child's stdin.
pub type InputSender = mpsc::Sender<Vec<u8>>;

/// Which process backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// PTY when the host supports it, pipes otherwise.
    #[default]
    Auto,
    /// Pseudo-terminal via portable-pty.
    Pty,
    /// Plain stdin/stdout/stderr pipes. Resize has no effect.
    Pipe,
}

impl BackendKind {
    /// Resolve `Auto` into a concrete backend by probing for PTY support.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto => {
                if pty_available() {
                    BackendKind::Pty
                } else {
                    tracing::warn!("PTY allocation failed, falling back to pipe backend");
                    BackendKind::Pipe
                }
            }
            other => other,
        }
    }

    /// Lowercase name used in config and frame metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::Pty => "pty",
            BackendKind::Pipe => "pipe",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns true if a pseudo-terminal can be opened on this host.
pub fn pty_available() -> bool {
    native_pty_system()
        .openpty(PtySize {
            rows: 1,
            cols: 1,
            pixel_width: 0,
            pixel_height: 0,
        })
        .is_ok()
}

/// How the child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when one is known.
    pub code: Option<i32>,
    /// Set when the process never started.
    pub error: Option<String>,
}

impl ExitInfo {
    /// Exit info for a process that could not be spawned.
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            code: Some(SPAWN_FAILURE_CODE),
            error: Some(message.into()),
        }
    }
}

/// Events produced by a running backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of stdout/stderr, at most [`READ_CHUNK_SIZE`] bytes.
    Output(Vec<u8>),
    /// The process is gone. Always the last event.
    Exited(ExitInfo),
}

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

impl ProcessSpec {
    /// Run `program` with no arguments in an 80x24 terminal.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            cols: protocol::DEFAULT_COLS,
            rows: protocol::DEFAULT_ROWS,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Environment passed to the child: terminal defaults plus overrides.
    pub fn effective_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(self.env.len() + 2);
        for (key, value) in [("TERM", "xterm-256color"), ("COLORTERM", "truecolor")] {
            if !self.env.iter().any(|(k, _)| k == key) {
                env.push((key.to_string(), value.to_string()));
            }
        }
        env.extend(self.env.iter().cloned());
        env
    }
}

/// Start the thread that owns the child's stdin and drains the input queue.
///
/// The thread stops when every sender is dropped or a write fails.
pub(crate) fn spawn_writer<W>(name: String, mut sink: W) -> std::io::Result<InputSender>
where
    W: Write + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
    thread::Builder::new().name(name).spawn(move || {
        while let Some(chunk) = rx.blocking_recv() {
            if let Err(e) = sink.write_all(&chunk).and_then(|_| sink.flush()) {
                tracing::trace!(error = %e, "Input writer stopped");
                break;
            }
        }
    })?;
    Ok(tx)
}

/// A running (or failed) child process.
pub enum ProcessBackend {
    Pty(PtyProcess),
    Pipe(PipeProcess),
    /// Spawn failed; the event stream holds a single `Exited`.
    Failed(String),
}

impl ProcessBackend {
    /// Start a process. Never fails: a spawn error is reported as a
    /// [`ProcessBackend::Failed`] handle whose stream yields one `Exited` with
    /// code 127.
    pub fn spawn(
        kind: BackendKind,
        spec: &ProcessSpec,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));

        let result = match kind.resolve() {
            BackendKind::Pty => PtyProcess::spawn(spec, tx.clone()).map(ProcessBackend::Pty),
            _ => PipeProcess::spawn(spec, tx.clone()).map(ProcessBackend::Pipe),
        };

        match result {
            Ok(backend) => (backend, rx),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(program = %spec.program, error = %message, "Process spawn failed");
                // The channel is fresh and has capacity, so this cannot fail.
                let _ = tx.try_send(ProcessEvent::Exited(ExitInfo::spawn_failure(&message)));
                (ProcessBackend::Failed(message), rx)
            }
        }
    }

    /// Backend name for metadata and listings.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProcessBackend::Pty(_) => "pty",
            ProcessBackend::Pipe(_) => "pipe",
            ProcessBackend::Failed(_) => "none",
        }
    }

    /// Spawn error, if the process never started.
    pub fn spawn_error(&self) -> Option<&str> {
        match self {
            ProcessBackend::Failed(message) => Some(message),
            _ => None,
        }
    }

    /// Process id of the child.
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessBackend::Pty(p) => p.pid(),
            ProcessBackend::Pipe(p) => Some(p.pid()),
            ProcessBackend::Failed(_) => None,
        }
    }

    /// Queue for the process stdin. `None` if the process never started.
    pub fn input(&self) -> Option<InputSender> {
        match self {
            ProcessBackend::Pty(p) => Some(p.input()),
            ProcessBackend::Pipe(p) => Some(p.input()),
            ProcessBackend::Failed(_) => None,
        }
    }

    /// Cancelled once the child has been reaped. Already cancelled for a
    /// failed spawn.
    pub fn exited(&self) -> CancellationToken {
        match self {
            ProcessBackend::Pty(p) => p.exited(),
            ProcessBackend::Pipe(p) => p.exited(),
            ProcessBackend::Failed(_) => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Change the terminal size. A no-op for the pipe backend.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        match self {
            ProcessBackend::Pty(p) => p.resize(cols, rows),
            ProcessBackend::Pipe(_) | ProcessBackend::Failed(_) => Ok(()),
        }
    }

    /// Terminate the process. Returns true only for the call that delivered
    /// the signal; later calls and calls after exit return false.
    pub fn kill(&mut self) -> Result<bool, SessionError> {
        match self {
            ProcessBackend::Pty(p) => p.kill(),
            ProcessBackend::Pipe(p) => p.kill(),
            ProcessBackend::Failed(_) => Ok(false),
        }
    }

    /// Number of termination signals delivered so far.
    pub fn kills_delivered(&self) -> usize {
        match self {
            ProcessBackend::Pty(p) => p.kills_delivered(),
            ProcessBackend::Pipe(p) => p.kills_delivered(),
            ProcessBackend::Failed(_) => 0,
        }
    }
}

impl fmt::Debug for ProcessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBackend")
            .field("kind", &self.kind_name())
            .field("pid", &self.pid())
            .finish()
    }
}

/// Collect events until `Exited`, with a deadline. Test helper shared by the
/// backend test modules.
#[cfg(test)]
pub(crate) async fn drain_until_exit(
    rx: &mut mpsc::Receiver<ProcessEvent>,
    deadline: std::time::Duration,
) -> (Vec<u8>, Option<ExitInfo>) {
    let mut output = Vec::new();
    let result = tokio::time::timeout(deadline, async {
        while let Some(event) = rx.recv().await {
            match event {
                ProcessEvent::Output(chunk) => output.extend_from_slice(&chunk),
                ProcessEvent::Exited(info) => return Some(info),
            }
        }
        None
    })
    .await;
    (output, result.ok().flatten())
}
