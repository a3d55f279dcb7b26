//! PTY process backend.
//!
//! Spawns the child on the slave side of a pseudo-terminal. Three threads
//! serve it: a reader forwarding master output, a writer draining the input
//! queue, and a waiter that reaps the child. The waiter joins the reader
//! before sending `Exited`, so it is the last event.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{
    spawn_writer, ExitInfo, InputSender, ProcessEvent, ProcessSpec, READ_CHUNK_SIZE,
};
use super::SessionError;

/// How often the waiter thread polls the child.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// A process attached to a pseudo-terminal.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    input: InputSender,
    child: SharedChild,
    /// Cancelled once the child has been reaped. Checked under the child lock
    /// so a kill never races with the reap.
    exited: CancellationToken,
    pid: Option<u32>,
    kills: usize,
    cols: u16,
    rows: u16,
}

impl PtyProcess {
    /// Spawn `spec` on a new PTY and start its threads.
    pub fn spawn(spec: &ProcessSpec, tx: mpsc::Sender<ProcessEvent>) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(ref dir) = spec.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in spec.effective_env() {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // Our copy of the slave must go, otherwise the master never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let label = pid.unwrap_or(0);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let input = spawn_writer(format!("pty-writer-{}", label), writer)?;

        let child: SharedChild = Arc::new(Mutex::new(child));
        let exited = CancellationToken::new();

        let reader = {
            let tx = tx.clone();
            thread::Builder::new()
                .name(format!("pty-reader-{}", label))
                .spawn(move || read_loop(reader, tx))?
        };

        {
            let child = Arc::clone(&child);
            let exited = exited.clone();
            thread::Builder::new()
                .name(format!("pty-waiter-{}", label))
                .spawn(move || wait_loop(child, exited, reader, tx))?;
        }

        tracing::debug!(pid = ?pid, program = %spec.program, "Spawned PTY process");

        Ok(Self {
            master: pair.master,
            input,
            child,
            exited,
            pid,
            kills: 0,
            cols: spec.cols,
            rows: spec.rows,
        })
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn input(&self) -> InputSender {
        self.input.clone()
    }

    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        self.cols = cols;
        self.rows = rows;

        tracing::debug!(pid = ?self.pid, cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    /// Terminates the child. At most one signal is ever delivered.
    pub fn kill(&mut self) -> Result<bool, SessionError> {
        if self.kills > 0 {
            return Ok(false);
        }
        let mut child = self
            .child
            .lock()
            .map_err(|_| SessionError::KillFailed("child lock poisoned".into()))?;
        if self.exited.is_cancelled() {
            return Ok(false);
        }
        self.kills += 1;
        child
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;
        tracing::debug!(pid = ?self.pid, "Killed PTY process");
        Ok(true)
    }

    pub fn kills_delivered(&self) -> usize {
        self.kills
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<ProcessEvent>) {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(ProcessEvent::Output(buffer[..n].to_vec())).is_err() {
                    // Receiver dropped: the session is being torn down.
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the slave side is closed.
            Err(e) => {
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

fn wait_loop(
    child: SharedChild,
    exited: CancellationToken,
    reader: JoinHandle<()>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let code = loop {
        let status = match child.lock() {
            Ok(mut child) => match child.try_wait() {
                Ok(Some(status)) => {
                    exited.cancel();
                    Some(Some(status.exit_code() as i32))
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll PTY child");
                    exited.cancel();
                    Some(None)
                }
            },
            Err(_) => {
                exited.cancel();
                Some(None)
            }
        };
        match status {
            Some(code) => break code,
            None => thread::sleep(REAP_POLL_INTERVAL),
        }
    };

    // Output written before the exit is still in the PTY buffer.
    let _ = reader.join();

    let _ = tx.blocking_send(ProcessEvent::Exited(ExitInfo { code, error: None }));
}
