//! Pipe process backend.
//!
//! Fallback for hosts without PTY support. The child runs with piped stdio in
//! its own process group, so a kill reaches anything it started. There is no
//! terminal, so resize is a no-op and programs that insist on a TTY will
//! behave differently.

use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{
    spawn_writer, ExitInfo, InputSender, ProcessEvent, ProcessSpec, READ_CHUNK_SIZE,
};
use super::SessionError;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A process connected through plain pipes.
pub struct PipeProcess {
    /// `None` once stdin has been closed.
    input: Option<InputSender>,
    child: Arc<Mutex<Child>>,
    exited: CancellationToken,
    pid: u32,
    kills: usize,
}

impl PipeProcess {
    /// Spawn `spec` with piped stdio and start the reader threads.
    pub fn spawn(spec: &ProcessSpec, tx: mpsc::Sender<ProcessEvent>) -> Result<Self, SessionError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.effective_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", spec.program, e)))?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let input = match stdin {
            Some(stdin) => Some(spawn_writer(format!("pipe-writer-{}", pid), stdin)?),
            None => None,
        };

        let child = Arc::new(Mutex::new(child));
        let exited = CancellationToken::new();

        let mut readers = Vec::with_capacity(2);
        if let Some(out) = stdout {
            readers.push(spawn_reader("stdout", pid, out, tx.clone())?);
        }
        if let Some(err) = stderr {
            readers.push(spawn_reader("stderr", pid, err, tx.clone())?);
        }

        {
            let child = Arc::clone(&child);
            let exited = exited.clone();
            thread::Builder::new()
                .name(format!("pipe-waiter-{}", pid))
                .spawn(move || wait_loop(child, exited, readers, tx))?;
        }

        tracing::debug!(pid = pid, program = %spec.program, "Spawned pipe process");

        Ok(Self {
            input,
            child,
            exited,
            pid,
            kills: 0,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue for the child's stdin. Already closed if stdin was closed.
    pub fn input(&self) -> InputSender {
        match self.input {
            Some(ref input) => input.clone(),
            None => mpsc::channel(1).0,
        }
    }

    /// Drop this handle's stdin queue. The child sees EOF once every other
    /// clone is gone too.
    pub fn close_input(&mut self) {
        self.input = None;
    }

    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Sends SIGKILL to the process group. At most one signal is delivered,
    /// and never after the child has been reaped.
    pub fn kill(&mut self) -> Result<bool, SessionError> {
        if self.kills > 0 {
            return Ok(false);
        }
        let _child = self
            .child
            .lock()
            .map_err(|_| SessionError::KillFailed("child lock poisoned".into()))?;
        if self.exited.is_cancelled() {
            return Ok(false);
        }
        self.kills += 1;
        killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL)
            .map_err(|e| SessionError::KillFailed(e.to_string()))?;
        tracing::debug!(pid = self.pid, "Killed pipe process group");
        Ok(true)
    }

    pub fn kills_delivered(&self) -> usize {
        self.kills
    }
}

fn spawn_reader<R>(
    stream: &'static str,
    pid: u32,
    mut source: R,
    tx: mpsc::Sender<ProcessEvent>,
) -> Result<JoinHandle<()>, SessionError>
where
    R: Read + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("pipe-{}-{}", stream, pid))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_CHUNK_SIZE];
            loop {
                match source.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(ProcessEvent::Output(buffer[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::trace!(pid = pid, stream = stream, error = %e, "Pipe read ended");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

fn wait_loop(
    child: Arc<Mutex<Child>>,
    exited: CancellationToken,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let code = loop {
        let status = match child.lock() {
            Ok(mut child) => match child.try_wait() {
                Ok(Some(status)) => {
                    exited.cancel();
                    Some(exit_code(status))
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll pipe child");
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

    // Drain whatever the child wrote before it exited so Exited comes last.
    for reader in readers {
        let _ = reader.join();
    }

    let _ = tx.blocking_send(ProcessEvent::Exited(ExitInfo { code, error: None }));
}

/// Shell convention: signal deaths report 128 + signal number.
fn exit_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}
