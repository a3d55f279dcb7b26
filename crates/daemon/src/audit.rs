//! Session audit trail.
//!
//! Every session produces a `session_start` event when it is created and a
//! `session_end` event when it is destroyed. Events go to an [`AuditSink`]
//! through the [`AuditBridge`], which never blocks and never fails the
//! session operation that triggered it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::{CloseReason, Session};

/// Tracing target for audit records.
pub const AUDIT_TARGET: &str = "termhub::audit";

/// Default queue size for the JSON-lines sink.
pub const DEFAULT_AUDIT_QUEUE: usize = 1024;

/// Errors from audit sinks.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("audit queue full, event dropped")]
    QueueFull,

    #[error("audit writer has stopped")]
    Closed,
}

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SessionStart,
    SessionEnd,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::SessionStart => "session_start",
            AuditAction::SessionEnd => "session_end",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: AuditAction,
    pub session_id: String,
    pub principal: String,
    pub target_ref: String,
    pub remote: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl AuditEvent {
    fn for_session(action: AuditAction, session: &Session) -> Self {
        let meta = session.metadata();
        Self {
            action,
            session_id: session.id().clone(),
            principal: meta.principal.clone(),
            target_ref: session.target().target_ref.clone(),
            remote: session.is_remote(),
            origin: meta.origin.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            duration_seconds: None,
            reason: None,
            exit_code: None,
        }
    }

    pub fn session_start(session: &Session) -> Self {
        Self::for_session(AuditAction::SessionStart, session)
    }

    pub fn session_end(session: &Session, reason: CloseReason) -> Self {
        let mut event = Self::for_session(AuditAction::SessionEnd, session);
        event.duration_seconds = Some(session.duration_seconds());
        event.reason = Some(reason.as_str().to_string());
        event.exit_code = reason.exit_code();
        event
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Emits audit events as structured tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: AUDIT_TARGET,
            action = event.action.as_str(),
            session_id = %event.session_id,
            principal = %event.principal,
            target_ref = %event.target_ref,
            remote = event.remote,
            origin = ?event.origin,
            duration_secs = ?event.duration_seconds,
            reason = ?event.reason,
            exit_code = ?event.exit_code,
            "audit"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
///
/// Writes happen on a background task fed by a bounded queue; a full queue
/// drops the event rather than stall a session.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    path: PathBuf,
}

impl JsonlAuditSink {
    /// Open (or create) `path` for appending and start the writer task.
    pub async fn open(
        path: impl AsRef<Path>,
        queue: usize,
    ) -> Result<(Self, AuditWriter), AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::channel::<AuditEvent>(queue.max(1));
        let stop = CancellationToken::new();
        let writer_path = path.clone();
        let writer_stop = stop.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => write_line(&mut file, &writer_path, &event).await,
                        None => break,
                    },
                    _ = writer_stop.cancelled() => {
                        // Refuse new events, then write what is already queued.
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            write_line(&mut file, &writer_path, &event).await;
                        }
                        break;
                    }
                }
            }
            let _ = file.flush().await;
            tracing::debug!(path = %writer_path.display(), "Audit writer stopped");
        });

        Ok((Self { tx, path }, AuditWriter { handle, stop }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn write_line(file: &mut File, path: &Path, event: &AuditEvent) {
    let mut line = match serde_json::to_vec(event) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize audit event");
            return;
        }
    };
    line.push(b'\n');
    let written = match file.write_all(&line).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write audit event");
    }
}

/// Handle to the background task of a [`JsonlAuditSink`].
#[derive(Debug)]
pub struct AuditWriter {
    handle: JoinHandle<()>,
    stop: CancellationToken,
}

impl AuditWriter {
    /// Stop accepting events and wait for the queued ones to reach the file.
    /// The task is aborted if it takes longer than `timeout`.
    pub async fn close(self, timeout: Duration) {
        self.stop.cancel();
        let abort = self.handle.abort_handle();
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            tracing::warn!("Audit writer did not finish in time");
            abort.abort();
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AuditError::Closed,
        })
    }
}

/// Sends each event to several sinks. A failing sink does not stop the rest.
#[derive(Default, Clone)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(event) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Session-facing entry point for audit events. Failures are logged and
/// swallowed.
#[derive(Clone)]
pub struct AuditBridge {
    sink: Arc<dyn AuditSink>,
}

impl Default for AuditBridge {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

impl AuditBridge {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn session_start(&self, session: &Session) {
        self.emit(AuditEvent::session_start(session));
    }

    pub fn session_end(&self, session: &Session, reason: CloseReason) {
        self.emit(AuditEvent::session_end(session, reason));
    }

    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.sink.record(&event) {
            tracing::warn!(
                session_id = %event.session_id,
                action = event.action.as_str(),
                error = %e,
                "Audit record failed"
            );
        }
    }
}

/// Sink that keeps events in memory. Used by tests across the crate.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl MemoryAuditSink {
    pub(crate) fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, action: AuditAction, session_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.action == action && e.session_id == session_id)
            .count()
    }
}

#[cfg(test)]
impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
