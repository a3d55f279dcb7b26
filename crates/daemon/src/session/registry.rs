//! Session registry.
//!
//! Thread-safe map of live sessions. The registry owns session creation and
//! removal, runs the idle sweep, and emits exactly one start and one end audit
//! event per session.
//!
//! Each session gets a pump task that moves backend events to the consumer
//! channel returned by [`SessionRegistry::create_session`]. When the process
//! exits, the pump forwards the `Exited` event and then removes the session.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::backend::{BackendKind, ProcessEvent};
use super::lifecycle::{CloseReason, Session, SessionMetadata, SessionOptions, SessionSummary};
use super::{SessionError, SessionId};
use crate::audit::AuditBridge;
use crate::targets::ResolvedTarget;

/// Default idle threshold (30 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default sweep period.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long the pump waits to hand the exit event to a slow consumer.
const EXIT_FORWARD_TIMEOUT: Duration = Duration::from_secs(1);

/// Parameters for a new session.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Caller-chosen id; generated when absent.
    pub session_id: Option<SessionId>,
    pub target: ResolvedTarget,
    pub metadata: SessionMetadata,
    pub cols: u16,
    pub rows: u16,
}

impl CreateRequest {
    pub fn new(target: ResolvedTarget, principal: impl Into<String>) -> Self {
        Self {
            session_id: None,
            target,
            metadata: SessionMetadata {
                principal: principal.into(),
                origin: None,
            },
            cols: protocol::DEFAULT_COLS,
            rows: protocol::DEFAULT_ROWS,
        }
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
}

/// Thread-safe session registry using DashMap.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Ids of destroyed sessions. Never handed out again.
    retired: DashSet<SessionId>,
    /// Ids claimed by a create that is still spawning.
    pending: DashSet<SessionId>,
    /// Live plus pending sessions. Bounded by `max_sessions`.
    slots: AtomicUsize,
    options: SessionOptions,
    backend: BackendKind,
    max_sessions: usize,
    audit: AuditBridge,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry. `backend` should already be resolved; `Auto` is
    /// resolved here once so every session uses the same backend.
    pub fn new(
        options: SessionOptions,
        backend: BackendKind,
        max_sessions: usize,
        audit: AuditBridge,
    ) -> Self {
        let backend = backend.resolve();
        tracing::info!(backend = %backend, max_sessions = max_sessions, "Session registry ready");
        Self {
            sessions: DashMap::new(),
            retired: DashSet::new(),
            pending: DashSet::new(),
            slots: AtomicUsize::new(0),
            options,
            backend,
            max_sessions,
            audit,
            created_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
        }
    }

    /// Backend every session is started with.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Create and register a session, spawning its process.
    ///
    /// Returns the session and the consumer end of its event stream.
    pub fn create_session(
        self: &Arc<Self>,
        request: CreateRequest,
    ) -> Result<(Arc<Session>, mpsc::Receiver<ProcessEvent>), SessionError> {
        let id = request
            .session_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_id(&request.metadata.principal));

        // Claim the id first: a concurrent create for the same id either
        // sees the claim or the registered session.
        if !self.pending.insert(id.clone()) {
            return Err(SessionError::DuplicateSessionId(id));
        }
        let result = self.reserve_and_start(id.clone(), request);
        self.pending.remove(&id);
        let (session, events) = result?;

        self.created_total.fetch_add(1, Ordering::Relaxed);
        self.audit.session_start(&session);

        let (out_tx, out_rx) = mpsc::channel(self.options.output_buffer.max(1));
        self.spawn_pump(Arc::clone(&session), events, out_tx);

        Ok((session, out_rx))
    }

    /// Take a slot, spawn the process outside any map lock, then register.
    fn reserve_and_start(
        &self,
        id: SessionId,
        request: CreateRequest,
    ) -> Result<(Arc<Session>, mpsc::Receiver<ProcessEvent>), SessionError> {
        if self.retired.contains(&id) || self.sessions.contains_key(&id) {
            return Err(SessionError::DuplicateSessionId(id));
        }
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max_sessions).then_some(used + 1)
            })
            .map_err(SessionError::LimitReached)?;

        let mut options = self.options.clone();
        options.cols = request.cols;
        options.rows = request.rows;

        let started = Session::start(
            id.clone(),
            request.target,
            request.metadata,
            &options,
            self.backend,
        );
        match started {
            Ok((session, events)) => {
                self.sessions.insert(id, Arc::clone(&session));
                Ok((session, events))
            }
            Err(e) => {
                self.slots.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::Receiver<ProcessEvent>,
        out: mpsc::Sender<ProcessEvent>,
    ) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let cancel = session.cancel_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(ProcessEvent::Output(chunk)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            sent = out.send(ProcessEvent::Output(chunk)) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(ProcessEvent::Exited(info)) => {
                        tracing::debug!(session_id = %session.id(), code = ?info.code, "Session process exited");
                        let reason = CloseReason::from_exit(&info);
                        // The consumer may be gone or stalled; the exit still
                        // has to be recorded.
                        let _ = tokio::time::timeout(
                            EXIT_FORWARD_TIMEOUT,
                            out.send(ProcessEvent::Exited(info)),
                        )
                        .await;
                        if let Some(registry) = registry.upgrade() {
                            let _ = registry.destroy(session.id(), reason).await;
                        }
                        break;
                    }
                    None => break,
                }
            }
        });
    }

    /// Look up a live session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Remove and destroy a session.
    ///
    /// The session leaves the map before anything is awaited, so it never
    /// shows up in a listing after this call starts.
    pub async fn destroy(&self, id: &str, reason: CloseReason) -> Result<(), SessionError> {
        let (id, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        self.retired.insert(id);
        self.slots.fetch_sub(1, Ordering::SeqCst);

        if session.destroy(reason).await {
            self.destroyed_total.fetch_add(1, Ordering::Relaxed);
            self.audit.session_end(&session, reason);
        }
        Ok(())
    }

    /// Summaries of every live session, oldest first.
    pub fn list_active(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.value().summary())
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.sessions.len(),
            created_total: self.created_total.load(Ordering::Relaxed),
            destroyed_total: self.destroyed_total.load(Ordering::Relaxed),
        }
    }

    /// Destroy every session idle for longer than `max_idle`.
    pub async fn sweep_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        self.sweep_idle_at(max_idle, Instant::now()).await
    }

    /// Like [`sweep_idle`](Self::sweep_idle) with an explicit clock. A session
    /// idle for exactly `max_idle` survives.
    pub async fn sweep_idle_at(&self, max_idle: Duration, now: Instant) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for(now) > max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut destroyed = Vec::with_capacity(expired.len());
        for id in expired {
            if self.destroy(&id, CloseReason::IdleTimeout).await.is_ok() {
                tracing::info!(session_id = %id, "Destroyed idle session");
                destroyed.push(id);
            }
        }
        destroyed
    }

    /// Starts a background task that periodically sweeps idle sessions.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let destroyed = registry.sweep_idle(max_idle).await;
                        if !destroyed.is_empty() {
                            tracing::info!(count = destroyed.len(), "Idle sweep finished");
                        }
                    }
                }
            }
            tracing::debug!("Idle sweeper stopped");
        })
    }

    /// Destroy every session. Used on daemon shutdown.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut count = 0;
        for id in ids {
            if self.destroy(&id, CloseReason::Shutdown).await.is_ok() {
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(count = count, "Destroyed sessions on shutdown");
        }
        count
    }
}

fn generate_id(principal: &str) -> SessionId {
    let prefix = if principal.is_empty() { "session" } else { principal };
    format!("{}-{}", prefix, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditSink};
    use crate::session::backend::drain_until_exit;
    use crate::session::SessionState;

    fn registry_with(shell: &str, max: usize) -> (Arc<SessionRegistry>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let options = SessionOptions {
            shell: shell.to_string(),
            ..SessionOptions::default()
        };
        let registry = Arc::new(SessionRegistry::new(
            options,
            BackendKind::Pipe,
            max,
            AuditBridge::new(sink.clone()),
        ));
        (registry, sink)
    }

    fn request(id: &str) -> CreateRequest {
        let mut req = CreateRequest::new(ResolvedTarget::local("local", "Local"), "admin");
        req.session_id = Some(id.to_string());
        req
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (registry, sink) = registry_with("cat", 10);
        let (session, _rx) = registry.create_session(request("a")).unwrap();

        let found = registry.get("a").expect("session should be registered");
        assert!(Arc::ptr_eq(&session, &found));
        assert!(found.is_active());
        assert_eq!(registry.count(), 1);
        assert_eq!(sink.count(AuditAction::SessionStart, "a"), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_generated_id_uses_principal() {
        let (registry, _) = registry_with("cat", 10);
        let req = CreateRequest::new(ResolvedTarget::local("local", "Local"), "alice");
        let (session, _rx) = registry.create_session(req).unwrap();
        assert!(session.id().starts_with("alice-"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_live_id_rejected() {
        let (registry, _) = registry_with("cat", 10);
        let (original, _rx) = registry.create_session(request("dup")).unwrap();

        let result = registry.create_session(request("dup"));
        assert!(matches!(result, Err(SessionError::DuplicateSessionId(_))));

        let still = registry.get("dup").unwrap();
        assert!(Arc::ptr_eq(&original, &still));
        assert!(still.is_active());
        assert_eq!(registry.count(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_retired_id_never_reused() {
        let (registry, _) = registry_with("cat", 10);
        let (_s, _rx) = registry.create_session(request("once")).unwrap();
        registry.destroy("once", CloseReason::ClientClosed).await.unwrap();

        let result = registry.create_session(request("once"));
        assert!(matches!(result, Err(SessionError::DuplicateSessionId(_))));
    }

    #[tokio::test]
    async fn test_limit_reached() {
        let (registry, _) = registry_with("cat", 1);
        let (_s, _rx) = registry.create_session(request("one")).unwrap();
        let result = registry.create_session(request("two"));
        assert!(matches!(result, Err(SessionError::LimitReached(1))));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_destroy_removes_and_kills_once() {
        let (registry, sink) = registry_with("cat", 10);
        let (session, mut rx) = registry.create_session(request("gone")).unwrap();

        registry.destroy("gone", CloseReason::ClientClosed).await.unwrap();
        assert!(registry.get("gone").is_none());
        assert!(registry.list_active().is_empty());
        assert_eq!(session.kills_delivered().await, 1);

        // A second destroy finds nothing and kills nothing.
        assert!(matches!(
            registry.destroy("gone", CloseReason::AdminKill).await,
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(session.kills_delivered().await, 1);

        // The pump stops on cancel, so the consumer sees the stream end.
        let _ = drain_until_exit(&mut rx, Duration::from_secs(2)).await;
        assert_eq!(sink.count(AuditAction::SessionEnd, "gone"), 1);
        assert_eq!(registry.stats().destroyed_total, 1);
    }

    #[tokio::test]
    async fn test_sweep_boundary() {
        let (registry, _) = registry_with("cat", 10);
        let (session, _rx) = registry.create_session(request("edge")).unwrap();

        let threshold = Duration::from_secs(60);
        let last = session.last_activity();

        // Exactly at the threshold survives.
        let destroyed = registry.sweep_idle_at(threshold, last + threshold).await;
        assert!(destroyed.is_empty());
        assert!(registry.get("edge").is_some());

        let destroyed = registry
            .sweep_idle_at(threshold, last + threshold + Duration::from_millis(1))
            .await;
        assert_eq!(destroyed, vec!["edge".to_string()]);
        assert!(registry.get("edge").is_none());
        assert_eq!(session.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test]
    async fn test_sweep_leaves_recent_sessions() {
        let (registry, _) = registry_with("cat", 10);
        let (stale, _rx1) = registry.create_session(request("stale")).unwrap();
        let (fresh, _rx2) = registry.create_session(request("fresh")).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fresh.write(b"keepalive\n").await.unwrap();

        let threshold = Duration::from_secs(60);
        let now = stale.last_activity() + threshold + Duration::from_millis(1);
        let destroyed = registry.sweep_idle_at(threshold, now).await;

        assert_eq!(destroyed, vec!["stale".to_string()]);
        assert!(registry.get("fresh").is_some());
        assert!(fresh.is_active());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_process_exit_removes_session() {
        let (registry, sink) = registry_with("/bin/sh", 10);
        let (session, mut rx) = registry.create_session(request("exits")).unwrap();

        session.write(b"exit 7\n").await.unwrap();
        let (_, exit) = drain_until_exit(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(exit.unwrap().code, Some(7));

        // The pump removes the session right after forwarding Exited.
        for _ in 0..50 {
            if registry.get("exits").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.get("exits").is_none());
        assert_eq!(
            session.close_reason(),
            Some(CloseReason::ProcessExited { code: Some(7) })
        );
        assert_eq!(session.kills_delivered().await, 0);

        let end: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| e.action == AuditAction::SessionEnd)
            .collect();
        assert_eq!(end.len(), 1);
        assert_eq!(end[0].exit_code, Some(7));
    }

    #[tokio::test]
    async fn test_spawn_failure_session_cleans_up() {
        let (registry, sink) = registry_with("/nonexistent/termhub-shell", 10);
        let (session, mut rx) = registry.create_session(request("broken")).unwrap();
        assert!(session.spawn_error().is_some());

        let (_, exit) = drain_until_exit(&mut rx, Duration::from_secs(5)).await;
        assert_eq!(exit.unwrap().code, Some(127));

        for _ in 0..50 {
            if registry.get("broken").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(registry.get("broken").is_none());
        assert_eq!(session.close_reason(), Some(CloseReason::SpawnFailed));
        assert_eq!(sink.count(AuditAction::SessionEnd, "broken"), 1);
    }

    #[tokio::test]
    async fn test_destroy_frees_slot() {
        let (registry, _) = registry_with("cat", 1);
        let (_s, _rx) = registry.create_session(request("first")).unwrap();
        registry.destroy("first", CloseReason::ClientClosed).await.unwrap();

        let (_s, _rx) = registry.create_session(request("second")).unwrap();
        assert_eq!(registry.count(), 1);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_limit() {
        let (registry, _) = registry_with("cat", 3);

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .create_session(request(&format!("race-{}", i)))
                        .map(|(session, _rx)| session.id().clone())
                })
            })
            .collect();

        let mut created = 0;
        let mut refused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(SessionError::LimitReached(_)) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(created, 3);
        assert_eq!(refused, 9);
        assert_eq!(registry.count(), 3);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_same_id() {
        let (registry, _) = registry_with("cat", 10);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .create_session(request("contested"))
                        .map(|(session, _rx)| session.id().clone())
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(SessionError::DuplicateSessionId(id)) => assert_eq!(id, "contested"),
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.count(), 1);
        registry.shutdown().await;
    }

    fn small_buffer_registry() -> Arc<SessionRegistry> {
        let options = SessionOptions {
            shell: "/bin/sh".to_string(),
            output_buffer: 4,
            ..SessionOptions::default()
        };
        Arc::new(SessionRegistry::new(
            options,
            BackendKind::Pipe,
            10,
            AuditBridge::default(),
        ))
    }

    #[tokio::test]
    async fn test_paused_consumer_loses_no_output() {
        let registry = small_buffer_registry();
        let (session, mut rx) = registry.create_session(request("flow")).unwrap();

        // Roughly 230 KB, far beyond the 4-chunk channels on either side of
        // the pump.
        session.write(b"seq 1 40000\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let expected: String = (1..=40000).map(|n| format!("{}\n", n)).collect();
        let mut seen = Vec::new();
        while seen.len() < expected.len() {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ProcessEvent::Output(chunk))) => seen.extend_from_slice(&chunk),
                other => panic!("output stopped early: {:?}", other),
            }
        }
        assert_eq!(String::from_utf8_lossy(&seen), expected);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_destroy_prompt_while_reader_is_blocked() {
        let registry = small_buffer_registry();
        let (session, _rx) = registry.create_session(request("flood")).unwrap();

        session.write(b"seq 1 100000000\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let destroyed = tokio::time::timeout(
            Duration::from_secs(5),
            registry.destroy("flood", CloseReason::AdminKill),
        )
        .await;
        assert!(matches!(destroyed, Ok(Ok(()))));
        assert_eq!(session.state(), SessionState::Destroyed);
        assert!(session.process_exited());
        assert_eq!(session.kills_delivered().await, 1);
    }

    #[tokio::test]
    async fn test_blocked_input_does_not_stall_destroy() {
        let (registry, _) = registry_with("/bin/sh", 10);
        let (session, _rx) = registry.create_session(request("stuck")).unwrap();
        session.write(b"sleep 30\n").await.unwrap();

        let writer = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let chunk = vec![b'y'; 16 * 1024];
                for _ in 0..600 {
                    session.write(&chunk).await?;
                }
                Ok::<(), SessionError>(())
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let destroyed = tokio::time::timeout(
            Duration::from_secs(5),
            registry.destroy("stuck", CloseReason::ConnectionLost),
        )
        .await;
        assert!(matches!(destroyed, Ok(Ok(()))));
        assert_eq!(session.state(), SessionState::Destroyed);

        let pending = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_isolated() {
        let (registry, _) = registry_with("cat", 10);
        let (a, mut rx_a) = registry.create_session(request("iso-a")).unwrap();
        let (b, mut rx_b) = registry.create_session(request("iso-b")).unwrap();

        for i in 0..20 {
            a.write(format!("A{}\n", i).as_bytes()).await.unwrap();
            b.write(format!("B{}\n", i).as_bytes()).await.unwrap();
        }

        let collect = |rx: &mut mpsc::Receiver<ProcessEvent>| {
            let mut out = Vec::new();
            while let Ok(ProcessEvent::Output(chunk)) = rx.try_recv() {
                out.extend_from_slice(&chunk);
            }
            out
        };

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        for _ in 0..100 {
            seen_a.extend(collect(&mut rx_a));
            seen_b.extend(collect(&mut rx_b));
            if seen_a.ends_with(b"A19\n") && seen_b.ends_with(b"B19\n") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let expected_a: String = (0..20).map(|i| format!("A{}\n", i)).collect();
        let expected_b: String = (0..20).map(|i| format!("B{}\n", i)).collect();
        assert_eq!(String::from_utf8_lossy(&seen_a), expected_a);
        assert_eq!(String::from_utf8_lossy(&seen_b), expected_b);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_destroys_all() {
        let (registry, sink) = registry_with("cat", 10);
        let (_a, _rx_a) = registry.create_session(request("s1")).unwrap();
        let (_b, _rx_b) = registry.create_session(request("s2")).unwrap();

        assert_eq!(registry.shutdown().await, 2);
        assert_eq!(registry.count(), 0);
        let ends = sink
            .events()
            .into_iter()
            .filter(|e| e.action == AuditAction::SessionEnd && e.reason.as_deref() == Some("shutdown"))
            .count();
        assert_eq!(ends, 2);
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_shutdown() {
        let (registry, _) = registry_with("cat", 10);
        let shutdown = CancellationToken::new();
        let handle = registry.start_sweeper(Duration::from_millis(10), DEFAULT_IDLE_TIMEOUT, shutdown.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
