//! Daemon orchestrator.
//!
//! Builds the session registry, audit sinks, identity verifier and target
//! resolver from [`Config`], then runs the WebSocket gateway, the idle sweeper
//! and the control socket until stopped.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use protocol::FrameCodec;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::audit::{
    AuditBridge, AuditSink, AuditWriter, FanoutAuditSink, JsonlAuditSink, TracingAuditSink,
    DEFAULT_AUDIT_QUEUE,
};
use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::gateway::{GatewayServer, GatewayState};
use crate::ipc::{
    get_pid_file_path, get_socket_path, IpcConnection, IpcRequest, IpcResponse, IpcServer,
    IpcSessionInfo, PidFile,
};
use crate::session::{CloseReason, SessionRegistry};
use crate::targets::StaticTargetResolver;

/// How long `stop` waits for background tasks.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const AUDIT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    /// The gateway is accepting connections.
    Listening { addr: SocketAddr },
    Error { message: String },
}

/// Owns every long-running daemon task.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    gateway_state: Arc<GatewayState>,
    socket_path: PathBuf,
    pid_path: Option<PathBuf>,
    pid_file: Option<PidFile>,
    local_addr: Option<SocketAddr>,
    started_at: Instant,
    tasks: TaskTracker,
    audit_writer: Option<AuditWriter>,
    /// Cancelled on stop. Observed by every task.
    shutdown_token: CancellationToken,
    /// Cancelled when a client asks the daemon to stop over the control socket.
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Build all subsystems. Nothing listens until [`Self::start`].
    pub async fn new(config: Config) -> Result<Self> {
        let (audit, audit_writer) = Self::build_audit(&config).await?;

        let registry = Arc::new(SessionRegistry::new(
            config.session_options(),
            config.session.backend,
            config.session.max_sessions,
            audit,
        ));

        let verifier = TokenVerifier::from_entries(&config.auth.tokens);
        if verifier.is_empty() {
            warn!("No client tokens configured; every connection will be rejected");
        }
        let resolver = StaticTargetResolver::from_config(&config.targets);
        info!(
            tokens = verifier.len(),
            targets = resolver.len(),
            "Loaded access configuration"
        );

        let mut gateway_state =
            GatewayState::new(Arc::clone(&registry), Arc::new(verifier), Arc::new(resolver));
        gateway_state.codec = FrameCodec::with_max_frame_size(config.server.max_frame_bytes);
        gateway_state.allow_client_params = config.ssh.allow_client_params;
        gateway_state.default_size = (config.session.cols, config.session.rows);

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            gateway_state: Arc::new(gateway_state),
            socket_path: get_socket_path(),
            pid_path: Some(get_pid_file_path()),
            pid_file: None,
            local_addr: None,
            started_at: Instant::now(),
            tasks: TaskTracker::new(),
            audit_writer,
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        })
    }

    /// Audit events always go to the log; the JSON-lines file is optional.
    async fn build_audit(config: &Config) -> Result<(AuditBridge, Option<AuditWriter>)> {
        if !config.daemon.audit_file {
            return Ok((AuditBridge::default(), None));
        }

        let path = config.audit_log_path();
        let (file_sink, writer) = JsonlAuditSink::open(&path, DEFAULT_AUDIT_QUEUE)
            .await
            .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
        info!(path = %path.display(), "Writing audit log");

        let fanout = FanoutAuditSink::new()
            .with(Arc::new(TracingAuditSink))
            .with(Arc::new(file_sink));
        let sink: Arc<dyn AuditSink> = Arc::new(fanout);
        Ok((AuditBridge::new(sink), Some(writer)))
    }

    /// Use a different control socket path.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Use a different PID file path, or none at all.
    pub fn with_pid_file(mut self, path: Option<PathBuf>) -> Self {
        self.pid_path = path;
        self
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Gateway address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Resolves when a client sent `Stop` over the control socket.
    pub async fn stop_requested(&self) {
        self.stop_requested.cancelled().await
    }

    /// Bind the gateway and control socket and start all background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let bind_addr: SocketAddr = self
            .config
            .server
            .bind_addr
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.config.server.bind_addr))?;
        let gateway = GatewayServer::bind(bind_addr, Arc::clone(&self.gateway_state))
            .await
            .with_context(|| format!("Failed to bind gateway on {}", bind_addr))?;
        let local_addr = gateway.local_addr()?;
        self.local_addr = Some(local_addr);
        self.tasks.spawn(gateway.run(self.shutdown_token.clone()));
        self.emit_event(OrchestratorEvent::Listening { addr: local_addr });

        let sweeper = self.registry.start_sweeper(
            self.config.session.sweep_interval(),
            self.config.session.idle_timeout(),
            self.shutdown_token.clone(),
        );
        self.tasks.spawn(async move {
            let _ = sweeper.await;
        });
        debug!(
            interval_secs = self.config.session.sweep_interval_secs,
            idle_timeout_secs = self.config.session.idle_timeout_secs,
            "Started idle sweeper"
        );

        let ipc = IpcServer::bind(&self.socket_path).await.with_context(|| {
            format!(
                "Failed to bind control socket: {}",
                self.socket_path.display()
            )
        })?;
        let context = Arc::new(ControlContext {
            registry: Arc::clone(&self.registry),
            started_at: self.started_at,
            bind_addr: local_addr,
            stop_requested: self.stop_requested.clone(),
        });
        self.tasks
            .spawn(run_control_socket(ipc, context, self.shutdown_token.clone()));

        if let Some(path) = &self.pid_path {
            match PidFile::create(path) {
                Ok(pid_file) => self.pid_file = Some(pid_file),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write PID file"),
            }
        }

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = %local_addr, "Daemon orchestrator started");
        Ok(())
    }

    /// Stop accepting connections, close every session and wait for the
    /// background tasks.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                OrchestratorState::Stopped => return Ok(()),
                OrchestratorState::ShuttingDown => {
                    anyhow::bail!("Orchestrator is already shutting down")
                }
                _ => *state = OrchestratorState::ShuttingDown,
            }
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();

        self.tasks.close();
        if tokio::time::timeout(STOP_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            let message = "Timed out waiting for background tasks".to_string();
            warn!("{}", message);
            self.emit_event(OrchestratorEvent::Error { message });
        }

        // Connections close their own sessions; this catches the rest.
        let remaining = self.registry.shutdown().await;
        if remaining > 0 {
            debug!(count = remaining, "Closed sessions without a connection");
        }

        // Every session_end is queued by now; flush them before exiting.
        if let Some(writer) = self.audit_writer.take() {
            writer.close(AUDIT_CLOSE_TIMEOUT).await;
        }

        self.pid_file = None;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// What control-socket handlers need from the daemon.
struct ControlContext {
    registry: Arc<SessionRegistry>,
    started_at: Instant,
    bind_addr: SocketAddr,
    stop_requested: CancellationToken,
}

impl ControlContext {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => {
                let stats = self.registry.stats();
                IpcResponse::Status {
                    running: true,
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    session_count: stats.active,
                    sessions_created: stats.created_total,
                    backend: self.registry.backend().to_string(),
                    bind_addr: self.bind_addr.to_string(),
                }
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self
                    .registry
                    .list_active()
                    .into_iter()
                    .map(IpcSessionInfo::from)
                    .collect(),
            },
            IpcRequest::KillSession { session_id } => {
                match self
                    .registry
                    .destroy(&session_id, CloseReason::AdminKill)
                    .await
                {
                    Ok(()) => {
                        info!(session_id = %session_id, "Session killed by administrator");
                        IpcResponse::SessionKilled { session_id }
                    }
                    Err(e) => IpcResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            IpcRequest::Stop => {
                info!("Stop requested over control socket");
                self.stop_requested.cancel();
                IpcResponse::Stopping
            }
        }
    }
}

async fn run_control_socket(
    server: IpcServer,
    context: Arc<ControlContext>,
    shutdown: CancellationToken,
) {
    debug!(path = %server.path().display(), "Control socket listening");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        match accepted {
            Ok(conn) => {
                let context = Arc::clone(&context);
                let shutdown = shutdown.clone();
                tokio::spawn(serve_control_client(conn, context, shutdown));
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept control connection");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!("Control socket closed");
}

async fn serve_control_client(
    mut conn: IpcConnection,
    context: Arc<ControlContext>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = conn.read_request() => request,
        };
        let response = match request {
            Ok(Some(request)) => context.handle(request).await,
            Ok(None) => break,
            Err(e) => IpcResponse::Error {
                message: format!("invalid request: {}", e),
            },
        };
        if let Err(e) = conn.send_response(&response).await {
            debug!(error = %e, "Control client went away");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_token;
    use crate::config::TokenEntry;
    use crate::ipc::IpcClient;
    use crate::session::{BackendKind, CreateRequest};
    use crate::targets::ResolvedTarget;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        config.session.default_shell = "/bin/sh".to_string();
        config.session.backend = BackendKind::Pipe;
        config.auth.tokens = vec![TokenEntry {
            principal: "alice".to_string(),
            sha256: hash_token("secret"),
        }];
        config
    }

    async fn started(temp_dir: &TempDir) -> DaemonOrchestrator {
        let mut orchestrator = DaemonOrchestrator::new(test_config(temp_dir))
            .await
            .unwrap()
            .with_socket_path(temp_dir.path().join("daemon.sock"))
            .with_pid_file(Some(temp_dir.path().join("daemon.pid")));
        orchestrator.start().await.unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_new_is_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(test_config(&temp_dir))
            .await
            .unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = started(&temp_dir).await;
        let mut events = orchestrator.subscribe();

        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.local_addr().is_some());
        assert!(temp_dir.path().join("daemon.pid").exists());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!temp_dir.path().join("daemon.pid").exists());
        assert!(!temp_dir.path().join("daemon.sock").exists());

        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(OrchestratorState::Stopped) = event {
                saw_stopped = true;
            }
        }
        assert!(saw_stopped);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = started(&temp_dir).await;
        assert!(orchestrator.start().await.is_err());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_socket_status_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = started(&temp_dir).await;

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        match client.status().await.unwrap() {
            IpcResponse::Status {
                running,
                session_count,
                backend,
                bind_addr,
                ..
            } => {
                assert!(running);
                assert_eq!(session_count, 0);
                assert_eq!(backend, "pipe");
                assert_eq!(bind_addr, orchestrator.local_addr().unwrap().to_string());
            }
            other => panic!("unexpected response: {:?}", other),
        }

        assert_eq!(client.stop().await.unwrap(), IpcResponse::Stopping);
        tokio::time::timeout(Duration::from_secs(1), orchestrator.stop_requested())
            .await
            .unwrap();

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_control_socket_kill_unknown_session() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = started(&temp_dir).await;

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        let response = client.kill_session("nope".to_string()).await.unwrap();
        assert!(matches!(response, IpcResponse::Error { .. }));

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_audit_file_created() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = started(&temp_dir).await;
        assert!(temp_dir.path().join("audit.jsonl").exists());
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_session_end_to_audit_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = started(&temp_dir).await;

        for id in ["one", "two", "three"] {
            let mut request =
                CreateRequest::new(ResolvedTarget::local("local", "Local"), "alice");
            request.session_id = Some(id.to_string());
            let (_session, _rx) = orchestrator.registry().create_session(request).unwrap();
        }
        orchestrator.stop().await.unwrap();

        let contents = std::fs::read_to_string(temp_dir.path().join("audit.jsonl")).unwrap();
        let ends: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
            .filter(|event| event["action"] == "session_end")
            .collect();
        assert_eq!(ends.len(), 3);
        assert!(ends.iter().all(|event| event["reason"] == "shutdown"));
    }
}
