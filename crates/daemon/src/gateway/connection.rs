//! Per-connection handler.
//!
//! A connection starts as a [`PendingConnection`] with no session. The first
//! valid `init` frame turns it into a [`BoundConnection`], which owns the
//! session's event stream. Whatever ends a bound connection, the session is
//! destroyed on the way out.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{
    ClientMessage, Connected, ConnectedMetadata, FrameCodec, InitRequest, ProtocolError,
    ServerMessage, Utf8StreamDecoder, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{GatewayError, GatewayState, HandshakeError};
use crate::session::{
    CloseReason, CreateRequest, ProcessEvent, Session, SessionError, SessionMetadata,
};

/// Input frames held while the process stdin queue is full. Reading from the
/// client pauses at this depth.
const MAX_PENDING_INPUT: usize = 32;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Accept the WebSocket upgrade and serve the connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    tracing::debug!(peer = %peer, "WebSocket connection accepted");

    let pending = PendingConnection::new(ws, peer, state.codec);
    let Some(mut bound) = pending.handshake(&state, &shutdown).await? else {
        return Ok(());
    };

    let reason = bound.run(&shutdown).await;

    // Unconditional: a session never outlives its connection.
    if state.registry.destroy(bound.session.id(), reason).await.is_ok() {
        tracing::debug!(session_id = %bound.session.id(), reason = reason.as_str(), "Released session");
    }
    bound.frames.close().await;
    Ok(())
}

/// What the client side produced.
enum Inbound {
    Frame(ClientMessage),
    Binary(Vec<u8>),
    Invalid(ProtocolError),
    /// Clean close from the client.
    Closed,
    /// Socket error or EOF without a close frame.
    Lost(String),
}

/// Frame-level wrapper over the split socket.
struct FrameSocket {
    sink: WsSink,
    source: WsSource,
    codec: FrameCodec,
}

impl FrameSocket {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), GatewayError> {
        let text = self.codec.encode(message)?;
        self.sink.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn next_inbound(&mut self) -> Inbound {
        loop {
            match self.source.next().await {
                None => return Inbound::Lost("connection reset".to_string()),
                Some(Err(e)) => return Inbound::Lost(e.to_string()),
                Some(Ok(WsMessage::Text(text))) => {
                    return match self.codec.decode(&text) {
                        Ok(frame) => Inbound::Frame(frame),
                        Err(e) => Inbound::Invalid(e),
                    };
                }
                Some(Ok(WsMessage::Binary(data))) => return Inbound::Binary(data),
                Some(Ok(WsMessage::Close(_))) => return Inbound::Closed,
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// A connection that has not completed the handshake. Holds no session.
pub struct PendingConnection {
    frames: FrameSocket,
    peer: SocketAddr,
}

impl PendingConnection {
    fn new(ws: WebSocketStream<TcpStream>, peer: SocketAddr, codec: FrameCodec) -> Self {
        let (sink, source) = ws.split();
        Self {
            frames: FrameSocket {
                sink,
                source,
                codec,
            },
            peer,
        }
    }

    /// Wait for `init` and bind a session.
    ///
    /// Returns `Ok(None)` when the connection ended before a session was
    /// bound, including rejected handshakes.
    pub async fn handshake(
        mut self,
        state: &GatewayState,
        shutdown: &CancellationToken,
    ) -> Result<Option<BoundConnection>, GatewayError> {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = self.frames.send(&ServerMessage::close(Some(CloseReason::Shutdown.to_string()))).await;
                    self.frames.close().await;
                    return Ok(None);
                }
                inbound = self.frames.next_inbound() => inbound,
            };

            match inbound {
                Inbound::Frame(ClientMessage::Ping) => self.frames.send(&ServerMessage::Pong).await?,
                Inbound::Frame(ClientMessage::Init(request)) => {
                    return match self.bind(state, request) {
                        Ok((session, events)) => self.start(state, session, events).await,
                        Err(e) => {
                            tracing::warn!(peer = %self.peer, error = %e, "Handshake rejected");
                            self.frames
                                .send(&ServerMessage::error(e.client_message()))
                                .await?;
                            self.frames.send(&ServerMessage::close(None)).await?;
                            self.frames.close().await;
                            Ok(None)
                        }
                    };
                }
                Inbound::Frame(other) => {
                    tracing::debug!(peer = %self.peer, frame = other.kind(), "Ignoring frame before init");
                }
                Inbound::Binary(_) => {
                    tracing::debug!(peer = %self.peer, "Ignoring binary frame before init");
                }
                Inbound::Invalid(e) => {
                    self.frames
                        .send(&ServerMessage::error(format!("invalid frame: {}", e)))
                        .await?;
                }
                Inbound::Closed | Inbound::Lost(_) => return Ok(None),
            }
        }
    }

    /// Authenticate, resolve the target and create the session.
    fn bind(
        &self,
        state: &GatewayState,
        request: InitRequest,
    ) -> Result<(Arc<Session>, mpsc::Receiver<ProcessEvent>), HandshakeError> {
        let identity = state.verifier.verify(&request.auth_token)?;
        let mut target = state.resolver.resolve(&request.target_ref)?;
        let (cols, rows) = request.size_or(state.default_size);

        if let Some(params) = request.connection {
            if state.allow_client_params {
                target.connection = Some(params);
            } else {
                tracing::debug!(peer = %self.peer, "Ignoring client-supplied connection parameters");
            }
        }

        let create = CreateRequest {
            session_id: request.session_id,
            target,
            metadata: SessionMetadata {
                principal: identity.principal,
                origin: Some(self.peer.to_string()),
            },
            cols,
            rows,
        };

        Ok(state.registry.create_session(create)?)
    }

    /// Report the outcome of a freshly created session to the client.
    async fn start(
        mut self,
        state: &GatewayState,
        session: Arc<Session>,
        events: mpsc::Receiver<ProcessEvent>,
    ) -> Result<Option<BoundConnection>, GatewayError> {
        if let Some(error) = session.spawn_error() {
            tracing::warn!(session_id = %session.id(), error = %error, "Session process failed to start");
            let message = format!("could not start session: {}", error);
            let _ = self.frames.send(&ServerMessage::error(message)).await;
            let _ = self
                .frames
                .send(&ServerMessage::close(Some(CloseReason::SpawnFailed.to_string())))
                .await;
            let _ = state
                .registry
                .destroy(session.id(), CloseReason::SpawnFailed)
                .await;
            self.frames.close().await;
            return Ok(None);
        }

        let connected = ServerMessage::Connected(Connected {
            hostname: session.target().display_name.clone(),
            session_id: session.id().clone(),
            metadata: ConnectedMetadata {
                target_ref: session.target().target_ref.clone(),
                remote: session.is_remote(),
                backend: session.backend_name().to_string(),
                protocol_version: PROTOCOL_VERSION,
            },
        });
        if let Err(e) = self.frames.send(&connected).await {
            let _ = state
                .registry
                .destroy(session.id(), CloseReason::ConnectionLost)
                .await;
            return Err(e);
        }
        session.mark_connected();

        tracing::info!(
            session_id = %session.id(),
            peer = %self.peer,
            principal = %session.metadata().principal,
            target = %session.target().target_ref,
            "Client connected"
        );

        Ok(Some(BoundConnection {
            frames: self.frames,
            peer: self.peer,
            session,
            events,
            decoder: Utf8StreamDecoder::new(),
            pending_input: VecDeque::new(),
        }))
    }
}

enum Step {
    Shutdown,
    Destroyed,
    Process(Option<ProcessEvent>),
    Client(Inbound),
    Written(Result<(), SessionError>),
}

/// A connection bound to a live session.
pub struct BoundConnection {
    frames: FrameSocket,
    peer: SocketAddr,
    session: Arc<Session>,
    events: mpsc::Receiver<ProcessEvent>,
    decoder: Utf8StreamDecoder,
    /// Client input not yet accepted by the session, oldest first.
    pending_input: VecDeque<Vec<u8>>,
}

impl BoundConnection {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Relay frames until the connection or the session ends. Returns the
    /// reason the session should be closed with.
    ///
    /// Input is handed to the session from inside the select, so a process
    /// that stops reading never hides a closed socket or a shutdown.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> CloseReason {
        loop {
            let has_input = !self.pending_input.is_empty();
            let can_read = self.pending_input.len() < MAX_PENDING_INPUT;
            let next_input = self.pending_input.front().map(Vec::as_slice).unwrap_or_default();

            let step = tokio::select! {
                _ = shutdown.cancelled() => Step::Shutdown,
                _ = self.session.cancelled() => Step::Destroyed,
                event = self.events.recv() => Step::Process(event),
                written = self.session.write(next_input), if has_input => Step::Written(written),
                inbound = self.frames.next_inbound(), if can_read => Step::Client(inbound),
            };

            let outcome = match step {
                Step::Shutdown => {
                    self.send_close(CloseReason::Shutdown).await;
                    Err(CloseReason::Shutdown)
                }
                Step::Destroyed => Err(self.finish_destroyed().await),
                Step::Process(Some(event)) => self.on_process_event(event).await,
                Step::Process(None) => Err(self.finish_destroyed().await),
                Step::Client(inbound) => self.on_client(inbound).await,
                Step::Written(result) => {
                    self.pending_input.pop_front();
                    self.report(result).await
                }
            };

            if let Err(reason) = outcome {
                tracing::debug!(
                    session_id = %self.session.id(),
                    peer = %self.peer,
                    reason = reason.as_str(),
                    "Connection loop ended"
                );
                return reason;
            }
        }
    }

    async fn on_process_event(&mut self, event: ProcessEvent) -> Result<(), CloseReason> {
        match event {
            ProcessEvent::Output(chunk) => {
                let text = self.decoder.decode(&chunk);
                self.send_output(text).await
            }
            ProcessEvent::Exited(info) => {
                let tail = self.decoder.finish();
                self.send_output(tail).await?;
                let reason = CloseReason::from_exit(&info);
                if let Some(error) = info.error {
                    let _ = self
                        .frames
                        .send(&ServerMessage::error(format!("could not start session: {}", error)))
                        .await;
                }
                self.send_close(reason).await;
                Err(reason)
            }
        }
    }

    async fn on_client(&mut self, inbound: Inbound) -> Result<(), CloseReason> {
        let result = match inbound {
            Inbound::Frame(ClientMessage::Input(input)) => {
                self.queue_input(input.data.into_bytes());
                Ok(())
            }
            Inbound::Binary(data) => {
                self.queue_input(data);
                Ok(())
            }
            Inbound::Frame(ClientMessage::Resize(size)) => {
                self.session.resize(size.cols, size.rows).await
            }
            Inbound::Frame(ClientMessage::Ping) => {
                return self.send(&ServerMessage::Pong).await;
            }
            Inbound::Frame(ClientMessage::Init(_)) => {
                let message = HandshakeError::AlreadyInitialized.client_message();
                return self.send(&ServerMessage::error(message)).await;
            }
            Inbound::Frame(ClientMessage::Close) => {
                self.send_close(CloseReason::ClientClosed).await;
                return Err(CloseReason::ClientClosed);
            }
            Inbound::Invalid(e) => {
                return self
                    .send(&ServerMessage::error(format!("invalid frame: {}", e)))
                    .await;
            }
            Inbound::Closed => return Err(CloseReason::ClientClosed),
            Inbound::Lost(error) => {
                tracing::debug!(session_id = %self.session.id(), error = %error, "Connection lost");
                return Err(CloseReason::ConnectionLost);
            }
        };

        self.report(result).await
    }

    fn queue_input(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.pending_input.push_back(data);
        }
    }

    /// Tell the client about a failed session operation.
    async fn report(&mut self, result: Result<(), SessionError>) -> Result<(), CloseReason> {
        // A destroyed session is reported by the close frame instead.
        if let Err(SessionError::Inactive(_)) = result {
            return Ok(());
        }
        if let Err(e) = result {
            tracing::debug!(session_id = %self.session.id(), error = %e, "Session operation failed");
            self.send(&ServerMessage::error(format!("session error: {}", e)))
                .await?;
        }
        Ok(())
    }

    /// The session was destroyed elsewhere (exit, sweep, admin, shutdown).
    /// Flush what the process already produced, then tell the client why.
    async fn finish_destroyed(&mut self) -> CloseReason {
        let mut exit_error = None;
        while let Ok(event) = self.events.try_recv() {
            match event {
                ProcessEvent::Output(chunk) => {
                    let text = self.decoder.decode(&chunk);
                    if self.send_output(text).await.is_err() {
                        break;
                    }
                }
                ProcessEvent::Exited(info) => exit_error = info.error,
            }
        }
        let tail = self.decoder.finish();
        let _ = self.send_output(tail).await;

        if let Some(error) = exit_error {
            let _ = self
                .frames
                .send(&ServerMessage::error(format!("could not start session: {}", error)))
                .await;
        }

        let reason = self
            .session
            .close_reason()
            .unwrap_or(CloseReason::ConnectionLost);
        self.send_close(reason).await;
        reason
    }

    async fn send_output(&mut self, text: String) -> Result<(), CloseReason> {
        if text.is_empty() {
            return Ok(());
        }
        self.session.record_activity();
        self.send(&ServerMessage::output(text)).await
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), CloseReason> {
        self.frames.send(message).await.map_err(|e| {
            tracing::debug!(session_id = %self.session.id(), error = %e, "Send failed");
            CloseReason::ConnectionLost
        })
    }

    async fn send_close(&mut self, reason: CloseReason) {
        let _ = self
            .frames
            .send(&ServerMessage::close(Some(reason.to_string())))
            .await;
    }
}
