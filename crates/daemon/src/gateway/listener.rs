//! TCP accept loop for the gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{handle_connection, GatewayError, GatewayState};

/// How long `run` waits for open connections to wind down after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Listens for WebSocket clients and spawns a handler per connection.
pub struct GatewayServer {
    listener: TcpListener,
    state: Arc<GatewayState>,
    tracker: TaskTracker,
}

impl GatewayServer {
    /// Bind to `addr`. Port 0 picks a free port; see [`Self::local_addr`].
    pub async fn bind(addr: SocketAddr, state: Arc<GatewayState>) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Gateway listening");
        Ok(Self {
            listener,
            state,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Accept connections until `shutdown` fires, then wait for the
    /// handlers to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let state = Arc::clone(&self.state);
                    let shutdown = shutdown.clone();
                    self.tracker.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, state, shutdown).await {
                            tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    // Back off briefly on persistent errors such as EMFILE.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        self.tracker.close();
        let open = self.tracker.len();
        if open > 0 {
            tracing::info!(connections = open, "Waiting for connections to close");
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Timed out waiting for connections to close");
        }
        tracing::info!("Gateway stopped");
    }
}
