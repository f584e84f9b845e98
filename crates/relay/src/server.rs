//! Relay WebSocket server.
//!
//! Listens on a TCP port, upgrades connections to WebSocket, and serves any
//! number of clients against one shared [`DeviceRegistry`]. A background
//! sweep evicts devices whose sockets died without a close frame.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use beamdrop_protocol::constants::{RELAY_MAX_MESSAGE_SIZE, SWEEP_INTERVAL};

use crate::connection::serve_connection;
use crate::registry::DeviceRegistry;
use crate::RelayError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

/// The signaling relay server.
pub struct RelayServer {
    port: u16,
    registry: Arc<DeviceRegistry>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            port: config.port,
            registry: Arc::new(DeviceRegistry::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// The shared registry, for inspection.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), RelayError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay listening on {local_addr}");

        let sweeper = {
            let registry = Arc::clone(&self.registry);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                interval.tick().await; // Skip immediate first tick.
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => registry.sweep().await,
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("relay shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        let _ = sweeper.await;
        Ok(())
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(RELAY_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(RELAY_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        tracing::debug!(%peer_addr, "WebSocket connection established");

        serve_connection(ws_stream, Arc::clone(&self.registry), self.cancel.clone()).await;
        tracing::debug!(%peer_addr, "connection closed");
        Ok(())
    }
}
