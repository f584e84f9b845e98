//! WebSocket signaling relay.
//!
//! Devices register under short alphanumeric IDs, discover each other via
//! `deviceList` broadcasts, pair by ID, and exchange opaque negotiation
//! payloads. The relay never inspects payload contents; once a direct peer
//! channel is up the relay carries no transfer data at all.

mod connection;
mod registry;
mod server;

pub use registry::{ClientHandle, DeviceRegistry};
pub use server::{RelayConfig, RelayServer};

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
