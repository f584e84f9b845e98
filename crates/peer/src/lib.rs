//! Peer session: everything one device needs to reach another.
//!
//! A peer connects to the signaling relay ([`RelayClient`]), pairs with a
//! remote device by ID, negotiates a direct WebRTC channel
//! ([`Negotiator`] over a [`PeerEndpoint`]), and hands the opened channel
//! to the transfer engine. [`SessionCoordinator`] wires all of it together.

mod coordinator;
mod endpoint;
mod negotiator;
mod relay_client;
mod types;
mod webrtc_endpoint;

pub use coordinator::{generate_device_id, initiates_offer, SessionCoordinator};
pub use endpoint::{
    EndpointError, EndpointEvent, EndpointFactory, EndpointFuture, IceCandidate, LinkState,
    PeerEndpoint, PeerRole, SdpKind, SessionDescription, SignalingState,
};
pub use negotiator::Negotiator;
pub use relay_client::RelayClient;
pub use types::{ReconnectConfig, SessionConfig, SessionEvent, SignalPayload};
pub use webrtc_endpoint::{IceConfig, WebRtcChannel, WebRtcFactory};

/// Errors from the peer session.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("signal payload too large ({0} bytes)")]
    PayloadTooLarge(usize),

    #[error("endpoint error: {0}")]
    Endpoint(#[from] endpoint::EndpointError),

    #[error("negotiation already in progress")]
    NegotiationBusy,
}
