//! Abstraction over a peer connection endpoint.
//!
//! The negotiator drives this trait instead of the WebRTC stack directly,
//! so the offer/answer state machine is testable with in-memory fakes.
//! [`crate::WebRtcFactory`] provides the real implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use beamdrop_transfer::{Payload, TransportChannel};

/// A boxed future returned by endpoint methods.
pub type EndpointFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, EndpointError>> + Send + 'a>>;

/// Which side of the negotiation this peer plays for the current pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Creates the data channel and sends the offer.
    Offerer,
    /// Waits for the offer and the remote's data channel.
    Answerer,
}

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP blob with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate, in the standard browser JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Signaling state of the endpoint, mirroring the WebRTC state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Errors surfaced by an endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointError {
    /// An operation ran in a signaling state that cannot accept it.
    #[error("signaling state mismatch: {0}")]
    StateMismatch(String),

    /// The endpoint rejected a description that conflicts with prior ones.
    #[error("invalid description modification: {0}")]
    InvalidModification(String),

    /// The remote description could not be applied.
    #[error("malformed description: {0}")]
    MalformedDescription(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("endpoint closed")]
    Closed,
}

impl EndpointError {
    /// Whether recovery requires a fresh endpoint rather than a retry on
    /// this one. Stale negotiation state is never patched in place.
    pub fn needs_recreate(&self) -> bool {
        matches!(
            self,
            Self::StateMismatch(_) | Self::InvalidModification(_) | Self::MalformedDescription(_)
        )
    }
}

/// Connection-level state changes, reduced to what the session cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from an endpoint.
pub enum EndpointEvent {
    /// A local ICE candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    /// The data channel opened; `incoming` yields its received frames.
    ChannelOpen {
        channel: Arc<dyn TransportChannel>,
        incoming: mpsc::Receiver<Payload>,
    },
    /// The connection changed state.
    StateChanged(LinkState),
}

impl std::fmt::Debug for EndpointEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ChannelOpen { .. } => write!(f, "ChannelOpen"),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// One peer connection attempt.
///
/// Endpoints are single-use: recovery from a broken negotiation discards
/// the endpoint and asks the factory for a new one.
pub trait PeerEndpoint: Send + Sync {
    fn signaling_state(&self) -> SignalingState;
    fn create_offer(&self) -> EndpointFuture<'_, SessionDescription>;
    fn create_answer(&self) -> EndpointFuture<'_, SessionDescription>;
    fn set_local_description(&self, desc: SessionDescription) -> EndpointFuture<'_, ()>;
    fn set_remote_description(&self, desc: SessionDescription) -> EndpointFuture<'_, ()>;
    fn add_ice_candidate(&self, candidate: IceCandidate) -> EndpointFuture<'_, ()>;
    fn close(&self) -> EndpointFuture<'_, ()>;
}

/// Creates endpoints for negotiation attempts.
pub trait EndpointFactory: Send + Sync {
    fn create(
        &self,
        role: PeerRole,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> EndpointFuture<'_, Arc<dyn PeerEndpoint>>;
}
