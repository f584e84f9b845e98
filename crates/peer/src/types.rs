//! Public types for the peer session.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use beamdrop_protocol::signal::DeviceSummary;
use beamdrop_protocol::DeviceId;
use beamdrop_transfer::{Payload, TransportChannel};

use crate::endpoint::{IceCandidate, SessionDescription};

/// Negotiation payload carried opaquely through the relay.
///
/// The relay never sees these shapes; they live inside `signal.data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    pub fn offer(desc: &SessionDescription) -> Self {
        Self::Offer {
            sdp: desc.sdp.clone(),
        }
    }

    pub fn answer(desc: &SessionDescription) -> Self {
        Self::Answer {
            sdp: desc.sdp.clone(),
        }
    }
}

/// Events emitted by the session coordinator.
pub enum SessionEvent {
    /// Registered with the relay under this ID.
    Registered { device_id: DeviceId },
    /// Relay broadcast an updated device list.
    DeviceList { devices: Vec<DeviceSummary> },
    /// Paired with a remote device; negotiation begins.
    Paired { peer_id: DeviceId },
    /// The paired device left or was replaced.
    PeerLeft,
    /// The direct channel is open and ready for transfers.
    ChannelReady {
        channel: Arc<dyn TransportChannel>,
        incoming: mpsc::Receiver<Payload>,
    },
    /// The direct connection failed and could not be recovered.
    ConnectionFailed { reason: String },
    /// The relay reported an error (e.g. "Device not found").
    RelayError { message: String },
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered { device_id } => {
                f.debug_struct("Registered").field("device_id", device_id).finish()
            }
            Self::DeviceList { devices } => {
                f.debug_struct("DeviceList").field("devices", devices).finish()
            }
            Self::Paired { peer_id } => {
                f.debug_struct("Paired").field("peer_id", peer_id).finish()
            }
            Self::PeerLeft => write!(f, "PeerLeft"),
            Self::ChannelReady { .. } => write!(f, "ChannelReady"),
            Self::ConnectionFailed { reason } => {
                f.debug_struct("ConnectionFailed").field("reason", reason).finish()
            }
            Self::RelayError { message } => {
                f.debug_struct("RelayError").field("message", message).finish()
            }
        }
    }
}

/// Configuration for automatic relay reconnection with exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt number `attempt` (1-based).
    ///
    /// Exponential up to `max_delay`, with ±25% random jitter so peers
    /// that lost the same relay do not reconnect in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = capped * rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(jittered.max(0.05))
    }
}

/// Session coordinator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Device ID to register under (generated if `None`).
    pub device_id: Option<DeviceId>,
    pub reconnect: ReconnectConfig,
}
