//! Signaling protocol: JSON events exchanged with the relay.
//!
//! Negotiation payloads (`signal.data`) are carried as [`serde_json::Value`]
//! so the relay forwards them without interpreting their contents. The
//! internally tagged envelope buffers its fields during deserialization,
//! which rules out zero-copy payload types here.

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;

/// One entry in a `deviceList` broadcast.
///
/// `connected` reports whether the device currently has an active pairing,
/// not whether its socket is alive (everything in the list is alive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub connected: bool,
}

/// Client-to-server signaling events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Register { device_id: DeviceId },

    GetDevices,

    #[serde(rename_all = "camelCase")]
    ConnectToDevice { target_id: DeviceId },

    /// Opaque negotiation payload for the paired device. The relay forwards
    /// `data` without inspecting it.
    Signal {
        to: DeviceId,
        data: serde_json::Value,
    },

    DisconnectPeer,
}

/// Server-to-client signaling events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    DeviceList { devices: Vec<DeviceSummary> },

    #[serde(rename_all = "camelCase")]
    PeerConnected { peer_id: DeviceId },

    PeerDisconnected,

    Signal {
        from: DeviceId,
        data: serde_json::Value,
    },

    Error { message: String },
}

impl ServerEvent {
    /// Named relay error for an unregistered pairing target.
    pub fn device_not_found() -> Self {
        Self::Error {
            message: "Device not found".into(),
        }
    }

    /// Named relay error for a self-directed pairing request.
    pub fn cannot_connect_to_self() -> Self {
        Self::Error {
            message: "Cannot connect to yourself".into(),
        }
    }
}
