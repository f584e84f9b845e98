//! Wire protocol types shared by the relay server and peer clients.
//!
//! Two independent protocols live here:
//!
//! - the **signaling protocol** ([`signal`]): JSON events exchanged with the
//!   relay over WebSocket, used to register device identifiers, pair devices,
//!   and forward opaque negotiation payloads;
//! - the **transfer protocol** ([`transfer`]): JSON control messages
//!   interleaved with raw binary chunks on the direct peer-to-peer channel.
//!   The relay never sees these.

pub mod constants;
mod device;
pub mod signal;
pub mod transfer;

pub use device::{DeviceId, DeviceIdError};
pub use signal::{ClientEvent, DeviceSummary, ServerEvent};
pub use transfer::{BatchHeader, ControlMessage, FileMeta};
