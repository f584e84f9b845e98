//! Chunked file transfer over an ordered, message-based peer channel.
//!
//! The engine is transport-agnostic: anything implementing
//! [`TransportChannel`] (a reliable, ordered duplex pipe with a queryable
//! outstanding-buffer size) can carry a transfer. The wire protocol is
//! metadata → chunks → end-marker per file, with a batch header up front;
//! see `beamdrop_protocol::transfer` for the shapes.

mod channel;
mod progress;
mod receiver;
mod sender;

pub use channel::{ChannelError, ChannelFuture, FlowConfig, Payload, TransportChannel};
pub use progress::SpeedCalculator;
pub use receiver::{CompletedFile, ReceiveConfig, TransferEvent, TransferReceiver};
pub use sender::{OutgoingFile, TransferSender};

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("channel not ready")]
    ChannelNotReady,

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("transfer closed")]
    Closed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
