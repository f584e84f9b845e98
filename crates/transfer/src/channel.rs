//! Transport seam for the transfer engine.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;

use beamdrop_protocol::constants::{
    BUFFER_HIGH_WATER, BUFFER_LOW_WATER, BUFFER_POLL_INTERVAL, BUFFER_WAIT_TIMEOUT, CHUNK_SIZE,
    MAX_BUFFERED_AMOUNT,
};

/// A boxed future returned by channel methods.
pub type ChannelFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ChannelError>> + Send + 'a>>;

/// Errors from the underlying channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not open")]
    NotOpen,

    #[error("send failed: {0}")]
    Send(String),
}

/// One application message on the channel.
///
/// Control messages are text frames, chunks are binary frames. The transport
/// must preserve the frame boundary and the relative order of both kinds.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Payload size in bytes, as counted against the outstanding buffer.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A reliable, ordered, message-based duplex pipe with a bounded, queryable
/// amount of unsent data.
///
/// Implemented for the WebRTC data channel in `beamdrop-peer`; tests drive
/// the engine with in-memory fakes.
pub trait TransportChannel: Send + Sync + 'static {
    /// Queues one message for transmission.
    fn send(&self, payload: Payload) -> ChannelFuture<'_, ()>;

    /// Bytes queued for transmission but not yet handed to the network.
    fn buffered_amount(&self) -> ChannelFuture<'_, usize>;

    /// Whether the channel is currently open for sending.
    fn is_open(&self) -> bool;
}

/// Flow-control tuning for the send side.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Maximum chunk size; the last chunk of a file may be shorter.
    pub chunk_size: usize,
    /// Maximum tolerated outstanding-buffer size.
    pub max_buffered: usize,
    /// Pause sending when the outstanding buffer exceeds this.
    pub high_water: usize,
    /// Resume sending once the outstanding buffer drops below this.
    pub low_water: usize,
    /// Poll interval while paused.
    pub poll_interval: Duration,
    /// Proceed (with a warning) if the buffer has not drained by then.
    pub wait_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_buffered: MAX_BUFFERED_AMOUNT,
            high_water: BUFFER_HIGH_WATER,
            low_water: BUFFER_LOW_WATER,
            poll_interval: BUFFER_POLL_INTERVAL,
            wait_timeout: BUFFER_WAIT_TIMEOUT,
        }
    }
}
