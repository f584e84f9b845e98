//! Protocol constants and tunables.

use std::time::Duration;

/// Minimum device identifier length.
pub const DEVICE_ID_MIN_LEN: usize = 3;

/// Maximum device identifier length.
pub const DEVICE_ID_MAX_LEN: usize = 20;

/// Length of generated device identifiers.
pub const DEVICE_ID_GENERATED_LEN: usize = 6;

/// Maximum signaling payload size, enforced client-side before `signal`.
///
/// A gathered SDP with a handful of candidates stays well under this;
/// anything larger indicates a bug on the sending side, not a bigger offer.
pub const MAX_SIGNAL_PAYLOAD: usize = 10 * 1024;

/// Maximum WebSocket message size accepted by the relay.
pub const RELAY_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Transfer chunk size: 64 KiB.
///
/// Small enough that a single chunk never trips the transport's per-message
/// limit, large enough that per-chunk overhead is negligible.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Maximum outstanding-buffer size tolerated on the data channel.
pub const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;

/// Pause sending above this outstanding-buffer level (3/4 of max).
pub const BUFFER_HIGH_WATER: usize = MAX_BUFFERED_AMOUNT / 4 * 3;

/// Resume sending below this outstanding-buffer level (1/4 of max).
pub const BUFFER_LOW_WATER: usize = MAX_BUFFERED_AMOUNT / 4;

/// Poll interval while waiting for the outstanding buffer to drain.
pub const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Give up waiting for the buffer to drain after this long and proceed
/// with a warning. Progress is preferred over strict backpressure.
pub const BUFFER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period after an EOF that arrives before all declared bytes.
pub const EOF_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Extended wait after the grace period before forced finalization is
/// considered.
pub const EOF_EXTENDED_WAIT: Duration = Duration::from_secs(8);

/// Fraction of the declared size at which a transfer may be force-finalized
/// after the extended wait. Deliberate loss tolerance, not a guarantee.
pub const FORCE_FINALIZE_RATIO: f64 = 0.999;

/// How long the designated answerer waits for an incoming offer before
/// creating one itself (deadlock breaker for lost signaling messages).
pub const OFFER_FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `handle_offer` waits for a concurrent `create_offer` to finish
/// before rejecting with a collision error.
pub const NEGOTIATION_COLLISION_WAIT: Duration = Duration::from_millis(500);

/// Delay between tearing down a peer endpoint and recreating it, letting the
/// old object finish releasing native resources.
pub const RECREATE_GRACE: Duration = Duration::from_millis(300);

/// Relay registry sweep interval for evicting dead handles.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket keepalive ping period.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// A connection with no traffic for this long is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);
