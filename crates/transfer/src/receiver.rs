//! Receive side of the chunked transfer protocol.
//!
//! Reassembles files from interleaved text control frames and binary chunks.
//! The end marker can outrun the last chunks on some transports, so an EOF
//! with bytes still missing arms a grace timer instead of failing outright:
//! the file finalizes as soon as the declared size is met, or after the
//! extended wait if at least the force-finalize ratio of it arrived.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use beamdrop_protocol::constants::{EOF_EXTENDED_WAIT, EOF_GRACE_PERIOD, FORCE_FINALIZE_RATIO};
use beamdrop_protocol::transfer::ControlMessage;

use crate::channel::Payload;
use crate::progress::SpeedCalculator;
use crate::TransferError;

/// Tuning for late-chunk tolerance on the receive side.
#[derive(Debug, Clone)]
pub struct ReceiveConfig {
    /// Wait this long after a premature EOF before re-checking.
    pub grace_period: Duration,
    /// Additional wait before the forced-finalize decision.
    pub extended_wait: Duration,
    /// Minimum fraction of the declared size required to force-finalize.
    pub force_finalize_ratio: f64,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            grace_period: EOF_GRACE_PERIOD,
            extended_wait: EOF_EXTENDED_WAIT,
            force_finalize_ratio: FORCE_FINALIZE_RATIO,
        }
    }
}

/// A fully reassembled file.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub name: String,
    pub declared_size: u64,
    pub data: Bytes,
    pub elapsed: Duration,
}

impl CompletedFile {
    /// Whether every declared byte arrived (false after a forced finalize).
    pub fn is_complete(&self) -> bool {
        self.data.len() as u64 == self.declared_size
    }
}

/// Receive-side notifications, in arrival order.
#[derive(Debug)]
pub enum TransferEvent {
    BatchStarted {
        total: u32,
    },
    FileStarted {
        name: String,
        size: u64,
        index: u32,
        total: u32,
    },
    Progress {
        name: String,
        received: u64,
        total: u64,
        bytes_per_second: f64,
        eta: Option<Duration>,
    },
    FileComplete(CompletedFile),
    Failed {
        name: String,
        received: u64,
        expected: u64,
    },
}

struct ActiveFile {
    name: String,
    declared_size: u64,
    received: u64,
    chunks: Vec<Bytes>,
    eof_seen: bool,
    started_at: Instant,
    speed: SpeedCalculator,
}

struct ReceiverState {
    total_files: u32,
    file_index: u32,
    active: Option<ActiveFile>,
    grace: Option<JoinHandle<()>>,
}

struct Inner {
    config: ReceiveConfig,
    state: Mutex<ReceiverState>,
    events: mpsc::UnboundedSender<TransferEvent>,
    closed: AtomicBool,
}

/// Receiver half of the transfer engine for one channel.
///
/// Feed every incoming frame through [`feed`](Self::feed); reassembled files
/// and progress come out on the event receiver returned by
/// [`new`](Self::new).
pub struct TransferReceiver {
    inner: Arc<Inner>,
}

impl TransferReceiver {
    pub fn new(config: ReceiveConfig) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let receiver = Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ReceiverState {
                    total_files: 0,
                    file_index: 0,
                    active: None,
                    grace: None,
                }),
                events,
                closed: AtomicBool::new(false),
            }),
        };
        (receiver, rx)
    }

    /// Processes one frame from the channel.
    pub fn feed(&self, payload: Payload) -> Result<(), TransferError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransferError::Closed);
        }
        match payload {
            Payload::Text(text) => {
                let msg = ControlMessage::from_json(&text)?;
                self.handle_control(msg);
                Ok(())
            }
            Payload::Binary(chunk) => {
                self.handle_chunk(chunk);
                Ok(())
            }
        }
    }

    fn handle_control(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::Batch(header) => {
                let mut state = self.inner.state.lock().unwrap();
                state.total_files = header.total;
                state.file_index = 0;
                drop(state);
                self.inner.emit(TransferEvent::BatchStarted {
                    total: header.total,
                });
            }
            ControlMessage::FileMeta(meta) => {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(stale) = state.active.take() {
                    warn!(name = %stale.name, "new file metadata with a file still open");
                    self.inner.emit(TransferEvent::Failed {
                        name: stale.name,
                        received: stale.received,
                        expected: stale.declared_size,
                    });
                }
                Inner::cancel_grace(&mut state);
                // The index advances per announced file, so a failed file
                // still consumes its slot in the batch.
                let index = state.file_index;
                state.file_index += 1;
                let total = state.total_files;
                state.active = Some(ActiveFile {
                    name: meta.name.clone(),
                    declared_size: meta.size,
                    received: 0,
                    chunks: Vec::new(),
                    eof_seen: false,
                    started_at: Instant::now(),
                    speed: SpeedCalculator::new(),
                });
                drop(state);
                debug!(name = %meta.name, size = meta.size, "file started");
                self.inner.emit(TransferEvent::FileStarted {
                    name: meta.name,
                    size: meta.size,
                    index,
                    total,
                });
            }
            ControlMessage::Eof(_) => self.handle_eof(),
        }
    }

    fn handle_chunk(&self, chunk: Bytes) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(active) = state.active.as_mut() else {
            warn!(len = chunk.len(), "chunk with no file open, dropping");
            return;
        };

        active.received += chunk.len() as u64;
        active.speed.add_sample(chunk.len() as u64);
        active.chunks.push(chunk);

        let done = active.eof_seen && active.received >= active.declared_size;
        let remaining = active.declared_size.saturating_sub(active.received);
        self.inner.emit(TransferEvent::Progress {
            name: active.name.clone(),
            received: active.received,
            total: active.declared_size,
            bytes_per_second: active.speed.bytes_per_second(),
            eta: active.speed.eta(remaining),
        });
        if done {
            // The end marker arrived ahead of this chunk.
            Inner::finalize_locked(&self.inner, &mut state);
        }
    }

    fn handle_eof(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(active) = state.active.as_mut() else {
            // Duplicate end marker after finalization.
            return;
        };
        if active.eof_seen {
            return;
        }
        active.eof_seen = true;

        if active.received >= active.declared_size {
            Inner::finalize_locked(&self.inner, &mut state);
            return;
        }

        debug!(
            received = active.received,
            declared = active.declared_size,
            "end marker before all chunks, arming grace timer"
        );
        let inner = Arc::clone(&self.inner);
        let grace_period = self.inner.config.grace_period;
        let extended_wait = self.inner.config.extended_wait;
        state.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if inner.try_finalize(1.0) {
                return;
            }
            tokio::time::sleep(extended_wait).await;
            if !inner.try_finalize(inner.config.force_finalize_ratio) {
                inner.fail_active();
            }
        }));
    }

    /// Drops any partial file and stops pending timers. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        Inner::cancel_grace(&mut state);
        state.active = None;
    }
}

impl Drop for TransferReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    fn cancel_grace(state: &mut ReceiverState) {
        if let Some(handle) = state.grace.take() {
            handle.abort();
        }
    }

    /// Finalizes the active file if EOF was seen and at least `ratio` of the
    /// declared size arrived. Returns whether a file was finalized.
    fn try_finalize(self: &Arc<Self>, ratio: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        let ready = state.active.as_ref().is_some_and(|a| {
            a.eof_seen && a.received as f64 >= a.declared_size as f64 * ratio
        });
        if ready {
            Self::finalize_locked(self, &mut state);
        }
        ready
    }

    /// Emits `Failed` for the active file and discards it.
    fn fail_active(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        let Some(active) = state.active.take() else {
            return;
        };
        Self::cancel_grace(&mut state);
        drop(state);
        warn!(
            name = %active.name,
            received = active.received,
            expected = active.declared_size,
            "file incomplete after extended wait"
        );
        self.emit(TransferEvent::Failed {
            name: active.name,
            received: active.received,
            expected: active.declared_size,
        });
    }

    /// Takes the active file and emits `FileComplete`. Taking the option
    /// makes finalization idempotent under racing triggers.
    fn finalize_locked(self: &Arc<Self>, state: &mut ReceiverState) {
        let Some(active) = state.active.take() else {
            return;
        };
        Self::cancel_grace(state);

        let mut data = BytesMut::with_capacity(active.received as usize);
        for chunk in &active.chunks {
            data.extend_from_slice(chunk);
        }
        let completed = CompletedFile {
            name: active.name,
            declared_size: active.declared_size,
            data: data.freeze(),
            elapsed: active.started_at.elapsed(),
        };
        if !completed.is_complete() {
            warn!(
                name = %completed.name,
                received = completed.data.len(),
                declared = completed.declared_size,
                "finalizing with missing bytes"
            );
        }
        debug!(name = %completed.name, bytes = completed.data.len(), "file complete");
        self.emit(TransferEvent::FileComplete(completed));
    }
}
