//! Send side of the chunked transfer protocol.
//!
//! All outbound messages pass through a single-consumer FIFO queue drained by
//! at most one in-flight loop, so application message order equals enqueue
//! order even when multiple producers enqueue concurrently. Binary chunks are
//! gated on the channel's outstanding-buffer size against the configured
//! high/low-water marks.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use beamdrop_protocol::transfer::ControlMessage;

use crate::channel::{FlowConfig, Payload, TransportChannel};
use crate::TransferError;

/// One file queued for sending, fully buffered in memory.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Reads a file from disk, naming it after its final path component.
    pub async fn from_path(path: &Path) -> Result<Self, std::io::Error> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        Ok(Self::new(name, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

struct Queued {
    payload: Payload,
    done: oneshot::Sender<Result<(), TransferError>>,
}

struct Inner {
    channel: Arc<dyn TransportChannel>,
    config: FlowConfig,
    queue: Mutex<VecDeque<Queued>>,
    /// Set while a drain loop is running. Exactly one loop may run at a time.
    draining: AtomicBool,
    /// High-water pauses observed so far (diagnostics).
    pause_cycles: AtomicU64,
    cancel: CancellationToken,
}

/// Sender half of the transfer engine for one channel.
pub struct TransferSender {
    inner: Arc<Inner>,
}

impl TransferSender {
    pub fn new(channel: Arc<dyn TransportChannel>, config: FlowConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                pause_cycles: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Sends one application message through the FIFO queue and waits for it
    /// to be handed to the channel.
    pub async fn send_data(&self, payload: Payload) -> Result<(), TransferError> {
        if self.inner.cancel.is_cancelled() {
            return Err(TransferError::Closed);
        }
        let rx = self.inner.enqueue(payload);
        rx.await.map_err(|_| TransferError::Closed)?
    }

    async fn send_control(&self, msg: &ControlMessage) -> Result<(), TransferError> {
        self.send_data(Payload::Text(msg.to_json()?)).await
    }

    /// Transmits a batch of files strictly sequentially: batch header, then
    /// per file its metadata, chunks of `min(chunk_size, remaining)`, and the
    /// end marker, flushing the outstanding buffer before the next file.
    pub async fn send_files(&self, files: Vec<OutgoingFile>) -> Result<(), TransferError> {
        if !self.inner.channel.is_open() {
            return Err(TransferError::ChannelNotReady);
        }

        self.send_control(&ControlMessage::batch(files.len() as u32))
            .await?;

        for file in files {
            debug!(name = %file.name, size = file.size(), "sending file");
            self.send_control(&ControlMessage::file_meta(&file.name, file.size()))
                .await?;

            let len = file.data.len();
            let mut offset = 0;
            while offset < len {
                let end = usize::min(offset + self.inner.config.chunk_size, len);
                self.send_data(Payload::Binary(file.data.slice(offset..end)))
                    .await?;
                offset = end;
            }

            self.send_control(&ControlMessage::eof()).await?;
            self.flush().await;
        }

        Ok(())
    }

    /// Waits until the queue is empty and the channel's outstanding buffer
    /// has drained, or the wait timeout elapses.
    pub async fn flush(&self) {
        let start = tokio::time::Instant::now();
        loop {
            if self.inner.cancel.is_cancelled() {
                return;
            }

            let idle = self.inner.queue.lock().unwrap().is_empty()
                && !self.inner.draining.load(Ordering::Acquire);
            if idle {
                match self.inner.channel.buffered_amount().await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }

            if start.elapsed() >= self.inner.config.wait_timeout {
                warn!("flush timeout, continuing");
                return;
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// High-water pauses observed so far (diagnostics).
    pub fn pause_cycles(&self) -> u64 {
        self.inner.pause_cycles.load(Ordering::Relaxed)
    }

    /// Stops the drain loop and rejects every queued message. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut queue = self.inner.queue.lock().unwrap();
        while let Some(item) = queue.pop_front() {
            let _ = item.done.send(Err(TransferError::Closed));
        }
    }
}

impl Drop for TransferSender {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn enqueue(self: &Arc<Self>, payload: Payload) -> oneshot::Receiver<Result<(), TransferError>> {
        let (done, rx) = oneshot::channel();
        self.queue.lock().unwrap().push_back(Queued { payload, done });
        self.ensure_drain();
        rx
    }

    /// Starts the drain loop unless one is already running.
    fn ensure_drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(inner.drain_loop());
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().unwrap().pop_front();
            let Some(item) = next else {
                self.draining.store(false, Ordering::Release);
                // A producer may have enqueued between the pop and the flag
                // clearing, and seen the flag still set. Reclaim the loop
                // if so; otherwise some other loop owns it now.
                if self.queue.lock().unwrap().is_empty() {
                    return;
                }
                if self.draining.swap(true, Ordering::AcqRel) {
                    return;
                }
                continue;
            };

            if self.cancel.is_cancelled() {
                let _ = item.done.send(Err(TransferError::Closed));
                continue;
            }

            if matches!(item.payload, Payload::Binary(_)) {
                self.wait_for_buffer().await;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(TransferError::Closed),
                r = self.channel.send(item.payload) => r.map_err(TransferError::from),
            };
            if let Err(ref e) = result {
                warn!("send failed: {e}");
            }
            let _ = item.done.send(result);
        }
    }

    /// Blocks while the outstanding buffer is above the high-water mark,
    /// resuming at the low-water mark or after the wait timeout.
    async fn wait_for_buffer(&self) {
        let buffered = match self.channel.buffered_amount().await {
            Ok(n) => n,
            Err(_) => return,
        };
        if buffered <= self.config.high_water {
            return;
        }

        self.pause_cycles.fetch_add(1, Ordering::Relaxed);
        debug!(buffered, high_water = self.config.high_water, "pausing send");

        let start = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            let buffered = match self.channel.buffered_amount().await {
                Ok(n) => n,
                Err(_) => return,
            };
            if buffered <= self.config.low_water {
                debug!(buffered, "resuming send");
                return;
            }
            if start.elapsed() >= self.config.wait_timeout {
                warn!(buffered, "buffer wait timeout, proceeding anyway");
                return;
            }
        }
    }
}
