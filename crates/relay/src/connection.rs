//! Per-socket lifecycle: write pump, keepalive pings, read loop with a
//! pong deadline, and dispatch of client events into the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use beamdrop_protocol::constants::{MAX_SIGNAL_PAYLOAD, WS_PING_PERIOD, WS_PONG_WAIT};
use beamdrop_protocol::signal::{ClientEvent, ServerEvent};
use beamdrop_protocol::DeviceId;

use crate::registry::{ClientHandle, DeviceRegistry};

/// Outbound buffer per client. Registrations can fan out a device-list
/// broadcast per connected client, so leave headroom above one.
const SEND_BUFFER_SIZE: usize = 64;

/// WebSocket-backed [`ClientHandle`].
struct WsHandle {
    tx: mpsc::Sender<tungstenite::Message>,
    alive: Arc<AtomicBool>,
}

impl ClientHandle for WsHandle {
    fn send(&self, event: &ServerEvent) {
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                error!("failed to serialize server event: {e}");
                return;
            }
        };
        if self
            .tx
            .try_send(tungstenite::Message::Text(text.into()))
            .is_err()
        {
            warn!("client send buffer full or closed, dropping event");
        }
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

/// Runs one client connection to completion.
pub(crate) async fn serve_connection(
    stream: WebSocketStream<TcpStream>,
    registry: Arc<DeviceRegistry>,
    cancel: CancellationToken,
) {
    let (write, mut read) = stream.split();
    let (write_tx, write_rx) = mpsc::channel(SEND_BUFFER_SIZE);
    let alive = Arc::new(AtomicBool::new(true));
    let conn_cancel = cancel.child_token();

    let write_task = tokio::spawn(write_pump(write, write_rx, conn_cancel.clone()));
    let ping_task = tokio::spawn(ping_pump(write_tx.clone(), conn_cancel.clone()));

    let handle: Arc<dyn ClientHandle> = Arc::new(WsHandle {
        tx: write_tx.clone(),
        alive: Arc::clone(&alive),
    });

    let mut registered: Option<DeviceId> = None;

    // Any incoming frame resets the deadline; silence past WS_PONG_WAIT
    // means the socket is dead even if TCP never noticed.
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                dispatch(&text, &registry, &handle, &mut registered).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary never travels over the relay.
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    alive.store(false, Ordering::Relaxed);
    conn_cancel.cancel();
    if let Some(id) = registered {
        registry.remove(&id, &handle).await;
    }
    let _ = write_task.await;
    let _ = ping_task.await;
}

async fn dispatch(
    text: &str,
    registry: &Arc<DeviceRegistry>,
    handle: &Arc<dyn ClientHandle>,
    registered: &mut Option<DeviceId>,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(ev) => ev,
        Err(e) => {
            warn!("unparseable client event: {e}");
            handle.send(&ServerEvent::Error {
                message: "Invalid message".into(),
            });
            return;
        }
    };

    match event {
        ClientEvent::Register { device_id } => {
            if let Some(old) = registered.replace(device_id.clone()) {
                if old != device_id {
                    registry.remove(&old, handle).await;
                }
            }
            registry.register(device_id, Arc::clone(handle)).await;
        }

        ClientEvent::GetDevices => {
            handle.send(&ServerEvent::DeviceList {
                devices: registry.device_list().await,
            });
        }

        ClientEvent::ConnectToDevice { target_id } => match registered {
            Some(from) => registry.pair(from, &target_id).await,
            None => send_not_registered(handle),
        },

        ClientEvent::Signal { to, data } => {
            let len = data.to_string().len();
            if len > MAX_SIGNAL_PAYLOAD {
                warn!(len, "oversized signal payload");
                handle.send(&ServerEvent::Error {
                    message: "Signal payload too large".into(),
                });
                return;
            }
            match registered {
                Some(from) => registry.relay_signal(from, &to, data).await,
                None => send_not_registered(handle),
            }
        }

        ClientEvent::DisconnectPeer => {
            if let Some(from) = registered {
                registry.unpair(from).await;
            }
        }
    }
}

fn send_not_registered(handle: &Arc<dyn ClientHandle>) {
    handle.send(&ServerEvent::Error {
        message: "Not registered".into(),
    });
}

/// Writes queued messages to the WebSocket, closing it on exit.
async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                match msg {
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

/// Sends periodic pings to keep the connection alive.
async fn ping_pump(write_tx: mpsc::Sender<tungstenite::Message>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(vec![].into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
