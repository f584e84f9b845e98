//! WebSocket client for the signaling relay.
//!
//! Pure event push: the relay never answers requests with correlated
//! responses, it broadcasts state changes. Incoming [`ServerEvent`]s arrive
//! on the receiver returned by [`RelayClient::connect`]; the channel closing
//! means the connection died.
//!
//! Two tasks run per connection: an outbound pump that owns the sink and
//! interleaves keepalive pings with queued frames, and a read pump that
//! parses relay events and enforces the pong deadline.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use beamdrop_protocol::constants::{
    MAX_SIGNAL_PAYLOAD, RELAY_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT,
};
use beamdrop_protocol::signal::{ClientEvent, ServerEvent};
use beamdrop_protocol::DeviceId;

use crate::PeerError;

const SEND_BUFFER_SIZE: usize = 256;
const EVENT_BUFFER_SIZE: usize = 256;

/// Client connection to the signaling relay.
pub struct RelayClient {
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
}

impl RelayClient {
    /// Connects to the relay and spawns the outbound and read pumps.
    ///
    /// Server events arrive on the returned receiver; it closes when the
    /// connection is lost.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ServerEvent>), PeerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(RELAY_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(RELAY_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(SEND_BUFFER_SIZE);
        let (events_tx, events_rx) = mpsc::channel::<ServerEvent>(EVENT_BUFFER_SIZE);
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(outbound_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(read_pump(read, events_tx, write_tx, cancel))
        };

        Ok((
            Self {
                write_tx,
                cancel,
                _read_handle: read_handle,
                _write_handle: write_handle,
            },
            events_rx,
        ))
    }

    async fn send_event(&self, event: &ClientEvent) -> Result<(), PeerError> {
        let json = serde_json::to_string(event)?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| PeerError::Closed)
    }

    /// Claims `device_id` on the relay.
    pub async fn register(&self, device_id: &DeviceId) -> Result<(), PeerError> {
        self.send_event(&ClientEvent::Register {
            device_id: device_id.clone(),
        })
        .await
    }

    /// Requests a fresh device list.
    pub async fn request_devices(&self) -> Result<(), PeerError> {
        self.send_event(&ClientEvent::GetDevices).await
    }

    /// Asks the relay to pair us with `target_id`.
    pub async fn connect_to_device(&self, target_id: &DeviceId) -> Result<(), PeerError> {
        self.send_event(&ClientEvent::ConnectToDevice {
            target_id: target_id.clone(),
        })
        .await
    }

    /// Forwards an opaque negotiation payload to the paired device.
    pub async fn send_signal(
        &self,
        to: &DeviceId,
        data: serde_json::Value,
    ) -> Result<(), PeerError> {
        let len = data.to_string().len();
        if len > MAX_SIGNAL_PAYLOAD {
            return Err(PeerError::PayloadTooLarge(len));
        }
        self.send_event(&ClientEvent::Signal {
            to: to.clone(),
            data,
        })
        .await
    }

    /// Tears down the current pairing on the relay.
    pub async fn disconnect_peer(&self) -> Result<(), PeerError> {
        self.send_event(&ClientEvent::DisconnectPeer).await
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}

/// Owns the sink: drains queued frames and emits a keepalive ping whenever
/// [`WS_PING_PERIOD`] passes, closing the socket on exit.
async fn outbound_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut keepalive = tokio::time::interval(WS_PING_PERIOD);
    keepalive.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = keepalive.tick() => {
                let ping = tungstenite::Message::Ping(vec![].into());
                if write.send(ping).await.is_err() {
                    break;
                }
            }
            msg = write_rx.recv() => match msg {
                Some(m) => {
                    if let Err(e) = write.send(m).await {
                        warn!("relay write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

/// Reads relay messages and pushes parsed [`ServerEvent`]s into `events`.
///
/// Any incoming frame resets the pong deadline; silence past [`WS_PONG_WAIT`]
/// means the socket is dead even if TCP never noticed. The caller observes
/// disconnection as the `events` channel closing.
async fn read_pump<S>(
    mut read: S,
    events: mpsc::Sender<ServerEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, relay connection dead");
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
                                if let Some(event) = parse_event(&text) {
                                    if events.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
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
    // Dropping `events` signals disconnection to the coordinator.
}

fn parse_event(text: &str) -> Option<ServerEvent> {
    if text.len() > RELAY_MAX_MESSAGE_SIZE {
        warn!("relay message too large ({} bytes), dropping", text.len());
        return None;
    }
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("failed to parse relay event: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{sink, stream};

    use beamdrop_relay::{RelayConfig, RelayServer};

    fn id(s: &str) -> DeviceId {
        DeviceId::parse(s).unwrap()
    }

    async fn expect_paired(events: &mut mpsc::Receiver<ServerEvent>, want: &str) {
        let want = id(want);
        loop {
            match events.recv().await.unwrap() {
                ServerEvent::PeerConnected { peer_id } => {
                    assert_eq!(peer_id, want);
                    return;
                }
                ServerEvent::DeviceList { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    async fn start_relay() -> (Arc<RelayServer>, tokio::task::JoinHandle<()>, String) {
        let server = RelayServer::new(RelayConfig { port: 0 });
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let port = server.port().await;
        (server, handle, format!("ws://127.0.0.1:{port}"))
    }

    #[tokio::test]
    async fn register_and_receive_device_list() {
        let (server, handle, url) = start_relay().await;

        let (client, mut events) = RelayClient::connect(&url).await.unwrap();
        client.register(&id("AAA111")).await.unwrap();

        match events.recv().await.unwrap() {
            ServerEvent::DeviceList { devices } => {
                assert_eq!(devices.len(), 1);
                assert_eq!(devices[0].id, id("AAA111"));
            }
            other => panic!("expected device list, got {other:?}"),
        }

        client.close().await;
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pairing_flows_through_relay() {
        let (server, handle, url) = start_relay().await;

        let (alice, mut alice_events) = RelayClient::connect(&url).await.unwrap();
        let (bob, mut bob_events) = RelayClient::connect(&url).await.unwrap();
        alice.register(&id("AAA111")).await.unwrap();
        bob.register(&id("BBB222")).await.unwrap();

        alice.connect_to_device(&id("BBB222")).await.unwrap();

        expect_paired(&mut alice_events, "BBB222").await;
        expect_paired(&mut bob_events, "AAA111").await;

        // Opaque signal forwarding.
        let payload = serde_json::json!({"kind": "offer", "sdp": "v=0"});
        bob.send_signal(&id("AAA111"), payload.clone()).await.unwrap();

        loop {
            match alice_events.recv().await.unwrap() {
                ServerEvent::Signal { from, data } => {
                    assert_eq!(from, id("BBB222"));
                    assert_eq!(data, payload);
                    break;
                }
                ServerEvent::DeviceList { .. } => continue,
                other => panic!("expected signal, got {other:?}"),
            }
        }

        alice.close().await;
        bob.close().await;
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_signal_is_rejected_locally() {
        let (server, handle, url) = start_relay().await;
        let (client, _events) = RelayClient::connect(&url).await.unwrap();

        let pad = "x".repeat(MAX_SIGNAL_PAYLOAD + 1);
        let payload = serde_json::json!({ "pad": pad });
        let result = client.send_signal(&id("BBB222"), payload).await;
        assert!(matches!(result, Err(PeerError::PayloadTooLarge(_))));

        client.close().await;
        server.shutdown();
        handle.await.unwrap();
    }

    fn capture_sink() -> (
        std::pin::Pin<Box<impl SinkExt<tungstenite::Message, Error = tungstenite::Error>>>,
        mpsc::Receiver<tungstenite::Message>,
    ) {
        let (sink_tx, sink_rx) = mpsc::channel::<tungstenite::Message>(16);
        let sink = sink::unfold(sink_tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        });
        (Box::pin(sink), sink_rx)
    }

    #[tokio::test]
    async fn outbound_pump_writes_frames_then_closes_on_cancel() {
        let (sink, mut sink_rx) = capture_sink();
        let cancel = CancellationToken::new();

        let (write_tx, write_rx) = mpsc::channel(16);
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            outbound_pump(sink, write_rx, c).await;
        });

        write_tx
            .send(tungstenite::Message::Text("hello".into()))
            .await
            .unwrap();
        match sink_rx.recv().await {
            Some(tungstenite::Message::Text(text)) => assert_eq!(text.as_str(), "hello"),
            other => panic!("expected text frame, got {other:?}"),
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        // Everything after the queued frames is the close handshake.
        let close_msg = sink_rx.recv().await;
        assert!(matches!(close_msg, Some(tungstenite::Message::Close(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_pump_emits_keepalive_pings() {
        let (sink, mut sink_rx) = capture_sink();
        let cancel = CancellationToken::new();

        let (_write_tx, write_rx) = mpsc::channel(16);
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            outbound_pump(sink, write_rx, c).await;
        });

        // Paused time advances straight to the first keepalive tick.
        match sink_rx.recv().await {
            Some(tungstenite::Message::Ping(_)) => {}
            other => panic!("expected ping, got {other:?}"),
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn parse_event_accepts_known_shapes() {
        let event = parse_event(r#"{"type":"peerConnected","peerId":"BBB222"}"#).unwrap();
        assert!(matches!(event, ServerEvent::PeerConnected { .. }));
    }

    #[test]
    fn parse_event_drops_garbage_and_oversize() {
        assert!(parse_event("not json {{{").is_none());
        let huge = "x".repeat(RELAY_MAX_MESSAGE_SIZE + 1);
        assert!(parse_event(&huge).is_none());
    }

    #[tokio::test]
    async fn read_pump_closes_events_on_stream_end() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (write_tx, _write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(empty, events_tx, write_tx, cancel).await;

        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_pump_times_out_on_silence() {
        tokio::time::pause();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (write_tx, _write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(silent, events_tx, write_tx, cancel).await;

        assert!(events_rx.recv().await.is_none(), "channel closes on timeout");
    }

    #[tokio::test]
    async fn read_pump_forwards_parsed_events() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (write_tx, _write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let frames = vec![
            Ok(tungstenite::Message::Text(
                r#"{"type":"peerDisconnected"}"#.into(),
            )),
            Ok(tungstenite::Message::Text("garbage".into())),
            Ok(tungstenite::Message::Text(
                r#"{"type":"error","message":"Device not found"}"#.into(),
            )),
        ];
        let stream = stream::iter(frames);

        read_pump(stream, events_tx, write_tx, cancel).await;

        assert!(matches!(
            events_rx.recv().await,
            Some(ServerEvent::PeerDisconnected)
        ));
        match events_rx.recv().await {
            Some(ServerEvent::Error { message }) => assert_eq!(message, "Device not found"),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(events_rx.recv().await.is_none());
    }
}
