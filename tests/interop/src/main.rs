fn main() {
    println!("Run `cargo test -p interop` to execute the end-to-end scenarios.");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::stream::{SplitSink, SplitStream};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    use beamdrop_relay::{RelayConfig, RelayServer};

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
    type WsSink = SplitSink<Ws, Message>;
    type WsSource = SplitStream<Ws>;

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

    /// Connects a raw WebSocket client and registers it under `device_id`.
    async fn register(url: &str, device_id: &str) -> (WsSink, WsSource) {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (mut sink, source) = ws.split();
        sink.send(Message::Text(
            format!(r#"{{"type":"register","deviceId":"{device_id}"}}"#).into(),
        ))
        .await
        .unwrap();
        (sink, source)
    }

    /// Next text frame as parsed JSON, skipping pings, bounded by a timeout.
    async fn recv_json(source: &mut WsSource) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match source.next().await.unwrap().unwrap() {
                    Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for a relay message")
    }

    /// Skips broadcasts until a message of the given `type` arrives.
    async fn recv_of_type(source: &mut WsSource, kind: &str) -> serde_json::Value {
        loop {
            let msg = recv_json(source).await;
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn registration_broadcasts_sorted_device_list() {
        let (server, handle, url) = start_relay().await;

        let (_a_sink, mut a_source) = register(&url, "BBB222").await;
        let first = recv_json(&mut a_source).await;
        assert_eq!(
            first,
            serde_json::json!({
                "type": "deviceList",
                "devices": [{"id": "BBB222", "connected": false}]
            })
        );

        let (_b_sink, _b_source) = register(&url, "AAA111").await;
        let second = recv_of_type(&mut a_source, "deviceList").await;
        assert_eq!(
            second["devices"],
            serde_json::json!([
                {"id": "AAA111", "connected": false},
                {"id": "BBB222", "connected": false}
            ])
        );

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pairing_notifies_both_sides_and_marks_connected() {
        let (server, handle, url) = start_relay().await;

        let (mut a_sink, mut a_source) = register(&url, "AAA111").await;
        let (_b_sink, mut b_source) = register(&url, "BBB222").await;

        a_sink
            .send(Message::Text(
                r#"{"type":"connectToDevice","targetId":"BBB222"}"#.into(),
            ))
            .await
            .unwrap();

        let to_a = recv_of_type(&mut a_source, "peerConnected").await;
        assert_eq!(to_a["peerId"], "BBB222");
        let to_b = recv_of_type(&mut b_source, "peerConnected").await;
        assert_eq!(to_b["peerId"], "AAA111");

        // The next broadcast shows both devices as paired.
        let list = recv_of_type(&mut a_source, "deviceList").await;
        for device in list["devices"].as_array().unwrap() {
            assert_eq!(device["connected"], true, "{device}");
        }

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn signals_are_forwarded_verbatim_both_directions() {
        let (server, handle, url) = start_relay().await;

        let (mut a_sink, mut a_source) = register(&url, "AAA111").await;
        let (mut b_sink, mut b_source) = register(&url, "BBB222").await;
        a_sink
            .send(Message::Text(
                r#"{"type":"connectToDevice","targetId":"BBB222"}"#.into(),
            ))
            .await
            .unwrap();
        recv_of_type(&mut a_source, "peerConnected").await;
        recv_of_type(&mut b_source, "peerConnected").await;

        // Offer with a nested structure the relay must not reshape.
        a_sink
            .send(Message::Text(
                r#"{"type":"signal","to":"BBB222","data":{"kind":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 0.0.0.0"}}"#.into(),
            ))
            .await
            .unwrap();
        let to_b = recv_of_type(&mut b_source, "signal").await;
        assert_eq!(to_b["from"], "AAA111");
        assert_eq!(to_b["data"]["kind"], "offer");
        assert_eq!(to_b["data"]["sdp"], "v=0\r\no=- 1 2 IN IP4 0.0.0.0");

        // Candidate back the other way, with the mixed-case key intact.
        b_sink
            .send(Message::Text(
                r#"{"type":"signal","to":"AAA111","data":{"kind":"candidate","candidate":{"candidate":"candidate:1 1 udp 2113937151 192.168.1.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}}"#.into(),
            ))
            .await
            .unwrap();
        let to_a = recv_of_type(&mut a_source, "signal").await;
        assert_eq!(to_a["from"], "BBB222");
        assert_eq!(to_a["data"]["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(to_a["data"]["candidate"]["sdpMid"], "0");

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn connecting_to_unknown_device_reports_not_found() {
        let (server, handle, url) = start_relay().await;

        let (mut sink, mut source) = register(&url, "AAA111").await;
        sink.send(Message::Text(
            r#"{"type":"connectToDevice","targetId":"ZZZ999"}"#.into(),
        ))
        .await
        .unwrap();

        let err = recv_of_type(&mut source, "error").await;
        assert_eq!(err["message"], "Device not found");

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn connecting_to_self_is_rejected() {
        let (server, handle, url) = start_relay().await;

        let (mut sink, mut source) = register(&url, "AAA111").await;
        sink.send(Message::Text(
            r#"{"type":"connectToDevice","targetId":"AAA111"}"#.into(),
        ))
        .await
        .unwrap();

        let err = recv_of_type(&mut source, "error").await;
        assert_eq!(err["message"], "Cannot connect to yourself");

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn new_pairing_abandons_the_previous_partner() {
        let (server, handle, url) = start_relay().await;

        let (mut a_sink, mut a_source) = register(&url, "AAA111").await;
        let (_b_sink, mut b_source) = register(&url, "BBB222").await;
        let (_c_sink, mut c_source) = register(&url, "CCC333").await;

        a_sink
            .send(Message::Text(
                r#"{"type":"connectToDevice","targetId":"BBB222"}"#.into(),
            ))
            .await
            .unwrap();
        recv_of_type(&mut a_source, "peerConnected").await;
        recv_of_type(&mut b_source, "peerConnected").await;

        a_sink
            .send(Message::Text(
                r#"{"type":"connectToDevice","targetId":"CCC333"}"#.into(),
            ))
            .await
            .unwrap();

        recv_of_type(&mut b_source, "peerDisconnected").await;
        let to_c = recv_of_type(&mut c_source, "peerConnected").await;
        assert_eq!(to_c["peerId"], "AAA111");
        let to_a = recv_of_type(&mut a_source, "peerConnected").await;
        assert_eq!(to_a["peerId"], "CCC333");

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn explicit_disconnect_notifies_the_partner() {
        let (server, handle, url) = start_relay().await;

        let (mut a_sink, mut a_source) = register(&url, "AAA111").await;
        let (mut b_sink, mut b_source) = register(&url, "BBB222").await;
        a_sink
            .send(Message::Text(
                r#"{"type":"connectToDevice","targetId":"BBB222"}"#.into(),
            ))
            .await
            .unwrap();
        recv_of_type(&mut a_source, "peerConnected").await;
        recv_of_type(&mut b_source, "peerConnected").await;

        b_sink
            .send(Message::Text(r#"{"type":"disconnectPeer"}"#.into()))
            .await
            .unwrap();
        recv_of_type(&mut a_source, "peerDisconnected").await;

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn socket_drop_removes_the_device_and_unpairs() {
        let (server, handle, url) = start_relay().await;

        let (mut a_sink, mut a_source) = register(&url, "AAA111").await;
        let (b_sink, b_source) = register(&url, "BBB222").await;
        a_sink
            .send(Message::Text(
                r#"{"type":"connectToDevice","targetId":"BBB222"}"#.into(),
            ))
            .await
            .unwrap();
        recv_of_type(&mut a_source, "peerConnected").await;

        drop(b_sink);
        drop(b_source);

        recv_of_type(&mut a_source, "peerDisconnected").await;
        let list = recv_of_type(&mut a_source, "deviceList").await;
        assert_eq!(
            list["devices"],
            serde_json::json!([{"id": "AAA111", "connected": false}])
        );

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reregistering_an_id_replaces_the_old_socket() {
        let (server, handle, url) = start_relay().await;

        let (_old_sink, mut old_source) = register(&url, "AAA111").await;
        recv_of_type(&mut old_source, "deviceList").await;

        let (mut new_sink, mut new_source) = register(&url, "AAA111").await;
        let list = recv_of_type(&mut new_source, "deviceList").await;
        assert_eq!(list["devices"].as_array().unwrap().len(), 1);

        // The replacement socket owns the ID: it can still operate.
        new_sink
            .send(Message::Text(r#"{"type":"getDevices"}"#.into()))
            .await
            .unwrap();
        let list = recv_of_type(&mut new_source, "deviceList").await;
        assert_eq!(list["devices"][0]["id"], "AAA111");

        server.shutdown();
        handle.await.unwrap();
    }

    // Data-plane check: the sender's frame sequence reassembles byte-exact
    // on a receiver at the other end of an in-memory pipe.
    mod transfer_pipe {
        use super::*;
        use bytes::Bytes;
        use tokio::sync::mpsc;

        use beamdrop_transfer::{
            ChannelError, ChannelFuture, FlowConfig, OutgoingFile, Payload, ReceiveConfig,
            TransferEvent, TransferReceiver, TransferSender, TransportChannel,
        };

        struct PipeChannel {
            tx: mpsc::UnboundedSender<Payload>,
        }

        impl TransportChannel for PipeChannel {
            fn send(&self, payload: Payload) -> ChannelFuture<'_, ()> {
                Box::pin(async move {
                    self.tx
                        .send(payload)
                        .map_err(|_| ChannelError::NotOpen)
                })
            }
            fn buffered_amount(&self) -> ChannelFuture<'_, usize> {
                Box::pin(async { Ok(0) })
            }
            fn is_open(&self) -> bool {
                true
            }
        }

        #[tokio::test]
        async fn files_survive_the_pipe_byte_exact() {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let sender = TransferSender::new(Arc::new(PipeChannel { tx }), FlowConfig::default());
            let (receiver, mut events) = TransferReceiver::new(ReceiveConfig::default());

            let pump = tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    receiver.feed(payload).unwrap();
                }
            });

            let photo: Bytes = (0..200_000u32).map(|i| (i % 251) as u8).collect();
            sender
                .send_files(vec![
                    OutgoingFile::new("photo.jpg", photo.clone()),
                    OutgoingFile::new("note.txt", Bytes::from_static(b"see attached")),
                ])
                .await
                .unwrap();

            let mut completed = Vec::new();
            while completed.len() < 2 {
                match tokio::time::timeout(Duration::from_secs(5), events.recv())
                    .await
                    .unwrap()
                    .unwrap()
                {
                    TransferEvent::FileComplete(file) => completed.push(file),
                    TransferEvent::Failed { name, .. } => panic!("transfer failed: {name}"),
                    _ => {}
                }
            }

            assert_eq!(completed[0].name, "photo.jpg");
            assert_eq!(completed[0].data, photo);
            assert!(completed[0].is_complete());
            assert_eq!(completed[1].name, "note.txt");
            assert_eq!(completed[1].data, Bytes::from_static(b"see attached"));

            drop(sender);
            pump.await.unwrap();
        }
    }
}
