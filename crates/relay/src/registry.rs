//! Device registry and pairing state.
//!
//! One registry per relay instance. Registration is last-write-wins: a new
//! socket claiming an already-taken ID silently supersedes the old one.
//! Pairings are symmetric, stored as two directed entries so either side
//! resolves its partner in one lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use beamdrop_protocol::signal::{DeviceSummary, ServerEvent};
use beamdrop_protocol::DeviceId;

/// Outbound half of one client connection.
///
/// `send` must not block; the WebSocket implementation buffers into a
/// bounded channel and drops on overflow.
pub trait ClientHandle: Send + Sync {
    fn send(&self, event: &ServerEvent);
    fn is_connected(&self) -> bool;
}

struct Inner {
    devices: HashMap<DeviceId, Arc<dyn ClientHandle>>,
    pairings: HashMap<DeviceId, DeviceId>,
}

/// All devices known to the relay, and who is paired with whom.
pub struct DeviceRegistry {
    inner: Mutex<Inner>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                devices: HashMap::new(),
                pairings: HashMap::new(),
            }),
        }
    }

    /// Registers a device, superseding any previous holder of the ID, and
    /// broadcasts the updated device list to everyone.
    pub async fn register(&self, id: DeviceId, handle: Arc<dyn ClientHandle>) {
        let mut inner = self.inner.lock().await;
        if inner.devices.insert(id.clone(), handle).is_some() {
            info!(%id, "device re-registered, superseding previous socket");
            // The superseded socket's pairing is stale.
            Self::unpair_locked(&mut inner, &id);
        } else {
            info!(%id, "device registered");
        }
        Self::broadcast_list_locked(&inner);
    }

    /// Removes a device if `handle` is still its current socket.
    ///
    /// The pointer check keeps a closing superseded socket from evicting the
    /// registration that replaced it. Idempotent.
    pub async fn remove(&self, id: &DeviceId, handle: &Arc<dyn ClientHandle>) {
        let mut inner = self.inner.lock().await;
        let current = match inner.devices.get(id) {
            Some(h) => Arc::ptr_eq(h, handle),
            None => false,
        };
        if !current {
            return;
        }
        Self::unpair_locked(&mut inner, id);
        inner.devices.remove(id);
        info!(%id, "device removed");
        Self::broadcast_list_locked(&inner);
    }

    /// Current device list snapshot.
    pub async fn device_list(&self) -> Vec<DeviceSummary> {
        let inner = self.inner.lock().await;
        Self::summaries_locked(&inner)
    }

    /// Pairs `from` with `to`, replacing any existing pairing on either
    /// side. Errors go back to the requester only.
    pub async fn pair(&self, from: &DeviceId, to: &DeviceId) {
        let mut inner = self.inner.lock().await;
        let Some(requester) = inner.devices.get(from).cloned() else {
            return;
        };
        if from == to {
            requester.send(&ServerEvent::cannot_connect_to_self());
            return;
        }
        let Some(target) = inner.devices.get(to).cloned() else {
            debug!(%from, %to, "pairing target not registered");
            requester.send(&ServerEvent::device_not_found());
            return;
        };

        // Replacing a pairing notifies the abandoned partner.
        Self::unpair_locked(&mut inner, from);
        Self::unpair_locked(&mut inner, to);
        inner.pairings.insert(from.clone(), to.clone());
        inner.pairings.insert(to.clone(), from.clone());
        info!(%from, %to, "devices paired");

        requester.send(&ServerEvent::PeerConnected {
            peer_id: to.clone(),
        });
        target.send(&ServerEvent::PeerConnected {
            peer_id: from.clone(),
        });
        // Everyone sees the `connected` flags flip.
        Self::broadcast_list_locked(&inner);
    }

    /// Forwards an opaque negotiation payload to `to`. Unknown targets are
    /// dropped silently; late signals for departed peers are expected.
    pub async fn relay_signal(&self, from: &DeviceId, to: &DeviceId, data: serde_json::Value) {
        let inner = self.inner.lock().await;
        match inner.devices.get(to) {
            Some(target) => target.send(&ServerEvent::Signal {
                from: from.clone(),
                data,
            }),
            None => debug!(%from, %to, "dropping signal for unknown target"),
        }
    }

    /// Tears down `id`'s pairing, notifying the partner. Idempotent.
    pub async fn unpair(&self, id: &DeviceId) {
        let mut inner = self.inner.lock().await;
        let had_pairing = inner.pairings.contains_key(id);
        Self::unpair_locked(&mut inner, id);
        if had_pairing {
            Self::broadcast_list_locked(&inner);
        }
    }

    /// Evicts every device whose socket has gone dead without a close
    /// frame, broadcasting the list if anything changed.
    pub async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        let dead: Vec<DeviceId> = inner
            .devices
            .iter()
            .filter(|(_, h)| !h.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        if dead.is_empty() {
            return;
        }
        for id in &dead {
            Self::unpair_locked(&mut inner, id);
            inner.devices.remove(id);
            info!(%id, "swept dead device");
        }
        Self::broadcast_list_locked(&inner);
    }

    fn unpair_locked(inner: &mut Inner, id: &DeviceId) {
        let Some(partner) = inner.pairings.remove(id) else {
            return;
        };
        inner.pairings.remove(&partner);
        debug!(%id, %partner, "pairing dissolved");
        if let Some(handle) = inner.devices.get(&partner) {
            handle.send(&ServerEvent::PeerDisconnected);
        }
    }

    fn summaries_locked(inner: &Inner) -> Vec<DeviceSummary> {
        let mut list: Vec<DeviceSummary> = inner
            .devices
            .keys()
            .map(|id| DeviceSummary {
                id: id.clone(),
                connected: inner.pairings.contains_key(id),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn broadcast_list_locked(inner: &Inner) {
        let event = ServerEvent::DeviceList {
            devices: Self::summaries_locked(inner),
        };
        for handle in inner.devices.values() {
            handle.send(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeHandle {
        events: StdMutex<Vec<String>>,
        connected: AtomicBool,
    }

    impl FakeHandle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
                connected: AtomicBool::new(true),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn last(&self) -> String {
            self.events().last().cloned().unwrap_or_default()
        }
    }

    impl ClientHandle for FakeHandle {
        fn send(&self, event: &ServerEvent) {
            self.events
                .lock()
                .unwrap()
                .push(serde_json::to_string(event).unwrap());
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn id(s: &str) -> DeviceId {
        DeviceId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn register_broadcasts_device_list() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        let b = FakeHandle::new();

        registry.register(id("AAA111"), a.clone()).await;
        registry.register(id("BBB222"), b.clone()).await;

        // The earlier device sees the later arrival.
        assert!(a.last().contains("BBB222"));
        assert!(a.last().contains(r#""type":"deviceList""#));
        assert!(b.last().contains("AAA111"));
    }

    #[tokio::test]
    async fn pairing_notifies_both_sides() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        let b = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;
        registry.register(id("BBB222"), b.clone()).await;

        registry.pair(&id("AAA111"), &id("BBB222")).await;

        let a_events = a.events();
        assert!(a_events
            .iter()
            .any(|e| e == r#"{"type":"peerConnected","peerId":"BBB222"}"#));
        let b_events = b.events();
        assert!(b_events
            .iter()
            .any(|e| e == r#"{"type":"peerConnected","peerId":"AAA111"}"#));

        // The follow-up broadcast flips both `connected` flags.
        assert!(a.last().contains(r#""type":"deviceList""#));
        assert!(a.last().contains(r#""connected":true"#));
    }

    #[tokio::test]
    async fn pairing_unknown_target_reports_device_not_found() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;

        registry.pair(&id("AAA111"), &id("GHOST9")).await;

        assert_eq!(
            a.last(),
            r#"{"type":"error","message":"Device not found"}"#
        );
    }

    #[tokio::test]
    async fn pairing_with_self_is_rejected() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;

        registry.pair(&id("AAA111"), &id("AAA111")).await;

        assert_eq!(
            a.last(),
            r#"{"type":"error","message":"Cannot connect to yourself"}"#
        );
    }

    #[tokio::test]
    async fn new_pairing_replaces_old_and_notifies_abandoned_peer() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        let b = FakeHandle::new();
        let c = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;
        registry.register(id("BBB222"), b.clone()).await;
        registry.register(id("CCC333"), c.clone()).await;

        registry.pair(&id("AAA111"), &id("BBB222")).await;
        registry.pair(&id("AAA111"), &id("CCC333")).await;

        assert!(b
            .events()
            .iter()
            .any(|e| e == r#"{"type":"peerDisconnected"}"#));
        assert!(c
            .events()
            .iter()
            .any(|e| e == r#"{"type":"peerConnected","peerId":"AAA111"}"#));
    }

    #[tokio::test]
    async fn signal_is_forwarded_verbatim_to_target() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        let b = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;
        registry.register(id("BBB222"), b.clone()).await;

        let payload = serde_json::json!({"kind": "offer", "sdp": "v=0"});
        registry
            .relay_signal(&id("AAA111"), &id("BBB222"), payload)
            .await;

        assert_eq!(
            b.last(),
            r#"{"type":"signal","from":"AAA111","data":{"kind":"offer","sdp":"v=0"}}"#
        );
    }

    #[tokio::test]
    async fn signal_to_unknown_target_is_dropped_silently() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;
        let before = a.events().len();

        registry
            .relay_signal(&id("AAA111"), &id("GHOST9"), serde_json::json!({}))
            .await;

        // No error back to the sender.
        assert_eq!(a.events().len(), before);
    }

    #[tokio::test]
    async fn unpair_notifies_partner_and_is_idempotent() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        let b = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;
        registry.register(id("BBB222"), b.clone()).await;
        registry.pair(&id("AAA111"), &id("BBB222")).await;

        registry.unpair(&id("AAA111")).await;
        assert!(b
            .events()
            .iter()
            .any(|e| e == r#"{"type":"peerDisconnected"}"#));

        let before = b.events().len();
        registry.unpair(&id("AAA111")).await;
        registry.unpair(&id("BBB222")).await;
        assert_eq!(b.events().len(), before);
    }

    #[tokio::test]
    async fn reregistration_supersedes_and_keeps_new_socket_on_old_close() {
        let registry = DeviceRegistry::new();
        let old = FakeHandle::new();
        let new = FakeHandle::new();
        registry.register(id("AAA111"), old.clone()).await;
        registry.register(id("AAA111"), new.clone()).await;

        // The superseded socket closing must not evict the new registration.
        let old_dyn: Arc<dyn ClientHandle> = old.clone();
        registry.remove(&id("AAA111"), &old_dyn).await;

        let list = registry.device_list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id("AAA111"));
    }

    #[tokio::test]
    async fn sweep_evicts_dead_sockets_and_dissolves_pairings() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        let b = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;
        registry.register(id("BBB222"), b.clone()).await;
        registry.pair(&id("AAA111"), &id("BBB222")).await;

        a.connected.store(false, Ordering::SeqCst);
        registry.sweep().await;

        assert_eq!(registry.device_list().await.len(), 1);
        let events = b.events();
        assert!(events.iter().any(|e| e == r#"{"type":"peerDisconnected"}"#));

        // Nothing dead: sweeping again changes nothing.
        let before = b.events().len();
        registry.sweep().await;
        assert_eq!(b.events().len(), before);
    }

    #[tokio::test]
    async fn device_list_marks_paired_devices_connected() {
        let registry = DeviceRegistry::new();
        let a = FakeHandle::new();
        let b = FakeHandle::new();
        let c = FakeHandle::new();
        registry.register(id("AAA111"), a.clone()).await;
        registry.register(id("BBB222"), b.clone()).await;
        registry.register(id("CCC333"), c.clone()).await;
        registry.pair(&id("AAA111"), &id("BBB222")).await;

        let list = registry.device_list().await;
        let find = |s: &str| list.iter().find(|d| d.id == id(s)).unwrap().connected;
        assert!(find("AAA111"));
        assert!(find("BBB222"));
        assert!(!find("CCC333"));
    }
}
