//! Session coordinator: relay signaling glued to channel negotiation.
//!
//! Owns the relay connection, reacts to pairing events, runs the
//! negotiator for the current peer, and surfaces everything the
//! application cares about as a [`SessionEvent`] stream. Reconnects to
//! the relay with backoff when the socket drops.

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamdrop_protocol::constants::{DEVICE_ID_GENERATED_LEN, OFFER_FALLBACK_TIMEOUT};
use beamdrop_protocol::signal::ServerEvent;
use beamdrop_protocol::DeviceId;

use crate::endpoint::{EndpointEvent, EndpointFactory, LinkState, PeerRole};
use crate::negotiator::Negotiator;
use crate::relay_client::RelayClient;
use crate::types::{SessionConfig, SessionEvent, SignalPayload};
use crate::PeerError;

const EVENT_BUFFER_SIZE: usize = 64;
const COMMAND_BUFFER_SIZE: usize = 16;

/// Generates a random device ID of the standard generated length.
pub fn generate_device_id() -> DeviceId {
    loop {
        let raw: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(DEVICE_ID_GENERATED_LEN)
            .map(|b| (b as char).to_ascii_uppercase())
            .collect();
        if let Ok(id) = DeviceId::parse(&raw) {
            return id;
        }
    }
}

/// Deterministic tie-break: the lexicographically smaller ID sends the
/// offer, so both peers agree on roles without another round trip.
pub fn initiates_offer(local: &DeviceId, remote: &DeviceId) -> bool {
    local < remote
}

enum Command {
    ConnectTo(DeviceId),
    Disconnect,
    RequestDevices,
}

enum PairingStep {
    Endpoint(EndpointEvent),
    OfferFallback,
}

/// State for the current pairing.
struct Pairing {
    peer_id: DeviceId,
    negotiator: Arc<Negotiator>,
    endpoint_events: mpsc::UnboundedReceiver<EndpointEvent>,
    /// Armed on the answerer: if no offer arrives before this fires, the
    /// answerer sends one itself so a dropped offer cannot stall forever.
    offer_deadline: Option<Pin<Box<Sleep>>>,
}

/// Drives one device's session against the relay.
pub struct SessionCoordinator {
    config: SessionConfig,
    factory: Arc<dyn EndpointFactory>,
    device_id: DeviceId,
    events: mpsc::Sender<SessionEvent>,
    command_tx: mpsc::Sender<Command>,
    commands: StdMutex<Option<mpsc::Receiver<Command>>>,
    cancel: CancellationToken,
}

impl SessionCoordinator {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn EndpointFactory>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let device_id = config
            .device_id
            .clone()
            .unwrap_or_else(generate_device_id);
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        (
            Arc::new(Self {
                config,
                factory,
                device_id,
                events,
                command_tx,
                commands: StdMutex::new(Some(command_rx)),
                cancel: CancellationToken::new(),
            }),
            events_rx,
        )
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Asks the relay to pair this device with `peer_id`.
    pub async fn connect_to(&self, peer_id: DeviceId) -> Result<(), PeerError> {
        self.command_tx
            .send(Command::ConnectTo(peer_id))
            .await
            .map_err(|_| PeerError::Closed)
    }

    /// Tears down the current pairing.
    pub async fn disconnect_peer(&self) -> Result<(), PeerError> {
        self.command_tx
            .send(Command::Disconnect)
            .await
            .map_err(|_| PeerError::Closed)
    }

    /// Requests a fresh device list broadcast.
    pub async fn request_devices(&self) -> Result<(), PeerError> {
        self.command_tx
            .send(Command::RequestDevices)
            .await
            .map_err(|_| PeerError::Closed)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the session until shutdown: connect, register, drive events,
    /// reconnect with backoff on socket loss. Callable once.
    pub async fn run(self: &Arc<Self>) -> Result<(), PeerError> {
        let mut commands = self
            .commands
            .lock()
            .unwrap()
            .take()
            .ok_or(PeerError::Closed)?;

        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match RelayClient::connect(&self.config.relay_url).await {
                Ok((relay, relay_events)) => match relay.register(&self.device_id).await {
                    Ok(()) => {
                        attempt = 0;
                        info!(device_id = %self.device_id, "registered with relay");
                        let _ = self
                            .events
                            .send(SessionEvent::Registered {
                                device_id: self.device_id.clone(),
                            })
                            .await;
                        let lost = self.drive(&relay, relay_events, &mut commands).await;
                        relay.close().await;
                        if !lost {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!("registration failed: {e}"),
                },
                Err(e) => warn!("relay connection failed: {e}"),
            }
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            attempt += 1;
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            info!(attempt, ?delay, "reconnecting to relay");
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Event loop for one relay connection. Returns `true` if the socket
    /// was lost and the session should reconnect, `false` on shutdown.
    async fn drive(
        self: &Arc<Self>,
        relay: &RelayClient,
        mut relay_events: mpsc::Receiver<ServerEvent>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> bool {
        let mut pairing: Option<Pairing> = None;
        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.close_pairing(&mut pairing, false).await;
                    return false;
                }
                maybe = relay_events.recv() => match maybe {
                    Some(event) => self.on_relay_event(relay, &mut pairing, event).await,
                    None => {
                        warn!("relay connection lost");
                        self.close_pairing(&mut pairing, true).await;
                        return true;
                    }
                },
                maybe = commands.recv() => match maybe {
                    Some(command) => self.on_command(relay, &mut pairing, command).await,
                    None => {
                        self.close_pairing(&mut pairing, false).await;
                        return false;
                    }
                },
                step = Self::pairing_activity(&mut pairing) => match step {
                    PairingStep::Endpoint(event) => {
                        self.on_endpoint_event(relay, &mut pairing, event).await
                    }
                    PairingStep::OfferFallback => {
                        self.on_offer_fallback(relay, &mut pairing).await
                    }
                },
            };
            match step {
                Ok(()) => {}
                Err(PeerError::Closed) => {
                    self.close_pairing(&mut pairing, true).await;
                    return true;
                }
                Err(e) => {
                    warn!("session step failed: {e}");
                    let _ = self
                        .events
                        .send(SessionEvent::ConnectionFailed {
                            reason: e.to_string(),
                        })
                        .await;
                }
            }
        }
    }

    /// Resolves with the next endpoint event or the offer-fallback firing.
    /// Pends forever while there is no pairing, so `select!` ignores it.
    async fn pairing_activity(pairing: &mut Option<Pairing>) -> PairingStep {
        let Some(p) = pairing.as_mut() else {
            return std::future::pending().await;
        };
        let Pairing {
            endpoint_events,
            offer_deadline,
            ..
        } = p;
        tokio::select! {
            maybe = endpoint_events.recv() => match maybe {
                Some(event) => PairingStep::Endpoint(event),
                None => std::future::pending().await,
            },
            _ = Self::deadline(offer_deadline) => PairingStep::OfferFallback,
        }
    }

    async fn deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
        match deadline {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }

    async fn on_command(
        self: &Arc<Self>,
        relay: &RelayClient,
        pairing: &mut Option<Pairing>,
        command: Command,
    ) -> Result<(), PeerError> {
        match command {
            Command::ConnectTo(peer_id) => relay.connect_to_device(&peer_id).await,
            Command::Disconnect => {
                relay.disconnect_peer().await?;
                self.close_pairing(pairing, true).await;
                Ok(())
            }
            Command::RequestDevices => relay.request_devices().await,
        }
    }

    async fn on_relay_event(
        self: &Arc<Self>,
        relay: &RelayClient,
        pairing: &mut Option<Pairing>,
        event: ServerEvent,
    ) -> Result<(), PeerError> {
        match event {
            ServerEvent::DeviceList { devices } => {
                let _ = self.events.send(SessionEvent::DeviceList { devices }).await;
                Ok(())
            }
            ServerEvent::PeerConnected { peer_id } => {
                // A new pairing replaces whatever negotiation was running.
                self.close_pairing(pairing, true).await;

                let role = if initiates_offer(&self.device_id, &peer_id) {
                    PeerRole::Offerer
                } else {
                    PeerRole::Answerer
                };
                info!(peer_id = %peer_id, ?role, "paired");

                let (negotiator, endpoint_events) =
                    Negotiator::new(Arc::clone(&self.factory), role).await?;
                let mut fresh = Pairing {
                    peer_id: peer_id.clone(),
                    negotiator: Arc::new(negotiator),
                    endpoint_events,
                    offer_deadline: match role {
                        PeerRole::Offerer => None,
                        PeerRole::Answerer => {
                            Some(Box::pin(tokio::time::sleep(OFFER_FALLBACK_TIMEOUT)))
                        }
                    },
                };
                let _ = self.events.send(SessionEvent::Paired { peer_id }).await;

                if role == PeerRole::Offerer {
                    self.send_offer(relay, &mut fresh).await?;
                }
                *pairing = Some(fresh);
                Ok(())
            }
            ServerEvent::PeerDisconnected => {
                self.close_pairing(pairing, true).await;
                Ok(())
            }
            ServerEvent::Signal { from, data } => {
                let Some(p) = pairing.as_mut() else {
                    debug!(from = %from, "signal without a pairing, ignoring");
                    return Ok(());
                };
                if from != p.peer_id {
                    warn!(from = %from, "signal from a device we are not paired with");
                    return Ok(());
                }
                let payload: SignalPayload = match serde_json::from_value(data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("unparseable signal payload: {e}");
                        return Ok(());
                    }
                };
                self.on_signal(relay, p, payload).await
            }
            ServerEvent::Error { message } => {
                warn!("relay error: {message}");
                let _ = self.events.send(SessionEvent::RelayError { message }).await;
                Ok(())
            }
        }
    }

    async fn on_signal(
        self: &Arc<Self>,
        relay: &RelayClient,
        pairing: &mut Pairing,
        payload: SignalPayload,
    ) -> Result<(), PeerError> {
        match payload {
            SignalPayload::Offer { sdp } => {
                pairing.offer_deadline = None;
                match pairing.negotiator.handle_offer(sdp).await {
                    Ok(answer) => {
                        self.send_payload(relay, &pairing.peer_id, &SignalPayload::answer(&answer))
                            .await
                    }
                    Err(PeerError::NegotiationBusy) => {
                        debug!("offer collision, dropping the remote offer");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            SignalPayload::Answer { sdp } => pairing.negotiator.handle_answer(sdp).await,
            SignalPayload::Candidate { candidate } => {
                pairing.negotiator.add_remote_candidate(candidate).await;
                Ok(())
            }
        }
    }

    async fn on_endpoint_event(
        self: &Arc<Self>,
        relay: &RelayClient,
        pairing: &mut Option<Pairing>,
        event: EndpointEvent,
    ) -> Result<(), PeerError> {
        let Some(p) = pairing.as_mut() else {
            return Ok(());
        };
        match event {
            EndpointEvent::LocalCandidate(candidate) => {
                self.send_payload(relay, &p.peer_id, &SignalPayload::Candidate { candidate })
                    .await
            }
            EndpointEvent::ChannelOpen { channel, incoming } => {
                info!(peer_id = %p.peer_id, "direct channel open");
                let _ = self
                    .events
                    .send(SessionEvent::ChannelReady { channel, incoming })
                    .await;
                Ok(())
            }
            EndpointEvent::StateChanged(link) => match link {
                LinkState::Failed => {
                    warn!(peer_id = %p.peer_id, "direct link failed, renegotiating");
                    p.negotiator.reset().await?;
                    match p.negotiator.role() {
                        PeerRole::Offerer => self.send_offer(relay, p).await,
                        PeerRole::Answerer => {
                            p.offer_deadline =
                                Some(Box::pin(tokio::time::sleep(OFFER_FALLBACK_TIMEOUT)));
                            Ok(())
                        }
                    }
                }
                other => {
                    debug!(state = ?other, "link state changed");
                    Ok(())
                }
            },
        }
    }

    /// The offerer went silent, so this side takes over its role. The
    /// answerer-side endpoint never created a data channel, so it cannot
    /// simply offer; it is replaced with an offerer-role negotiation whose
    /// endpoint carries the channel.
    async fn on_offer_fallback(
        self: &Arc<Self>,
        relay: &RelayClient,
        pairing: &mut Option<Pairing>,
    ) -> Result<(), PeerError> {
        let Some(p) = pairing.as_mut() else {
            return Ok(());
        };
        p.offer_deadline = None;
        warn!(peer_id = %p.peer_id, "no offer from the offerer, taking over");

        p.negotiator.close().await;
        let (negotiator, endpoint_events) =
            Negotiator::new(Arc::clone(&self.factory), PeerRole::Offerer).await?;
        p.negotiator = Arc::new(negotiator);
        p.endpoint_events = endpoint_events;
        self.send_offer(relay, p).await
    }

    async fn send_offer(
        self: &Arc<Self>,
        relay: &RelayClient,
        pairing: &mut Pairing,
    ) -> Result<(), PeerError> {
        let offer = pairing.negotiator.create_offer().await?;
        self.send_payload(relay, &pairing.peer_id, &SignalPayload::offer(&offer))
            .await
    }

    async fn send_payload(
        &self,
        relay: &RelayClient,
        to: &DeviceId,
        payload: &SignalPayload,
    ) -> Result<(), PeerError> {
        let data = serde_json::to_value(payload)?;
        relay.send_signal(to, data).await
    }

    /// Drops the current pairing, closing its negotiator. `notify` emits a
    /// `PeerLeft` if there was a pairing to drop.
    async fn close_pairing(&self, pairing: &mut Option<Pairing>, notify: bool) {
        if let Some(p) = pairing.take() {
            p.negotiator.close().await;
            if notify {
                let _ = self.events.send(SessionEvent::PeerLeft).await;
            }
        }
    }
}
