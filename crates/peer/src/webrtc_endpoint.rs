//! WebRTC-backed [`PeerEndpoint`] and [`TransportChannel`].
//!
//! Each negotiation attempt gets a fresh `RTCPeerConnection`. The offerer
//! creates the data channel; the answerer receives it via `on_data_channel`.
//! Local ICE candidates trickle out through [`EndpointEvent::LocalCandidate`]
//! as they are gathered.

use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use beamdrop_transfer::{ChannelError, ChannelFuture, Payload, TransportChannel};

use crate::endpoint::{
    EndpointError, EndpointEvent, EndpointFactory, EndpointFuture, IceCandidate, LinkState,
    PeerEndpoint, PeerRole, SdpKind, SessionDescription, SignalingState,
};

/// Label for the single data channel carrying transfers.
const DATA_CHANNEL_LABEL: &str = "file";

/// Incoming frame buffer before the transfer engine consumes them.
const INCOMING_BUFFER: usize = 256;

/// One STUN/TURN server entry.
#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// ICE server selection.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl IceConfig {
    /// Public STUN plus a TURN relay, for peers behind NAT.
    pub fn full() -> Self {
        Self {
            servers: vec![
                IceServer {
                    urls: vec!["stun:stun.l.google.com:19302".into()],
                    username: String::new(),
                    credential: String::new(),
                },
                IceServer {
                    urls: vec!["turn:openrelay.metered.ca:80".into()],
                    username: "openrelayproject".into(),
                    credential: "openrelayproject".into(),
                },
            ],
        }
    }

    /// No servers at all: host candidates only, for same-network peers.
    pub fn local() -> Self {
        Self { servers: Vec::new() }
    }

    /// Picks a configuration based on the relay host: private or loopback
    /// addresses mean both peers share a network and host candidates
    /// suffice; anything else gets the full STUN/TURN set.
    pub fn for_host(host: &str) -> Self {
        if is_private_host(host) {
            Self::local()
        } else {
            Self::full()
        }
    }
}

fn is_private_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") || host.ends_with(".local") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback(),
        Err(_) => false,
    }
}

/// Maps a webrtc error onto the endpoint taxonomy by message, since the
/// underlying crate reports most negotiation faults as strings.
fn classify(err: webrtc::Error) -> EndpointError {
    classify_message(err.to_string())
}

fn classify_message(msg: String) -> EndpointError {
    let lower = msg.to_lowercase();
    if lower.contains("invalid state") || lower.contains("signaling state") {
        EndpointError::StateMismatch(msg)
    } else if lower.contains("modif") {
        EndpointError::InvalidModification(msg)
    } else if lower.contains("sdp") || lower.contains("description") {
        EndpointError::MalformedDescription(msg)
    } else {
        EndpointError::Transport(msg)
    }
}

/// Builds WebRTC endpoints sharing one API instance.
pub struct WebRtcFactory {
    api: webrtc::api::API,
    ice: IceConfig,
}

impl WebRtcFactory {
    pub fn new(ice: IceConfig) -> Result<Self, EndpointError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| EndpointError::Transport(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice
                .servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl EndpointFactory for WebRtcFactory {
    fn create(
        &self,
        role: PeerRole,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> EndpointFuture<'_, Arc<dyn PeerEndpoint>> {
        Box::pin(async move {
            let pc = Arc::new(
                self.api
                    .new_peer_connection(self.rtc_config())
                    .await
                    .map_err(classify)?,
            );

            {
                let events = events.clone();
                pc.on_peer_connection_state_change(Box::new(move |state| {
                    let events = events.clone();
                    Box::pin(async move {
                        let link = match state {
                            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                            RTCPeerConnectionState::Disconnected => {
                                Some(LinkState::Disconnected)
                            }
                            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                            _ => None,
                        };
                        if let Some(link) = link {
                            debug!(?link, "peer connection state changed");
                            let _ = events.send(EndpointEvent::StateChanged(link));
                        }
                    })
                }));
            }

            {
                let events = events.clone();
                pc.on_ice_candidate(Box::new(move |candidate| {
                    let events = events.clone();
                    Box::pin(async move {
                        let Some(candidate) = candidate else { return };
                        match candidate.to_json() {
                            Ok(init) => {
                                let _ = events.send(EndpointEvent::LocalCandidate(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                }));
                            }
                            Err(e) => warn!("failed to serialize local candidate: {e}"),
                        }
                    })
                }));
            }

            match role {
                PeerRole::Offerer => {
                    // Explicit ordered + fully reliable; the transfer
                    // protocol carries no sequence numbers.
                    let init = Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    });
                    let dc = pc
                        .create_data_channel(DATA_CHANNEL_LABEL, init)
                        .await
                        .map_err(classify)?;
                    wire_channel(dc, events.clone());
                }
                PeerRole::Answerer => {
                    let events = events.clone();
                    pc.on_data_channel(Box::new(move |dc| {
                        let events = events.clone();
                        Box::pin(async move {
                            if dc.label() != DATA_CHANNEL_LABEL {
                                warn!(label = %dc.label(), "unexpected data channel");
                            }
                            wire_channel(dc, events);
                        })
                    }));
                }
            }

            Ok(Arc::new(WebRtcEndpoint { pc }) as Arc<dyn PeerEndpoint>)
        })
    }
}

/// Attaches message and open handlers; announces the channel when open.
fn wire_channel(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<EndpointEvent>) {
    let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER);
    let rx_slot = Arc::new(StdMutex::new(Some(incoming_rx)));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            let payload = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => Payload::Text(text),
                    Err(_) => {
                        warn!("non-UTF-8 text frame, dropping");
                        return;
                    }
                }
            } else {
                Payload::Binary(msg.data)
            };
            if incoming_tx.send(payload).await.is_err() {
                debug!("incoming frame after receiver dropped");
            }
        })
    }));

    let dc_open = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        let dc = Arc::clone(&dc_open);
        let events = events.clone();
        let rx_slot = Arc::clone(&rx_slot);
        Box::pin(async move {
            // The slot empties on the first open; reopens are not a thing
            // for SCTP data channels.
            let Some(incoming) = rx_slot.lock().unwrap().take() else {
                return;
            };
            debug!(label = %dc.label(), "data channel open");
            let channel: Arc<dyn TransportChannel> = Arc::new(WebRtcChannel { dc });
            let _ = events.send(EndpointEvent::ChannelOpen { channel, incoming });
        })
    }));
}

/// [`TransportChannel`] over an open WebRTC data channel.
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl TransportChannel for WebRtcChannel {
    fn send(&self, payload: Payload) -> ChannelFuture<'_, ()> {
        Box::pin(async move {
            if self.dc.ready_state() != RTCDataChannelState::Open {
                return Err(ChannelError::NotOpen);
            }
            let result = match payload {
                Payload::Text(text) => self.dc.send_text(text).await,
                Payload::Binary(bytes) => self.dc.send(&bytes).await,
            };
            result
                .map(|_| ())
                .map_err(|e| ChannelError::Send(e.to_string()))
        })
    }

    fn buffered_amount(&self) -> ChannelFuture<'_, usize> {
        Box::pin(async move { Ok(self.dc.buffered_amount().await) })
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }
}

struct WebRtcEndpoint {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcEndpoint {
    fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, EndpointError> {
        let result = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        };
        result.map_err(|e| EndpointError::MalformedDescription(e.to_string()))
    }
}

impl PeerEndpoint for WebRtcEndpoint {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            // Provisional-answer states never occur in this protocol.
            _ => SignalingState::Stable,
        }
    }

    fn create_offer(&self) -> EndpointFuture<'_, SessionDescription> {
        Box::pin(async move {
            let offer = self.pc.create_offer(None).await.map_err(classify)?;
            Ok(SessionDescription::offer(offer.sdp))
        })
    }

    fn create_answer(&self) -> EndpointFuture<'_, SessionDescription> {
        Box::pin(async move {
            let answer = self.pc.create_answer(None).await.map_err(classify)?;
            Ok(SessionDescription::answer(answer.sdp))
        })
    }

    fn set_local_description(&self, desc: SessionDescription) -> EndpointFuture<'_, ()> {
        Box::pin(async move {
            let rtc = Self::to_rtc(&desc)?;
            self.pc.set_local_description(rtc).await.map_err(classify)
        })
    }

    fn set_remote_description(&self, desc: SessionDescription) -> EndpointFuture<'_, ()> {
        Box::pin(async move {
            let rtc = Self::to_rtc(&desc)?;
            self.pc.set_remote_description(rtc).await.map_err(classify)
        })
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> EndpointFuture<'_, ()> {
        Box::pin(async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            };
            self.pc.add_ice_candidate(init).await.map_err(classify)
        })
    }

    fn close(&self) -> EndpointFuture<'_, ()> {
        Box::pin(async move { self.pc.close().await.map_err(classify) })
    }
}
