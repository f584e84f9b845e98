//! Offer/answer negotiation state machine.
//!
//! Guards against the classic glare cases: simultaneous offers from both
//! sides, duplicate offers, and answers arriving in the wrong state. A
//! broken endpoint is never patched in place; it is closed, and after a
//! short grace the factory builds a fresh one (recoverable failures retry
//! exactly once on the new endpoint).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use beamdrop_protocol::constants::{NEGOTIATION_COLLISION_WAIT, RECREATE_GRACE};

use crate::endpoint::{
    EndpointEvent, EndpointFactory, IceCandidate, PeerEndpoint, PeerRole, SessionDescription,
    SignalingState,
};
use crate::PeerError;

/// Clears an in-progress flag on every exit path.
struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self { flag })
        }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Drives one pairing's negotiation over replaceable endpoints.
pub struct Negotiator {
    factory: Arc<dyn EndpointFactory>,
    events: mpsc::UnboundedSender<EndpointEvent>,
    role: PeerRole,
    endpoint: Mutex<Option<Arc<dyn PeerEndpoint>>>,
    making_offer: AtomicBool,
    handling_offer: AtomicBool,
    /// Remote candidates queued until a remote description is applied.
    pending_candidates: StdMutex<VecDeque<IceCandidate>>,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl Negotiator {
    /// Builds a negotiator with its first endpoint.
    pub async fn new(
        factory: Arc<dyn EndpointFactory>,
        role: PeerRole,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EndpointEvent>), PeerError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let endpoint = factory.create(role, events.clone()).await?;
        Ok((
            Self {
                factory,
                events,
                role,
                endpoint: Mutex::new(Some(endpoint)),
                making_offer: AtomicBool::new(false),
                handling_offer: AtomicBool::new(false),
                pending_candidates: StdMutex::new(VecDeque::new()),
                remote_set: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            },
            events_rx,
        ))
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Creates and applies a local offer, recreating the endpoint first if
    /// its signaling state has drifted off stable.
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let _guard =
            FlagGuard::acquire(&self.making_offer).ok_or(PeerError::NegotiationBusy)?;

        let ep = self.endpoint().await?;
        let ep = if ep.signaling_state() == SignalingState::Stable {
            ep
        } else {
            debug!("signaling state not stable, recreating endpoint before offer");
            self.recreate_endpoint().await?
        };

        match self.offer_once(&ep).await {
            Err(PeerError::Endpoint(e)) if e.needs_recreate() => {
                warn!("offer failed ({e}), retrying once on a fresh endpoint");
                let ep = self.recreate_endpoint().await?;
                self.offer_once(&ep).await
            }
            other => other,
        }
    }

    /// Applies a remote offer and produces the local answer.
    ///
    /// On a glare collision (we are mid-offer ourselves) this waits briefly
    /// for our attempt to finish, then rejects so the tie-break winner's
    /// offer stands.
    pub async fn handle_offer(&self, sdp: String) -> Result<SessionDescription, PeerError> {
        let _guard =
            FlagGuard::acquire(&self.handling_offer).ok_or(PeerError::NegotiationBusy)?;

        if self.making_offer.load(Ordering::Acquire) {
            debug!("offer collision, waiting for local attempt to settle");
            tokio::time::sleep(NEGOTIATION_COLLISION_WAIT).await;
            if self.making_offer.load(Ordering::Acquire) {
                return Err(PeerError::NegotiationBusy);
            }
        }

        let offer = SessionDescription::offer(sdp);
        let ep = self.endpoint().await?;
        match self.answer_once(&ep, offer.clone()).await {
            Err(PeerError::Endpoint(e)) if e.needs_recreate() => {
                warn!("answering failed ({e}), retrying once on a fresh endpoint");
                let ep = self.recreate_endpoint().await?;
                self.answer_once(&ep, offer).await
            }
            other => other,
        }
    }

    /// Applies the remote answer to our outstanding offer. An answer in any
    /// other state is stale and ignored.
    pub async fn handle_answer(&self, sdp: String) -> Result<(), PeerError> {
        let ep = self.endpoint().await?;
        if ep.signaling_state() != SignalingState::HaveLocalOffer {
            warn!(
                state = ?ep.signaling_state(),
                "answer without an outstanding offer, ignoring"
            );
            return Ok(());
        }
        ep.set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.remote_set.store(true, Ordering::Release);
        self.drain_candidates(&ep).await;
        Ok(())
    }

    /// Adds a remote ICE candidate, queueing it if no remote description
    /// has been applied yet.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) {
        if !self.remote_set.load(Ordering::Acquire) {
            self.pending_candidates.lock().unwrap().push_back(candidate);
            return;
        }
        let Ok(ep) = self.endpoint().await else {
            return;
        };
        // Flush anything queued before this one to keep arrival order.
        self.drain_candidates(&ep).await;
        if let Err(e) = ep.add_ice_candidate(candidate).await {
            warn!("failed to add remote candidate: {e}");
        }
    }

    /// Tears down the current endpoint and builds a fresh one for the same
    /// role. Used by the session when the link reports failure.
    pub async fn reset(&self) -> Result<(), PeerError> {
        self.recreate_endpoint().await.map(|_| ())
    }

    /// Closes the negotiator and its endpoint. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut lock = self.endpoint.lock().await;
        if let Some(ep) = lock.take() {
            let _ = ep.close().await;
        }
        self.pending_candidates.lock().unwrap().clear();
    }

    async fn endpoint(&self) -> Result<Arc<dyn PeerEndpoint>, PeerError> {
        self.endpoint
            .lock()
            .await
            .clone()
            .ok_or(PeerError::Endpoint(crate::endpoint::EndpointError::Closed))
    }

    async fn recreate_endpoint(&self) -> Result<Arc<dyn PeerEndpoint>, PeerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PeerError::Endpoint(crate::endpoint::EndpointError::Closed));
        }
        let mut lock = self.endpoint.lock().await;
        if let Some(old) = lock.take() {
            let _ = old.close().await;
        }
        // Let the old transport's teardown settle before the replacement
        // starts gathering.
        tokio::time::sleep(RECREATE_GRACE).await;
        let ep = self.factory.create(self.role, self.events.clone()).await?;
        self.remote_set.store(false, Ordering::Release);
        self.pending_candidates.lock().unwrap().clear();
        *lock = Some(Arc::clone(&ep));
        Ok(ep)
    }

    async fn offer_once(
        &self,
        ep: &Arc<dyn PeerEndpoint>,
    ) -> Result<SessionDescription, PeerError> {
        let offer = ep.create_offer().await?;
        ep.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn answer_once(
        &self,
        ep: &Arc<dyn PeerEndpoint>,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        ep.set_remote_description(offer).await?;
        self.remote_set.store(true, Ordering::Release);
        self.drain_candidates(ep).await;
        let answer = ep.create_answer().await?;
        ep.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    async fn drain_candidates(&self, ep: &Arc<dyn PeerEndpoint>) {
        loop {
            let next = self.pending_candidates.lock().unwrap().pop_front();
            let Some(candidate) = next else { break };
            if let Err(e) = ep.add_ice_candidate(candidate).await {
                warn!("failed to add queued candidate: {e}");
            }
        }
    }
}
