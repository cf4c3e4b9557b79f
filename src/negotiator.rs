//! Offer/answer negotiation driven by relay traffic.
//!
//! [PeerTransport] wraps a single [RTCPeerConnection] and turns its callback
//! surface into awaitable state. [Negotiator] sits above it and owns the
//! signaling state machine: which side offers, what a given inbound frame is
//! allowed to do in the current phase, and where early ICE candidates wait
//! until a remote description exists.

use crate::error::Error;
use crate::mux::{AttachedChannels, Multiplexer};
use crate::signaling::RelayFrame;
use arc_swap::ArcSwap;
use log::warn;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

/// Publicly reachable STUN used when the caller does not supply servers.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_owned()],
        ..Default::default()
    }]
}

/// One peer connection with awaitable connectivity and buffered inbound
/// channels.
pub struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
    status: TransportStatus,
    pending_remote: Mutex<Vec<RTCIceCandidateInit>>,
    incoming: Mutex<UnboundedReceiver<Arc<RTCDataChannel>>>,
}

impl PeerTransport {
    /// Builds the connection and wires its callbacks.
    ///
    /// Locally gathered ICE candidates go straight out through `out` as they
    /// appear; the remote side is expected to buffer them until it has a
    /// remote description.
    pub async fn connect(
        api: &API,
        config: RTCConfiguration,
        out: UnboundedSender<RelayFrame>,
    ) -> Result<Self, Error> {
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let status = TransportStatus::default();
        let (incoming_tx, incoming) = unbounded_channel();

        {
            let status = status.weak_ref();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                if let Some(status) = TransportStatus::upgrade(&status) {
                    match s {
                        RTCPeerConnectionState::Connected => status.set_ready(),
                        RTCPeerConnectionState::Failed => {
                            status.set_failed(webrtc::Error::ErrConnectionClosed.into())
                        }
                        RTCPeerConnectionState::Closed => status.set_closed(),
                        RTCPeerConnectionState::Disconnected => {}
                        RTCPeerConnectionState::Unspecified => {}
                        RTCPeerConnectionState::New => {}
                        RTCPeerConnectionState::Connecting => {}
                    }
                }
                Box::pin(async move {})
            }));
        }
        {
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = out.send(RelayFrame::candidate(init));
                        }
                        Err(cause) => warn!("could not serialize ICE candidate: {}", cause),
                    }
                } else {
                    // ICE gathering complete
                }
                Box::pin(async move {})
            }));
        }
        {
            let incoming_tx = incoming_tx.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let _ = incoming_tx.send(dc);
                Box::pin(async move {})
            }));
        }

        Ok(PeerTransport {
            pc,
            status,
            pending_remote: Mutex::new(Vec::new()),
            incoming: Mutex::new(incoming),
        })
    }

    /// Creates an outbound data channel with default reliability settings.
    pub async fn create_channel(&self, label: &str) -> Result<Arc<RTCDataChannel>, Error> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(dc)
    }

    /// Next data channel announced by the remote peer, `None` once the
    /// transport is gone.
    pub async fn incoming_channel(&self) -> Option<Arc<RTCDataChannel>> {
        let mut guard = self.incoming.lock().await;
        guard.recv().await
    }

    /// Produces the local offer and installs it as the local description.
    pub async fn offer(&self) -> Result<RTCSessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Produces the local answer and installs it as the local description.
    pub async fn answer(&self) -> Result<RTCSessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Installs the remote description and flushes candidates that arrived
    /// ahead of it, in arrival order. A candidate the ICE agent rejects is
    /// logged and skipped; one bad candidate must not sink the negotiation.
    pub async fn apply_remote_description(
        &self,
        sdp: RTCSessionDescription,
    ) -> Result<(), Error> {
        self.pc.set_remote_description(sdp).await?;
        let mut pending = self.pending_remote.lock().await;
        for candidate in pending.drain(..) {
            if let Err(cause) = self.pc.add_ice_candidate(candidate).await {
                warn!("discarding ICE candidate: {}", cause);
            }
        }
        Ok(())
    }

    /// Applies `candidate` right away when a remote description exists,
    /// otherwise parks it until [PeerTransport::apply_remote_description].
    pub async fn queue_or_apply_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), Error> {
        if self.pc.remote_description().await.is_some() {
            self.pc.add_ice_candidate(candidate).await?;
        } else {
            let mut pending = self.pending_remote.lock().await;
            pending.push(candidate);
        }
        Ok(())
    }

    /// Awaits the ICE layer reaching the connected state.
    pub async fn connected(&self) -> Result<(), Error> {
        loop {
            let phase = self.status.get();
            match &*phase {
                TransportPhase::Connecting(ready) => ready.notified().await,
                TransportPhase::Ready => return Ok(()),
                TransportPhase::Closed(cause) => {
                    return match cause {
                        Some(e) => Err(e.clone()),
                        None => Ok(()),
                    }
                }
            }
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.status.set_closed();
        self.pc.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("status", &*self.status.get())
            .finish()
    }
}

#[derive(Debug)]
enum TransportPhase {
    Connecting(Notify),
    Ready,
    Closed(Option<Error>),
}

#[repr(transparent)]
#[derive(Debug, Clone)]
struct TransportStatus(Arc<ArcSwap<TransportPhase>>);

impl TransportStatus {
    fn get(&self) -> Arc<TransportPhase> {
        self.0.load_full()
    }

    fn weak_ref(&self) -> Weak<ArcSwap<TransportPhase>> {
        Arc::downgrade(&self.0)
    }

    fn upgrade(w: &Weak<ArcSwap<TransportPhase>>) -> Option<Self> {
        let arc = w.upgrade()?;
        Some(TransportStatus(arc))
    }

    fn set_ready(&self) {
        self.update(Arc::new(TransportPhase::Ready));
    }

    fn set_closed(&self) {
        self.update(Arc::new(TransportPhase::Closed(None)));
    }

    fn set_failed(&self, cause: Error) {
        self.update(Arc::new(TransportPhase::Closed(Some(cause))));
    }

    // closed is terminal; late callbacks must not resurrect the transport
    fn update(&self, new_phase: Arc<TransportPhase>) {
        let old = self.0.rcu(move |old| {
            if matches!(&**old, TransportPhase::Closed(_)) {
                old.clone()
            } else {
                new_phase.clone()
            }
        });
        if let TransportPhase::Connecting(ready) = &*old {
            ready.notify_waiters();
        }
    }
}

impl Default for TransportStatus {
    fn default() -> Self {
        TransportStatus(Arc::new(ArcSwap::from_pointee(TransportPhase::Connecting(
            Notify::new(),
        ))))
    }
}

/// Phase of the local signaling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    /// No descriptions exchanged yet.
    New,
    /// Offer sent, answer outstanding.
    HaveLocalOffer,
    /// Descriptions exchanged in both directions.
    Stable,
    Closed,
}

/// Signaling state machine of one session.
///
/// Exactly one [PeerTransport] exists per negotiator; repeated offers from a
/// confused peer reuse it rather than piling up connections.
pub struct Negotiator {
    api: API,
    config: RTCConfiguration,
    out: UnboundedSender<RelayFrame>,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
    transport: Option<Arc<PeerTransport>>,
    phase: SignalingPhase,
    /// Candidates that beat the first remote description to the relay.
    early_candidates: Vec<RTCIceCandidateInit>,
}

impl Negotiator {
    pub fn new(
        out: UnboundedSender<RelayFrame>,
        tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<Self, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Negotiator {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
            out,
            tracks,
            transport: None,
            phase: SignalingPhase::New,
            early_candidates: Vec::new(),
        })
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn transport(&self) -> Option<&Arc<PeerTransport>> {
        self.transport.as_ref()
    }

    /// Handle to the outbound relay queue this negotiator writes to.
    pub fn relay_out(&self) -> UnboundedSender<RelayFrame> {
        self.out.clone()
    }

    async fn ensure_transport(&mut self) -> Result<Arc<PeerTransport>, Error> {
        if let Some(transport) = &self.transport {
            return Ok(transport.clone());
        }
        let transport = Arc::new(
            PeerTransport::connect(&self.api, self.config.clone(), self.out.clone()).await?,
        );
        for track in &self.tracks {
            transport.pc.add_track(track.clone()).await?;
        }
        for candidate in self.early_candidates.drain(..) {
            transport.queue_or_apply_candidate(candidate).await?;
        }
        self.transport = Some(transport.clone());
        Ok(transport)
    }

    /// Offering side: creates the channels, produces the offer and sends it.
    ///
    /// The channels must exist before the offer so their announcement rides
    /// in it. Returns `None` without side effects when the phase does not
    /// allow a fresh offer.
    pub async fn initiate(&mut self, mux: &Multiplexer) -> Result<Option<AttachedChannels>, Error> {
        if self.phase != SignalingPhase::New {
            warn!("initiate in phase {:?} ignored", self.phase);
            return Ok(None);
        }
        let transport = self.ensure_transport().await?;
        let channels = mux.attach_initiator(&transport).await?;
        let offer = transport.offer().await?;
        let _ = self.out.send(RelayFrame::offer(offer));
        self.phase = SignalingPhase::HaveLocalOffer;
        Ok(Some(channels))
    }

    /// Answering side: applies the remote offer and replies with an answer.
    ///
    /// Returns the transport so the caller can start collecting the
    /// peer-announced channels, or `None` when the offer arrived in a phase
    /// that cannot accept one.
    pub async fn accept_offer(
        &mut self,
        offer: RTCSessionDescription,
    ) -> Result<Option<Arc<PeerTransport>>, Error> {
        if self.phase != SignalingPhase::New {
            warn!("remote offer in phase {:?} ignored", self.phase);
            return Ok(None);
        }
        let transport = self.ensure_transport().await?;
        transport.apply_remote_description(offer).await?;
        let answer = transport.answer().await?;
        let _ = self.out.send(RelayFrame::answer(answer));
        self.phase = SignalingPhase::Stable;
        Ok(Some(transport))
    }

    /// Completes the exchange on the offering side.
    pub async fn accept_answer(&mut self, answer: RTCSessionDescription) -> Result<(), Error> {
        let Some(transport) = &self.transport else {
            return Err(Error::NoPendingOffer);
        };
        if self.phase != SignalingPhase::HaveLocalOffer {
            warn!("remote answer in phase {:?} ignored", self.phase);
            return Ok(());
        }
        transport.apply_remote_description(answer).await?;
        self.phase = SignalingPhase::Stable;
        Ok(())
    }

    /// Routes one remote candidate, buffering it when no transport exists
    /// yet. Candidate order is preserved end to end.
    pub async fn accept_remote_candidate(
        &mut self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), Error> {
        match &self.transport {
            Some(transport) => transport.queue_or_apply_candidate(candidate).await,
            None => {
                self.early_candidates.push(candidate);
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.phase = SignalingPhase::Closed;
        if let Some(transport) = self.transport.take() {
            transport.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("phase", &self.phase)
            .field("early_candidates", &self.early_candidates.len())
            .finish()
    }
}
