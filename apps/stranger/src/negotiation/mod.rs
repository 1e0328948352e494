//! Media negotiation for one pairing.
//!
//! A [`Negotiation`] is created when the first negotiation signal of a
//! pairing arrives and torn down when the pairing ends. It never touches the
//! peer connection directly: every step is handed to a serial worker task
//! and comes back as a [`NegotiationEvent`] tagged with the negotiation id,
//! so a completion that outlives its pairing can be recognised and dropped.
//!
//! The server designates exactly one offerer per pairing (`webrtc-init`);
//! the other side only ever answers. There is no glare handling.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::LocalMedia;
use crate::protocol::{ClientMessage, IceCandidate, SdpKind, SessionDescription, VideoSignal};
use crate::transport::ChannelSender;

pub mod peer;
pub mod rtc;
#[cfg(test)]
pub(crate) mod testing;
mod worker;

use peer::{PeerEvent, PeerFactory, RemoteTrack};
use worker::{PeerOp, WorkerHandle};

pub type NegotiationId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationEvent {
    pub negotiation: NegotiationId,
    pub kind: NegotiationEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEventKind {
    /// Local offer or answer created and applied
    LocalDescription(SessionDescription),
    RemoteDescriptionApplied,
    /// A step failed; the worker skips everything after it
    Failed(String),
    Peer(PeerEvent),
    /// Worker finished and the peer connection is released
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Connected,
    TornDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unassigned,
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteDescription {
    Absent,
    Pending,
    Applied,
}

/// What a negotiation event means for the owning session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    RemoteTrack(RemoteTrack),
    PeerConnected,
    ConnectionLost,
}

/// Everything a negotiation borrows from its session.
#[derive(Clone)]
pub struct NegotiationContext {
    pub factory: Arc<dyn PeerFactory>,
    pub media: Option<LocalMedia>,
    pub events: mpsc::UnboundedSender<NegotiationEvent>,
    pub signals: ChannelSender,
}

pub struct Negotiation {
    id: NegotiationId,
    state: NegotiationState,
    role: Role,
    remote: RemoteDescription,
    pending_candidates: VecDeque<IceCandidate>,
    stalled: bool,
    worker: WorkerHandle,
    signals: ChannelSender,
}

impl Negotiation {
    pub fn new(id: NegotiationId, context: NegotiationContext) -> Self {
        let worker = worker::spawn(id, context.factory, context.media, context.events);
        Self {
            id,
            state: NegotiationState::Idle,
            role: Role::Unassigned,
            remote: RemoteDescription::Absent,
            pending_candidates: VecDeque::new(),
            stalled: false,
            worker,
            signals: context.signals,
        }
    }

    pub fn id(&self) -> NegotiationId {
        self.id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// True while events for this negotiation still matter.
    pub fn accepts(&self, event: &NegotiationEvent) -> bool {
        event.negotiation == self.id && self.state != NegotiationState::TornDown
    }

    /// Server picked this side to offer. Only honoured once, from `Idle`.
    pub fn on_designated_offerer(&mut self) {
        if self.state != NegotiationState::Idle || self.stalled {
            debug!(target = "stranger::negotiation", negotiation = self.id, state = ?self.state, "ignoring repeated offerer designation");
            return;
        }
        self.role = Role::Offerer;
        self.transition(NegotiationState::Offering);
        self.worker.submit(PeerOp::Offer);
    }

    pub fn on_remote_signal(&mut self, signal: VideoSignal) {
        if self.stalled || self.state == NegotiationState::TornDown {
            debug!(target = "stranger::negotiation", negotiation = self.id, kind = signal.kind(), "ignoring signal on inactive negotiation");
            return;
        }
        match signal {
            VideoSignal::Offer { sdp } => {
                if self.state != NegotiationState::Idle {
                    debug!(target = "stranger::negotiation", negotiation = self.id, state = ?self.state, "ignoring offer outside idle");
                    return;
                }
                if !self.check_kind(&sdp, SdpKind::Offer) {
                    return;
                }
                self.role = Role::Answerer;
                self.remote = RemoteDescription::Pending;
                self.transition(NegotiationState::Answering);
                self.worker.submit(PeerOp::AcceptOffer(sdp));
            }
            VideoSignal::Answer { sdp } => {
                if self.state != NegotiationState::Offering
                    || self.remote != RemoteDescription::Absent
                {
                    debug!(target = "stranger::negotiation", negotiation = self.id, state = ?self.state, "ignoring unexpected answer");
                    return;
                }
                if !self.check_kind(&sdp, SdpKind::Answer) {
                    return;
                }
                self.remote = RemoteDescription::Pending;
                self.worker.submit(PeerOp::AcceptAnswer(sdp));
            }
            VideoSignal::IceCandidate { candidate } => {
                if self.remote == RemoteDescription::Applied {
                    self.worker.submit(PeerOp::AddCandidate(candidate));
                } else {
                    self.pending_candidates.push_back(candidate);
                }
            }
        }
    }

    /// Forwards a locally gathered candidate. `None` marks the end of
    /// gathering and is not sent.
    pub fn on_local_ice_candidate(&mut self, candidate: Option<IceCandidate>) {
        match candidate {
            Some(candidate) => self.signal(VideoSignal::IceCandidate { candidate }),
            None => debug!(target = "stranger::negotiation", negotiation = self.id, "local candidate gathering complete"),
        }
    }

    /// Applies one completion or peer callback. The caller has already
    /// checked [`Negotiation::accepts`].
    pub fn handle_event(&mut self, kind: NegotiationEventKind) -> Option<NegotiationOutcome> {
        if self.state == NegotiationState::TornDown {
            return None;
        }
        match kind {
            NegotiationEventKind::LocalDescription(description) => {
                match (self.state, description.kind) {
                    (NegotiationState::Offering, SdpKind::Offer) => {
                        self.signal(VideoSignal::Offer { sdp: description });
                    }
                    (NegotiationState::Answering, SdpKind::Answer) => {
                        self.signal(VideoSignal::Answer { sdp: description });
                        self.transition(NegotiationState::Connected);
                    }
                    (state, kind) => {
                        debug!(target = "stranger::negotiation", negotiation = self.id, ?state, ?kind, "dropping local description");
                    }
                }
                None
            }
            NegotiationEventKind::RemoteDescriptionApplied => {
                self.remote = RemoteDescription::Applied;
                self.flush_pending_candidates();
                if self.state == NegotiationState::Offering {
                    self.transition(NegotiationState::Connected);
                }
                None
            }
            NegotiationEventKind::Failed(reason) => {
                debug!(target = "stranger::negotiation", negotiation = self.id, %reason, "negotiation stalled");
                self.stalled = true;
                self.pending_candidates.clear();
                None
            }
            NegotiationEventKind::Peer(PeerEvent::LocalCandidate(candidate)) => {
                if !self.stalled {
                    self.on_local_ice_candidate(candidate);
                }
                None
            }
            NegotiationEventKind::Peer(PeerEvent::RemoteTrack(track)) => {
                Some(NegotiationOutcome::RemoteTrack(track))
            }
            NegotiationEventKind::Peer(PeerEvent::ConnectionState(state)) => {
                debug!(target = "stranger::negotiation", negotiation = self.id, ?state, "peer connection state");
                if state.is_lost() {
                    Some(NegotiationOutcome::ConnectionLost)
                } else if state == peer::PeerConnectionState::Connected {
                    Some(NegotiationOutcome::PeerConnected)
                } else {
                    None
                }
            }
            NegotiationEventKind::Closed => {
                debug!(target = "stranger::negotiation", negotiation = self.id, "worker closed");
                None
            }
        }
    }

    /// Releases the peer connection. Safe to call any number of times.
    pub fn teardown(&mut self) {
        if self.state == NegotiationState::TornDown {
            return;
        }
        self.pending_candidates.clear();
        self.transition(NegotiationState::TornDown);
        self.worker.submit(PeerOp::Close);
    }

    fn flush_pending_candidates(&mut self) {
        if !self.pending_candidates.is_empty() {
            debug!(target = "stranger::negotiation", negotiation = self.id, count = self.pending_candidates.len(), "applying buffered candidates");
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.worker.submit(PeerOp::AddCandidate(candidate));
        }
    }

    fn check_kind(&mut self, description: &SessionDescription, expected: SdpKind) -> bool {
        if description.kind == expected {
            return true;
        }
        warn!(target = "stranger::negotiation", negotiation = self.id, ?expected, actual = ?description.kind, "mislabelled session description");
        self.stalled = true;
        self.pending_candidates.clear();
        false
    }

    fn signal(&self, signal: VideoSignal) {
        if let Err(err) = self.signals.send(ClientMessage::VideoSignal { signal }) {
            debug!(target = "stranger::negotiation", negotiation = self.id, error = %err, "signal not sent");
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        info!(target = "stranger::negotiation", negotiation = self.id, from = ?self.state, to = ?next, "negotiation state");
        self.state = next;
    }
}

impl std::fmt::Debug for Negotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiation")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("stalled", &self.stalled)
            .finish()
    }
}
