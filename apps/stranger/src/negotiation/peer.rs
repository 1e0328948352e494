use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::{NegotiationEvent, NegotiationEventKind, NegotiationId};
use crate::media::{LocalMedia, TrackKind};
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("peer connection has no local description")]
    MissingLocalDescription,
    #[error("unsupported session description: {0}")]
    InvalidDescription(String),
    #[error("{0}")]
    Setup(String),
}

/// Connection state as reported by the peer, independent of the media
/// stack behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_lost(self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected | PeerConnectionState::Failed
        )
    }
}

/// Identity of a track the remote side started sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub track_id: String,
    pub stream_id: String,
}

/// Unsolicited callbacks from a live peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// `None` marks the end of candidate gathering.
    LocalCandidate(Option<IceCandidate>),
    RemoteTrack(RemoteTrack),
    ConnectionState(PeerConnectionState),
}

/// Tags peer callbacks with the negotiation they belong to.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    negotiation: NegotiationId,
    tx: mpsc::UnboundedSender<NegotiationEvent>,
}

impl PeerEventSink {
    pub fn new(negotiation: NegotiationId, tx: mpsc::UnboundedSender<NegotiationEvent>) -> Self {
        Self { negotiation, tx }
    }

    pub fn negotiation(&self) -> NegotiationId {
        self.negotiation
    }

    /// Delivery is best effort; the session may already be gone.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send(NegotiationEvent {
            negotiation: self.negotiation,
            kind: NegotiationEventKind::Peer(event),
        });
    }
}

/// One peer connection. Calls are issued strictly one at a time by the
/// negotiation worker.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Creates an offer and applies it locally.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    /// Creates an answer and applies it locally.
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds peer connections with the local tracks already attached.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn connect(
        &self,
        media: Option<LocalMedia>,
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaPeer>, NegotiationError>;
}
