use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::peer::{MediaPeer, NegotiationError, PeerEventSink, PeerFactory};
use super::{NegotiationEvent, NegotiationEventKind, NegotiationId};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug)]
pub(crate) enum PeerOp {
    Offer,
    AcceptOffer(SessionDescription),
    AcceptAnswer(SessionDescription),
    AddCandidate(IceCandidate),
    Close,
}

impl PeerOp {
    fn name(&self) -> &'static str {
        match self {
            PeerOp::Offer => "offer",
            PeerOp::AcceptOffer(_) => "accept_offer",
            PeerOp::AcceptAnswer(_) => "accept_answer",
            PeerOp::AddCandidate(_) => "add_candidate",
            PeerOp::Close => "close",
        }
    }
}

/// Submission side of a negotiation worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    ops: mpsc::UnboundedSender<PeerOp>,
}

impl WorkerHandle {
    pub(crate) fn submit(&self, op: PeerOp) {
        if self.ops.send(op).is_err() {
            debug!(target = "stranger::negotiation", "worker already finished");
        }
    }
}

pub(crate) fn spawn(
    negotiation: NegotiationId,
    factory: Arc<dyn PeerFactory>,
    media: Option<LocalMedia>,
    events: mpsc::UnboundedSender<NegotiationEvent>,
) -> WorkerHandle {
    let (ops, rx) = mpsc::unbounded_channel();
    let worker = Worker {
        negotiation,
        factory,
        media,
        events,
        peer: None,
        failed: false,
    };
    tokio::spawn(worker.run(rx));
    WorkerHandle { ops }
}

struct Worker {
    negotiation: NegotiationId,
    factory: Arc<dyn PeerFactory>,
    media: Option<LocalMedia>,
    events: mpsc::UnboundedSender<NegotiationEvent>,
    peer: Option<Arc<dyn MediaPeer>>,
    failed: bool,
}

impl Worker {
    async fn run(mut self, mut ops: mpsc::UnboundedReceiver<PeerOp>) {
        while let Some(op) = ops.recv().await {
            if matches!(op, PeerOp::Close) {
                break;
            }
            if self.failed {
                trace!(
                    target = "stranger::negotiation",
                    negotiation = self.negotiation,
                    op = op.name(),
                    "skipping op on stalled negotiation"
                );
                continue;
            }
            let name = op.name();
            if let Err(err) = self.apply(op).await {
                warn!(
                    target = "stranger::negotiation",
                    negotiation = self.negotiation,
                    op = name,
                    error = %err,
                    "negotiation step failed"
                );
                self.failed = true;
                self.emit(NegotiationEventKind::Failed(err.to_string()));
            }
        }

        // Reached on Close or when the owner went away; either way the
        // connection is released here and nowhere else.
        if let Some(peer) = self.peer.take() {
            if let Err(err) = peer.close().await {
                debug!(target = "stranger::negotiation", negotiation = self.negotiation, error = %err, "peer close failed");
            }
        }
        self.emit(NegotiationEventKind::Closed);
    }

    async fn apply(&mut self, op: PeerOp) -> Result<(), NegotiationError> {
        match op {
            PeerOp::Offer => {
                let peer = self.peer().await?;
                let offer = peer.create_offer().await?;
                self.emit(NegotiationEventKind::LocalDescription(offer));
            }
            PeerOp::AcceptOffer(offer) => {
                let peer = self.peer().await?;
                peer.set_remote_description(offer).await?;
                self.emit(NegotiationEventKind::RemoteDescriptionApplied);
                let answer = peer.create_answer().await?;
                self.emit(NegotiationEventKind::LocalDescription(answer));
            }
            PeerOp::AcceptAnswer(answer) => {
                let peer = self.existing_peer()?;
                peer.set_remote_description(answer).await?;
                self.emit(NegotiationEventKind::RemoteDescriptionApplied);
            }
            PeerOp::AddCandidate(candidate) => {
                self.existing_peer()?.add_ice_candidate(candidate).await?;
            }
            PeerOp::Close => {}
        }
        Ok(())
    }

    /// The connection is created on first use.
    async fn peer(&mut self) -> Result<Arc<dyn MediaPeer>, NegotiationError> {
        if let Some(peer) = &self.peer {
            return Ok(Arc::clone(peer));
        }
        let sink = PeerEventSink::new(self.negotiation, self.events.clone());
        let peer = self.factory.connect(self.media.clone(), sink).await?;
        debug!(target = "stranger::negotiation", negotiation = self.negotiation, "peer connection created");
        self.peer = Some(Arc::clone(&peer));
        Ok(peer)
    }

    fn existing_peer(&self) -> Result<Arc<dyn MediaPeer>, NegotiationError> {
        self.peer
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| NegotiationError::Setup("no peer connection yet".into()))
    }

    fn emit(&self, kind: NegotiationEventKind) {
        let _ = self.events.send(NegotiationEvent {
            negotiation: self.negotiation,
            kind,
        });
    }
}
