//! Recording peer doubles for negotiation and session tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::peer::{MediaPeer, NegotiationError, PeerEvent, PeerEventSink, PeerFactory};
use crate::media::LocalMedia;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PeerCall {
    Connect { with_media: bool },
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<PeerCall>>,
    fail_remote: AtomicBool,
    serial: AtomicUsize,
}

impl Shared {
    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }
}

#[derive(Default)]
pub(crate) struct FakePeerFactory {
    shared: Arc<Shared>,
    sinks: Mutex<Vec<PeerEventSink>>,
}

impl FakePeerFactory {
    pub(crate) fn calls(&self) -> Vec<PeerCall> {
        self.shared.calls.lock().clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&PeerCall) -> bool) -> usize {
        self.shared.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Every later `set_remote_description` fails.
    pub(crate) fn fail_remote_description(&self) {
        self.shared.fail_remote.store(true, Ordering::SeqCst);
    }

    /// Raises a peer callback on the most recently created connection.
    pub(crate) fn emit(&self, event: PeerEvent) {
        if let Some(sink) = self.sinks.lock().last() {
            sink.emit(event);
        }
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn connect(
        &self,
        media: Option<LocalMedia>,
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaPeer>, NegotiationError> {
        self.shared.record(PeerCall::Connect {
            with_media: media.is_some(),
        });
        self.sinks.lock().push(events);
        Ok(Arc::new(FakePeer {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakePeer {
    shared: Arc<Shared>,
}

impl FakePeer {
    fn sdp(&self, label: &str) -> String {
        let serial = self.shared.serial.fetch_add(1, Ordering::SeqCst);
        format!("v=0\r\ns=fake-{label}-{serial}\r\n")
    }
}

#[async_trait]
impl MediaPeer for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.shared.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.shared.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.shared.record(PeerCall::SetRemote(description.kind));
        if self.shared.fail_remote.load(Ordering::SeqCst) {
            return Err(NegotiationError::Setup("rejected remote description".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.shared.record(PeerCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.shared.record(PeerCall::Close);
        Ok(())
    }
}
