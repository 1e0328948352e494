//! [`PeerFactory`] backed by `webrtc-rs`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::peer::{
    MediaPeer, NegotiationError, PeerConnectionState, PeerEvent, PeerEventSink, PeerFactory,
    RemoteTrack,
};
use crate::media::{LocalMedia, TrackKind};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn connect(
        &self,
        media: Option<LocalMedia>,
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaPeer>, NegotiationError> {
        let api = build_api()?;
        let pc = Arc::new(api.new_peer_connection(self.configuration()).await?);
        let negotiation = events.negotiation();

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(from_rtc_candidate(init)),
                        Err(err) => {
                            warn!(target = "stranger::negotiation::rtc", error = %err, "failed to serialize local candidate");
                            return;
                        }
                    },
                    None => None,
                };
                events.emit(PeerEvent::LocalCandidate(candidate));
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => {
                            debug!(target = "stranger::negotiation::rtc", "ignoring track of unspecified kind");
                            return;
                        }
                    };
                    events.emit(PeerEvent::RemoteTrack(RemoteTrack {
                        kind,
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                    }));
                    // Nothing renders the remote media; keep the receiver
                    // drained so the interceptors keep flowing.
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        trace!(target = "stranger::negotiation::rtc", %kind, "remote track ended");
                    });
                })
            },
        ));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(target = "stranger::negotiation::rtc", negotiation, ?state, "peer connection state changed");
                if let Some(state) = map_state(state) {
                    events.emit(PeerEvent::ConnectionState(state));
                }
            })
        }));

        if let Some(media) = media {
            for local in media.tracks() {
                let track: Arc<dyn TrackLocal + Send + Sync> = local.rtc_track();
                let rtp_sender = pc.add_track(track).await?;
                tokio::spawn(async move {
                    let mut rtcp_buf = vec![0u8; 1500];
                    while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
                });
            }
        }

        Ok(Arc::new(RtcPeer { pc }))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    async fn local_description(&self) -> Result<SessionDescription, NegotiationError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        from_rtc_description(local)
    }
}

#[async_trait]
impl MediaPeer for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(NegotiationError::InvalidDescription(other.to_string())),
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    Ok(match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    })
}
