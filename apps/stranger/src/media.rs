//! Local capture for video sessions.
//!
//! Capture is acquired once per chat view and shared by every negotiation
//! of that view. Pairings only ever flip the per-track enabled flag; the
//! tracks themselves live until the session is left.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "stranger-local";
const OPUS_FRAME: Duration = Duration::from_millis(20);
/// One 20 ms Opus frame of silence.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("failed to write sample: {0}")]
    Write(#[from] webrtc::Error),
}

#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Shared handle on the acquired tracks. Clones refer to the same capture.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    tracks: Arc<Vec<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            tracks: Arc::new(tracks),
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|track| track.kind == kind)
    }

    /// All tracks of `kind` enabled. False when there are none.
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        let mut tracks = self.tracks.iter().filter(|track| track.kind == kind).peekable();
        tracks.peek().is_some() && tracks.all(LocalTrack::is_enabled)
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|track| track.kind == kind) {
            track.enabled.store(enabled, Ordering::Release);
        }
        debug!(target = "stranger::media", %kind, enabled, "local track toggled");
    }

    /// Flips `kind` and returns the new flag.
    pub fn toggle(&self, kind: TrackKind) -> bool {
        let enabled = !self.is_enabled(kind);
        self.set_enabled(kind, enabled);
        enabled
    }

    /// Feeds one encoded frame to every enabled track of `kind`. Disabled
    /// tracks swallow the frame so the remote side sees silence or a frozen
    /// picture, never a renegotiation.
    pub async fn write_sample(
        &self,
        kind: TrackKind,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), MediaError> {
        for track in self.tracks.iter().filter(|track| track.kind == kind) {
            if !track.is_enabled() {
                trace!(target = "stranger::media", %kind, "dropping sample for disabled track");
                continue;
            }
            track
                .track
                .write_sample(&Sample {
                    data: data.clone(),
                    duration,
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }
}

/// Source of local capture for video sessions.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, MediaError>;
}

/// Creates a VP8 video track and an Opus audio track with no device behind
/// them. The audio track is fed silence until the capture is dropped; the
/// video track stays blank.
#[derive(Debug, Clone, Default)]
pub struct SyntheticCapture;

#[async_trait]
impl CaptureDevice for SyntheticCapture {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_string(),
            STREAM_ID.to_string(),
        );
        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        );
        let media = LocalMedia::new(vec![
            LocalTrack::new(TrackKind::Video, Arc::new(video)),
            LocalTrack::new(TrackKind::Audio, Arc::new(audio)),
        ]);
        spawn_silence(&media);
        Ok(media)
    }
}

fn spawn_silence(media: &LocalMedia) {
    let tracks = Arc::downgrade(&media.tracks);
    tokio::spawn(async move {
        let mut ticker = interval(OPUS_FRAME);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(tracks) = tracks.upgrade() else {
                break;
            };
            let media = LocalMedia { tracks };
            if let Err(err) = media
                .write_sample(
                    TrackKind::Audio,
                    Bytes::from_static(OPUS_SILENCE),
                    OPUS_FRAME,
                )
                .await
            {
                debug!(target = "stranger::media", error = %err, "silence feed stopped");
                break;
            }
        }
        trace!(target = "stranger::media", "capture released");
    });
}

/// Capture that is never granted.
#[derive(Debug, Clone, Default)]
pub struct DeniedCapture;

#[async_trait]
impl CaptureDevice for DeniedCapture {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        Err(MediaError::PermissionDenied)
    }
}
