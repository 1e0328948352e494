//! Wire envelopes exchanged with the matchmaking server.
//!
//! Every frame is a JSON object tagged by `type`. Outbound frames are
//! [`ClientMessage`]s; inbound frames decode into [`ServerMessage`] and are
//! then lifted into typed [`ServerEvent`]s so the session never has to look
//! at free text to drive its state.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Session description carried inside offer/answer signals, shaped like the
/// browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum VideoSignal {
    Offer { sdp: SessionDescription },
    Answer { sdp: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

impl VideoSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            VideoSignal::Offer { .. } => "offer",
            VideoSignal::Answer { .. } => "answer",
            VideoSignal::IceCandidate { .. } => "ice-candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Interests {
        interests: Vec<String>,
    },
    FindNew {
        interests: Vec<String>,
    },
    Message {
        message: String,
    },
    Typing {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    VideoSignal {
        signal: VideoSignal,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    System {
        message: String,
    },
    Message {
        message: String,
    },
    Typing {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    VideoSignal {
        signal: VideoSignal,
    },
    WebrtcInit,
    Online {
        count: u64,
    },
    PartnerFound {
        #[serde(default)]
        message: Option<String>,
    },
    PartnerLeft {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Typed inbound event. `notice` fields carry display text only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    PartnerFound { notice: Option<String> },
    PartnerLeft { notice: Option<String> },
    Notice(String),
    Message(String),
    Typing(bool),
    Signal(VideoSignal),
    OffererDesignated,
    Online(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemNotice {
    PartnerFound,
    PartnerLeft,
    Info,
}

const PARTNER_FOUND_MARKERS: [&str; 2] = ["connected to a stranger", "connected to a new stranger"];
const PARTNER_LEFT_MARKER: &str = "disconnected";

/// Legacy servers only announce pairing changes inside `system` text.
pub fn classify_system_text(text: &str) -> SystemNotice {
    let lowered = text.to_lowercase();
    if PARTNER_FOUND_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        SystemNotice::PartnerFound
    } else if lowered.contains(PARTNER_LEFT_MARKER) {
        SystemNotice::PartnerLeft
    } else {
        SystemNotice::Info
    }
}

impl From<ServerMessage> for ServerEvent {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::System { message } => match classify_system_text(&message) {
                SystemNotice::PartnerFound => ServerEvent::PartnerFound {
                    notice: Some(message),
                },
                SystemNotice::PartnerLeft => ServerEvent::PartnerLeft {
                    notice: Some(message),
                },
                SystemNotice::Info => ServerEvent::Notice(message),
            },
            ServerMessage::Message { message } => ServerEvent::Message(message),
            ServerMessage::Typing { is_typing } => ServerEvent::Typing(is_typing),
            ServerMessage::VideoSignal { signal } => ServerEvent::Signal(signal),
            ServerMessage::WebrtcInit => ServerEvent::OffererDesignated,
            ServerMessage::Online { count } => ServerEvent::Online(count),
            ServerMessage::PartnerFound { message } => ServerEvent::PartnerFound { notice: message },
            ServerMessage::PartnerLeft { message } => ServerEvent::PartnerLeft { notice: message },
        }
    }
}

pub fn encode_client_message(message: &ClientMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decodes one inbound frame. Unknown `type`s and malformed frames yield
/// `None`; newer servers may send kinds this client does not know.
pub fn decode_server_message(text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => Some(message.into()),
        Err(err) => {
            debug!(target = "stranger::protocol", error = %err, frame_len = text.len(), "ignoring inbound frame");
            None
        }
    }
}
