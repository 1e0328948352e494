use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

use super::*;
use crate::media::{DeniedCapture, SyntheticCapture};
use crate::negotiation::testing::{FakePeerFactory, PeerCall};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::store::{INTERESTS_KEY, MemoryStore, ScratchStore};
use crate::transport::mock::{MemoryConnector, MemoryRemote};
use serde_json::json;

const FOUND: &str = "You've been connected to a stranger!";
const LEFT: &str = "Your chat partner has disconnected.";

struct Fixture {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    connector: Arc<MemoryConnector>,
    remotes: mpsc::UnboundedReceiver<MemoryRemote>,
    peers: Arc<FakePeerFactory>,
    store: Arc<MemoryStore>,
}

fn fixture(mode: ChatMode) -> Fixture {
    fixture_with_capture(mode, Arc::new(SyntheticCapture))
}

fn fixture_with_capture(mode: ChatMode, capture: Arc<dyn CaptureDevice>) -> Fixture {
    let (connector, remotes) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let peers = Arc::new(FakePeerFactory::default());
    let store = Arc::new(MemoryStore::default());
    let deps = SessionDeps {
        connector: connector.clone(),
        peers: peers.clone(),
        capture,
        store: store.clone(),
    };
    let (handle, events) = spawn(SessionConfig::new(mode), deps);
    Fixture {
        handle,
        events,
        connector,
        remotes,
        peers,
        store,
    }
}

/// Lets the actor and negotiation workers run until idle.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

impl Fixture {
    async fn start(&mut self, interests: &[&str]) -> MemoryRemote {
        self.handle
            .start(interests.iter().map(|s| s.to_string()).collect())
            .expect("start");
        let mut remote = self.remotes.recv().await.expect("channel opened");
        assert_eq!(
            remote.next_message().await,
            Some(ClientMessage::Interests {
                interests: interests.iter().map(|s| s.to_string()).collect()
            })
        );
        settle().await;
        remote
    }

    async fn pair(&mut self, interests: &[&str]) -> MemoryRemote {
        let remote = self.start(interests).await;
        remote.system(FOUND);
        settle().await;
        assert_eq!(self.handle.state(), SessionState::Paired);
        remote
    }

    fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn sent_all(remote: &mut MemoryRemote) -> Vec<ClientMessage> {
    let mut sent = Vec::new();
    while let Some(message) = remote.try_next_message() {
        sent.push(message);
    }
    sent
}

fn notice(text: &str) -> SessionEvent {
    SessionEvent::Transcript(TranscriptEntry::Notice(text.to_string()))
}

fn offer_signals(sent: &[ClientMessage]) -> usize {
    sent.iter()
        .filter(|message| {
            matches!(
                message,
                ClientMessage::VideoSignal {
                    signal: VideoSignal::Offer { .. }
                }
            )
        })
        .count()
}

#[tokio::test(start_paused = true)]
async fn text_session_pairs_and_waits_after_partner_leaves() {
    let mut fx = fixture(ChatMode::Text);
    let mut remote = fx.start(&["music", "films"]).await;
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);
    let events = fx.drain();
    assert!(events.contains(&notice(NOTICE_CONNECTED)));
    assert!(events.contains(&SessionEvent::State(SessionState::AwaitingPartner)));

    remote.system(FOUND);
    settle().await;
    assert_eq!(fx.handle.state(), SessionState::Paired);

    remote.push(&crate::protocol::ServerMessage::Message {
        message: "hello".into(),
    });
    remote.system(LEFT);
    settle().await;
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);
    let events = fx.drain();
    assert!(events.contains(&SessionEvent::Transcript(TranscriptEntry::Received(
        "hello".into()
    ))));
    assert!(events.contains(&notice(LEFT)));

    // Text mode never re-pairs on its own.
    sleep(Duration::from_secs(5)).await;
    assert!(sent_all(&mut remote).is_empty());
}

#[tokio::test(start_paused = true)]
async fn blank_messages_are_not_sent() {
    let mut fx = fixture(ChatMode::Text);
    let mut remote = fx.pair(&[]).await;

    fx.handle.send_message("").expect("send");
    fx.handle.send_message("   ").expect("send");
    fx.handle.send_message(" hi ").expect("send");
    settle().await;

    assert_eq!(
        sent_all(&mut remote),
        vec![ClientMessage::Message {
            message: "hi".into()
        }]
    );
    assert!(fx
        .drain()
        .contains(&SessionEvent::Transcript(TranscriptEntry::Sent("hi".into()))));
}

#[tokio::test(start_paused = true)]
async fn messages_are_dropped_when_not_paired() {
    let mut fx = fixture(ChatMode::Text);
    let mut remote = fx.start(&[]).await;
    fx.handle.send_message("anyone?").expect("send");
    settle().await;
    assert!(sent_all(&mut remote).is_empty());
}

#[tokio::test(start_paused = true)]
async fn video_partner_loss_tears_down_and_requeues_after_delay() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&["chess"]).await;

    remote.push_json(json!({"type": "webrtc-init"}));
    settle().await;
    let sent = sent_all(&mut remote);
    assert_eq!(offer_signals(&sent), 1);
    fx.drain();

    remote.system(LEFT);
    settle().await;
    let left_at = Instant::now();
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);
    let events = fx.drain();
    assert!(events.contains(&SessionEvent::Negotiation(NegotiationState::TornDown)));
    assert!(events.contains(&SessionEvent::RemoteMediaCleared));
    assert!(events.contains(&SessionEvent::RemoteStatus(STATUS_PARTNER_LEFT.into())));
    assert_eq!(fx.peers.count(|call| *call == PeerCall::Close), 1);

    assert_eq!(
        remote.next_message().await,
        Some(ClientMessage::FindNew {
            interests: vec!["chess".into()]
        })
    );
    let waited = Instant::now() - left_at;
    assert!(waited >= Duration::from_millis(1400) && waited <= Duration::from_millis(1600));
    assert!(fx.drain().contains(&notice(NOTICE_SEARCHING)));
}

#[tokio::test(start_paused = true)]
async fn repeated_offerer_designation_yields_one_offer() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&[]).await;

    remote.push_json(json!({"type": "webrtc-init"}));
    remote.push_json(json!({"type": "webrtc-init"}));
    settle().await;
    remote.push_json(json!({"type": "webrtc-init"}));
    settle().await;

    assert_eq!(offer_signals(&sent_all(&mut remote)), 1);
    assert_eq!(fx.peers.count(|call| *call == PeerCall::CreateOffer), 1);
    assert_eq!(
        fx.peers
            .count(|call| *call == PeerCall::Connect { with_media: true }),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn candidate_before_offer_is_applied_once_after_it() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&[]).await;

    let candidate = IceCandidate {
        candidate: "candidate:7 1 udp 1 198.51.100.7 9 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    remote.push(&crate::protocol::ServerMessage::VideoSignal {
        signal: VideoSignal::IceCandidate {
            candidate: candidate.clone(),
        },
    });
    settle().await;
    assert!(fx.peers.calls().is_empty());

    remote.push(&crate::protocol::ServerMessage::VideoSignal {
        signal: VideoSignal::Offer {
            sdp: SessionDescription::offer("v=0\r\n"),
        },
    });
    settle().await;

    let calls = fx.peers.calls();
    let remote_at = calls
        .iter()
        .position(|call| matches!(call, PeerCall::SetRemote(_)))
        .expect("offer applied");
    let applied: Vec<_> = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| **call == PeerCall::AddCandidate(candidate.candidate.clone()))
        .collect();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].0 > remote_at);

    let sent = sent_all(&mut remote);
    assert!(sent.iter().any(|message| matches!(
        message,
        ClientMessage::VideoSignal {
            signal: VideoSignal::Answer { .. }
        }
    )));
    assert!(fx
        .drain()
        .contains(&SessionEvent::Negotiation(NegotiationState::Connected)));
}

#[tokio::test(start_paused = true)]
async fn typing_burst_sends_one_start_and_one_stop() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&[]).await;
    let _ = sent_all(&mut remote);

    let began = Instant::now();
    for _ in 0..4 {
        fx.handle.set_typing(true).expect("typing");
        sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(
        sent_all(&mut remote),
        vec![ClientMessage::Typing { is_typing: true }]
    );

    assert_eq!(
        remote.next_message().await,
        Some(ClientMessage::Typing { is_typing: false })
    );
    let elapsed = Instant::now() - began;
    assert!(elapsed >= Duration::from_millis(2900) && elapsed <= Duration::from_millis(2901));
    sleep(Duration::from_secs(5)).await;
    assert!(sent_all(&mut remote).is_empty());
}

#[tokio::test(start_paused = true)]
async fn sending_a_message_ends_the_typing_burst() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&[]).await;
    let _ = sent_all(&mut remote);

    fx.handle.set_typing(true).expect("typing");
    fx.handle.send_message("done").expect("send");
    settle().await;
    sleep(Duration::from_secs(3)).await;

    assert_eq!(
        sent_all(&mut remote),
        vec![
            ClientMessage::Typing { is_typing: true },
            ClientMessage::Message {
                message: "done".into()
            },
            ClientMessage::Typing { is_typing: false },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn typing_restarts_cleanly_with_the_next_partner() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&[]).await;
    let _ = sent_all(&mut remote);

    fx.handle.set_typing(true).expect("typing");
    fx.handle.request_new_partner().expect("next");
    settle().await;
    assert_eq!(
        sent_all(&mut remote),
        vec![
            ClientMessage::Typing { is_typing: true },
            ClientMessage::FindNew {
                interests: Vec::new()
            },
        ]
    );

    remote.system("You've been connected to a new stranger!");
    settle().await;
    assert_eq!(fx.handle.state(), SessionState::Paired);
    fx.handle.set_typing(true).expect("typing");
    settle().await;
    assert_eq!(
        sent_all(&mut remote),
        vec![ClientMessage::Typing { is_typing: true }]
    );

    // only the new burst's stop, 2000 ms after its own keystroke
    sleep(Duration::from_secs(5)).await;
    assert_eq!(
        sent_all(&mut remote),
        vec![ClientMessage::Typing { is_typing: false }]
    );
}

#[tokio::test(start_paused = true)]
async fn partner_loss_silences_a_pending_typing_stop() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&[]).await;
    let _ = sent_all(&mut remote);

    fx.handle.set_typing(true).expect("typing");
    settle().await;
    remote.system(LEFT);
    settle().await;
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);

    sleep(Duration::from_secs(3)).await;
    let sent = sent_all(&mut remote);
    assert_eq!(sent.first(), Some(&ClientMessage::Typing { is_typing: true }));
    assert!(!sent.contains(&ClientMessage::Typing { is_typing: false }));
    assert!(sent.contains(&ClientMessage::FindNew {
        interests: Vec::new()
    }));
}

#[tokio::test(start_paused = true)]
async fn text_mode_does_not_propagate_typing() {
    let mut fx = fixture(ChatMode::Text);
    let mut remote = fx.pair(&[]).await;
    fx.handle.set_typing(true).expect("typing");
    remote.push_json(json!({"type": "typing", "isTyping": true}));
    settle().await;

    assert!(sent_all(&mut remote).is_empty());
    assert!(!fx
        .drain()
        .contains(&SessionEvent::PartnerTyping(true)));
}

#[tokio::test(start_paused = true)]
async fn channel_close_forces_disconnected_and_start_reconnects() {
    let mut fx = fixture(ChatMode::Video);
    let remote = fx.pair(&[]).await;
    remote.push_json(json!({"type": "webrtc-init"}));
    settle().await;
    fx.drain();

    remote.fail("reset by peer");
    settle().await;
    assert_eq!(fx.handle.state(), SessionState::Disconnected);
    let events = fx.drain();
    assert!(events.contains(&notice(NOTICE_CONNECT_ERROR)));
    assert!(events.contains(&notice(NOTICE_DISCONNECTED)));
    assert!(events.contains(&SessionEvent::RemoteStatus(STATUS_DISCONNECTED.into())));
    assert_eq!(fx.peers.count(|call| *call == PeerCall::Close), 1);

    // No automatic reconnection.
    sleep(Duration::from_secs(5)).await;
    assert!(fx.remotes.try_recv().is_err());

    let _again = fx.start(&[]).await;
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);
}

#[tokio::test(start_paused = true)]
async fn failed_connect_reports_error_and_stays_disconnected() {
    let mut fx = fixture(ChatMode::Text);
    fx.connector.fail_next("connection refused");
    fx.handle.start(Vec::new()).expect("start");
    settle().await;

    assert_eq!(fx.handle.state(), SessionState::Disconnected);
    assert!(fx.drain().contains(&notice(NOTICE_CONNECT_ERROR)));
}

#[tokio::test(start_paused = true)]
async fn denied_media_refuses_to_start() {
    let mut fx = fixture_with_capture(ChatMode::Video, Arc::new(DeniedCapture));
    fx.handle.start(Vec::new()).expect("start");
    fx.handle.start(Vec::new()).expect("start");
    settle().await;

    assert_eq!(fx.handle.state(), SessionState::Disconnected);
    assert!(fx.remotes.try_recv().is_err());
    let notices = fx
        .drain()
        .into_iter()
        .filter(|event| *event == notice(NOTICE_MEDIA_ERROR))
        .count();
    assert_eq!(notices, 2);
}

#[tokio::test(start_paused = true)]
async fn updating_interests_persists_and_requeues() {
    let mut fx = fixture(ChatMode::Text);
    let mut remote = fx.pair(&["old"]).await;

    fx.handle
        .update_interests(vec![" rust ".into(), "".into(), "go".into()])
        .expect("update");
    settle().await;

    assert_eq!(
        fx.store.get(INTERESTS_KEY).expect("get").as_deref(),
        Some("rust, go")
    );
    assert_eq!(
        sent_all(&mut remote),
        vec![ClientMessage::FindNew {
            interests: vec!["rust".into(), "go".into()]
        }]
    );
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);
}

#[tokio::test(start_paused = true)]
async fn stale_completion_from_previous_pairing_is_ignored() {
    let mut fx = fixture(ChatMode::Video);
    let mut remote = fx.pair(&[]).await;
    remote.push_json(json!({"type": "webrtc-init"}));
    settle().await;

    // A candidate gathered by the first connection after the pairing moved on.
    remote.system("You've been connected to a new stranger!");
    settle().await;
    let _ = sent_all(&mut remote);
    fx.peers.emit(crate::negotiation::peer::PeerEvent::LocalCandidate(Some(
        IceCandidate {
            candidate: "candidate:late".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        },
    )));
    settle().await;

    assert!(sent_all(&mut remote).is_empty());
    assert_eq!(fx.handle.state(), SessionState::Paired);
    assert_eq!(fx.peers.count(|call| *call == PeerCall::Close), 1);
}

#[tokio::test(start_paused = true)]
async fn toggles_report_track_flags() {
    let mut fx = fixture(ChatMode::Video);
    let _remote = fx.pair(&[]).await;
    assert!(fx.drain().contains(&SessionEvent::LocalMedia {
        video: true,
        audio: true
    }));

    fx.handle.toggle_video().expect("toggle");
    settle().await;
    assert_eq!(
        fx.drain().last(),
        Some(&SessionEvent::LocalMedia {
            video: false,
            audio: true
        })
    );
    fx.handle.toggle_audio().expect("toggle");
    settle().await;
    assert_eq!(
        fx.drain().last(),
        Some(&SessionEvent::LocalMedia {
            video: false,
            audio: false
        })
    );
}

#[tokio::test(start_paused = true)]
async fn leave_is_terminal() {
    let mut fx = fixture(ChatMode::Text);
    let mut remote = fx.pair(&[]).await;

    fx.handle.leave().expect("leave");
    fx.handle.wait_for_state(SessionState::Ended).await.expect("ended");
    settle().await;
    assert!(remote.client_closed());
    assert_eq!(fx.handle.start(Vec::new()), Err(SessionError::Finished));
}

#[tokio::test(start_paused = true)]
async fn restarting_replaces_the_open_channel() {
    let mut fx = fixture(ChatMode::Text);
    let mut first = fx.pair(&["a"]).await;

    let _second = fx.start(&["b"]).await;
    assert!(first.client_closed());
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);

    // Frames from the abandoned channel no longer reach the session.
    first.system(FOUND);
    settle().await;
    assert_eq!(fx.handle.state(), SessionState::AwaitingPartner);
}
