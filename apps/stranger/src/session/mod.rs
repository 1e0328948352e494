//! Chat session lifecycle.
//!
//! A session is an actor task that exclusively owns the server channel, the
//! current pairing and its negotiation. Everything it reacts to (user
//! commands, inbound frames, negotiation completions and its two timers)
//! arrives through one `select!`, so no step ever observes another one half
//! done. Callers talk to it through a [`SessionHandle`] and watch it through
//! a stream of [`SessionEvent`]s.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::{ChatMode, Config};
use crate::media::{CaptureDevice, LocalMedia, TrackKind};
use crate::negotiation::peer::{PeerFactory, RemoteTrack};
use crate::negotiation::{
    Negotiation, NegotiationContext, NegotiationEvent, NegotiationId, NegotiationOutcome,
    NegotiationState,
};
use crate::protocol::{ClientMessage, ServerEvent, VideoSignal, decode_server_message};
use crate::store::{ScratchStore, save_interests};
use crate::transport::{ChannelEvent, ChannelSender, Connector};

pub mod typing;

use typing::TypingTimer;

pub const NOTICE_CONNECTED: &str = "Connected to server. Looking for a chat partner...";
pub const NOTICE_SEARCHING: &str = "Looking for a new chat partner...";
pub const NOTICE_DISCONNECTED: &str = "Disconnected from server";
pub const NOTICE_CONNECT_ERROR: &str = "Error connecting to server";
pub const NOTICE_MEDIA_ERROR: &str = "Error accessing camera or microphone. Please check permissions.";
const NOTICE_PARTNER_LEFT: &str = "Your chat partner has disconnected.";

pub const STATUS_WAITING: &str = "Waiting for someone to connect...";
pub const STATUS_CONNECTED: &str = "Connected to stranger";
pub const STATUS_PARTNER_LEFT: &str = "Stranger disconnected";
pub const STATUS_CONNECTION_LOST: &str = "Connection lost";
pub const STATUS_DISCONNECTED: &str = "Disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    AwaitingPartner,
    Paired,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    Sent(String),
    Received(String),
    Notice(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    State(SessionState),
    Transcript(TranscriptEntry),
    PartnerTyping(bool),
    /// Video mode status line for the remote side
    RemoteStatus(String),
    RemoteTrack(RemoteTrack),
    RemoteMediaCleared,
    Negotiation(NegotiationState),
    LocalMedia { video: bool, audio: bool },
    Online(u64),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session task has finished")]
    Finished,
}

/// The current partner. Exists only while `Paired`.
#[derive(Debug, Default)]
pub struct PartnerLink {
    negotiation: Option<Negotiation>,
}

impl PartnerLink {
    pub fn negotiation(&self) -> Option<&Negotiation> {
        self.negotiation.as_ref()
    }
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub peers: Arc<dyn PeerFactory>,
    pub capture: Arc<dyn CaptureDevice>,
    pub store: Arc<dyn ScratchStore>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: ChatMode,
    pub typing_idle: Duration,
    pub repair_delay: Duration,
    /// Typing indicators are propagated both ways
    pub typing_enabled: bool,
}

impl SessionConfig {
    pub fn new(mode: ChatMode) -> Self {
        Self::from(&Config {
            mode,
            ..Config::default()
        })
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            mode: config.mode,
            typing_idle: config.typing_idle,
            repair_delay: config.repair_delay,
            typing_enabled: config.mode == ChatMode::Video,
        }
    }
}

#[derive(Debug)]
enum Command {
    Start(Vec<String>),
    SendMessage(String),
    RequestNewPartner,
    UpdateInterests(Vec<String>),
    SetTyping(bool),
    Toggle(TrackKind),
    Leave,
}

/// Cheap, cloneable remote control for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    fn submit(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Finished)
    }

    pub fn start(&self, interests: Vec<String>) -> Result<(), SessionError> {
        self.submit(Command::Start(interests))
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.submit(Command::SendMessage(text.into()))
    }

    pub fn request_new_partner(&self) -> Result<(), SessionError> {
        self.submit(Command::RequestNewPartner)
    }

    pub fn update_interests(&self, interests: Vec<String>) -> Result<(), SessionError> {
        self.submit(Command::UpdateInterests(interests))
    }

    pub fn set_typing(&self, is_typing: bool) -> Result<(), SessionError> {
        self.submit(Command::SetTyping(is_typing))
    }

    pub fn toggle_video(&self) -> Result<(), SessionError> {
        self.submit(Command::Toggle(TrackKind::Video))
    }

    pub fn toggle_audio(&self) -> Result<(), SessionError> {
        self.submit(Command::Toggle(TrackKind::Audio))
    }

    pub fn leave(&self) -> Result<(), SessionError> {
        self.submit(Command::Leave)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&mut self, target: SessionState) -> Result<(), SessionError> {
        self.state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Finished)
    }
}

/// Spawns the session actor on the current runtime.
pub fn spawn(
    config: SessionConfig,
    deps: SessionDeps,
) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
    let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();

    let controller = SessionController {
        config,
        deps,
        state: SessionState::Disconnected,
        state_tx,
        events: event_tx,
        interests: Vec::new(),
        channel: None,
        channel_events: None,
        partner: None,
        typing: TypingTimer::default(),
        repair_at: None,
        media: None,
        media_failed: false,
        next_negotiation: 0,
        negotiation_tx,
    };
    tokio::spawn(controller.run(command_rx, negotiation_rx));

    (
        SessionHandle {
            commands: command_tx,
            state: state_rx,
        },
        event_rx,
    )
}

struct SessionController {
    config: SessionConfig,
    deps: SessionDeps,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    interests: Vec<String>,
    channel: Option<ChannelSender>,
    channel_events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    partner: Option<PartnerLink>,
    typing: TypingTimer,
    repair_at: Option<Instant>,
    media: Option<LocalMedia>,
    media_failed: bool,
    next_negotiation: NegotiationId,
    negotiation_tx: mpsc::UnboundedSender<NegotiationEvent>,
}

async fn next_channel_event(
    events: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>,
) -> ChannelEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(ChannelEvent::Closed),
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

impl SessionController {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut negotiation_events: mpsc::UnboundedReceiver<NegotiationEvent>,
    ) {
        loop {
            let typing_deadline = self.typing.deadline();
            let repair_at = self.repair_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave) | None => {
                        self.leave();
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                event = next_channel_event(&mut self.channel_events) => {
                    self.handle_channel_event(event);
                }
                Some(event) = negotiation_events.recv() => {
                    self.handle_negotiation_event(event);
                }
                _ = sleep_until_opt(typing_deadline) => {
                    if self.typing.expire(Instant::now()) && self.state == SessionState::Paired {
                        self.send(ClientMessage::Typing { is_typing: false });
                    }
                }
                _ = sleep_until_opt(repair_at) => {
                    self.repair_at = None;
                    if self.state == SessionState::AwaitingPartner {
                        debug!(target = "stranger::session", "re-pair delay elapsed");
                        self.request_new_partner();
                    }
                }
            }
        }
        debug!(target = "stranger::session", "session task finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(interests) => self.start(interests).await,
            Command::SendMessage(text) => self.send_message(&text),
            Command::RequestNewPartner => self.request_new_partner(),
            Command::UpdateInterests(interests) => self.update_interests(interests),
            Command::SetTyping(is_typing) => self.set_typing(is_typing),
            Command::Toggle(kind) => self.toggle(kind),
            Command::Leave => self.leave(),
        }
    }

    async fn start(&mut self, interests: Vec<String>) {
        if self.state == SessionState::Ended {
            debug!(target = "stranger::session", "start after leave ignored");
            return;
        }
        if self.channel.is_some() {
            debug!(target = "stranger::session", "restarting; closing previous channel");
            self.close_channel();
            self.set_state(SessionState::Disconnected);
        }
        self.interests = clean_interests(interests);

        if self.config.mode == ChatMode::Video && self.media.is_none() {
            if self.media_failed {
                self.notice(NOTICE_MEDIA_ERROR);
                return;
            }
            match self.deps.capture.acquire().await {
                Ok(media) => {
                    self.media = Some(media);
                    self.report_local_media();
                }
                Err(err) => {
                    warn!(target = "stranger::session", error = %err, "local media unavailable");
                    self.media_failed = true;
                    self.notice(NOTICE_MEDIA_ERROR);
                    return;
                }
            }
        }

        let channel = match self.deps.connector.open(self.config.mode).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(target = "stranger::session", error = %err, "failed to open channel");
                self.notice(NOTICE_CONNECT_ERROR);
                self.set_state(SessionState::Disconnected);
                return;
            }
        };
        self.channel = Some(channel.sender);
        self.channel_events = Some(channel.events);

        self.send(ClientMessage::Interests {
            interests: self.interests.clone(),
        });
        self.notice(NOTICE_CONNECTED);
        self.remote_status(STATUS_WAITING);
        self.set_state(SessionState::AwaitingPartner);
    }

    fn send_message(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() || self.state != SessionState::Paired {
            return;
        }
        self.send(ClientMessage::Message {
            message: text.to_string(),
        });
        self.emit(SessionEvent::Transcript(TranscriptEntry::Sent(
            text.to_string(),
        )));
        if self.typing.stop() {
            self.send(ClientMessage::Typing { is_typing: false });
        }
    }

    fn request_new_partner(&mut self) {
        if !matches!(
            self.state,
            SessionState::Paired | SessionState::AwaitingPartner
        ) || self.channel.is_none()
        {
            debug!(target = "stranger::session", state = ?self.state, "no channel to re-pair on");
            return;
        }
        self.repair_at = None;
        self.destroy_partner_link();
        self.send(ClientMessage::FindNew {
            interests: self.interests.clone(),
        });
        self.notice(NOTICE_SEARCHING);
        self.remote_status(STATUS_WAITING);
        self.set_state(SessionState::AwaitingPartner);
    }

    fn update_interests(&mut self, interests: Vec<String>) {
        self.interests = clean_interests(interests);
        if let Err(err) = save_interests(self.deps.store.as_ref(), &self.interests) {
            warn!(target = "stranger::session", error = %err, "failed to persist interests");
        }
        self.request_new_partner();
    }

    fn set_typing(&mut self, is_typing: bool) {
        if !self.config.typing_enabled || self.state != SessionState::Paired {
            return;
        }
        let send = if is_typing {
            self.typing
                .keystroke(Instant::now(), self.config.typing_idle)
        } else {
            self.typing.stop()
        };
        if send {
            self.send(ClientMessage::Typing { is_typing });
        }
    }

    fn toggle(&mut self, kind: TrackKind) {
        let Some(media) = self.media.as_ref().filter(|media| media.has(kind)) else {
            debug!(target = "stranger::session", %kind, "no local track to toggle");
            return;
        };
        media.toggle(kind);
        self.report_local_media();
    }

    fn leave(&mut self) {
        if self.state == SessionState::Ended {
            return;
        }
        self.close_channel();
        self.media = None;
        self.set_state(SessionState::Ended);
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Text(frame) => {
                if let Some(event) = decode_server_message(&frame) {
                    self.handle_server_event(event);
                }
            }
            ChannelEvent::Error(reason) => {
                warn!(target = "stranger::session", %reason, "channel error");
                self.notice(NOTICE_CONNECT_ERROR);
            }
            ChannelEvent::Closed => {
                info!(target = "stranger::session", "channel closed");
                self.channel = None;
                self.channel_events = None;
                self.reset_pairing();
                self.notice(NOTICE_DISCONNECTED);
                self.remote_status(STATUS_DISCONNECTED);
                self.set_state(SessionState::Disconnected);
            }
        }
    }

    fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::PartnerFound { notice } => {
                if let Some(text) = notice {
                    self.notice(&text);
                }
                if self.state == SessionState::Paired {
                    debug!(target = "stranger::session", "pairing replaced");
                    self.destroy_partner_link();
                }
                self.typing.clear();
                self.repair_at = None;
                self.partner = Some(PartnerLink::default());
                self.remote_status(STATUS_CONNECTED);
                self.set_state(SessionState::Paired);
            }
            ServerEvent::PartnerLeft { notice } => {
                self.notice(notice.as_deref().unwrap_or(NOTICE_PARTNER_LEFT));
                if self.state != SessionState::Paired {
                    return;
                }
                self.destroy_partner_link();
                self.remote_status(STATUS_PARTNER_LEFT);
                self.set_state(SessionState::AwaitingPartner);
                if self.config.mode == ChatMode::Video {
                    self.repair_at = Some(Instant::now() + self.config.repair_delay);
                }
            }
            ServerEvent::Notice(text) => self.notice(&text),
            ServerEvent::Message(text) => {
                if self.state != SessionState::Paired {
                    debug!(target = "stranger::session", "message outside a pairing dropped");
                    return;
                }
                self.emit(SessionEvent::Transcript(TranscriptEntry::Received(text)));
                self.emit(SessionEvent::PartnerTyping(false));
            }
            ServerEvent::Typing(is_typing) => {
                if self.config.typing_enabled && self.state == SessionState::Paired {
                    self.emit(SessionEvent::PartnerTyping(is_typing));
                }
            }
            ServerEvent::Signal(signal) => self.on_remote_signal(signal),
            ServerEvent::OffererDesignated => {
                if let Some(negotiation) = self.negotiation() {
                    let before = negotiation.state();
                    negotiation.on_designated_offerer();
                    let after = negotiation.state();
                    self.report_negotiation(before, after);
                }
            }
            ServerEvent::Online(count) => self.emit(SessionEvent::Online(count)),
        }
    }

    fn on_remote_signal(&mut self, signal: VideoSignal) {
        let kind = signal.kind();
        match self.negotiation() {
            Some(negotiation) => {
                let before = negotiation.state();
                negotiation.on_remote_signal(signal);
                let after = negotiation.state();
                self.report_negotiation(before, after);
            }
            None => {
                debug!(target = "stranger::session", kind, "signal without a video pairing ignored");
            }
        }
    }

    /// Negotiation of the current pairing, created on first use. `None`
    /// outside a video pairing.
    fn negotiation(&mut self) -> Option<&mut Negotiation> {
        if self.config.mode != ChatMode::Video || self.state != SessionState::Paired {
            return None;
        }
        let signals = self.channel.clone()?;
        let link = self.partner.as_mut()?;
        if link.negotiation.is_none() {
            self.next_negotiation += 1;
            let context = NegotiationContext {
                factory: Arc::clone(&self.deps.peers),
                media: self.media.clone(),
                events: self.negotiation_tx.clone(),
                signals,
            };
            link.negotiation = Some(Negotiation::new(self.next_negotiation, context));
        }
        link.negotiation.as_mut()
    }

    fn handle_negotiation_event(&mut self, event: NegotiationEvent) {
        let Some(negotiation) = self
            .partner
            .as_mut()
            .and_then(|link| link.negotiation.as_mut())
            .filter(|negotiation| negotiation.accepts(&event))
        else {
            debug!(target = "stranger::session", negotiation = event.negotiation, "stale negotiation event dropped");
            return;
        };
        let before = negotiation.state();
        let outcome = negotiation.handle_event(event.kind);
        let after = negotiation.state();
        self.report_negotiation(before, after);

        match outcome {
            Some(NegotiationOutcome::RemoteTrack(track)) => {
                self.remote_status(STATUS_CONNECTED);
                self.emit(SessionEvent::RemoteTrack(track));
            }
            Some(NegotiationOutcome::PeerConnected) => {
                debug!(target = "stranger::session", "media path established");
            }
            Some(NegotiationOutcome::ConnectionLost) => {
                self.remote_status(STATUS_CONNECTION_LOST);
                self.emit(SessionEvent::RemoteMediaCleared);
            }
            None => {}
        }
    }

    /// Drops the current pairing along with its negotiation and any
    /// pending typing burst.
    fn destroy_partner_link(&mut self) {
        self.typing.clear();
        let Some(link) = self.partner.take() else {
            return;
        };
        if let Some(mut negotiation) = link.negotiation {
            debug!(target = "stranger::session", negotiation = negotiation.id(), "tearing down negotiation");
            negotiation.teardown();
            self.emit(SessionEvent::Negotiation(NegotiationState::TornDown));
        }
        self.emit(SessionEvent::PartnerTyping(false));
        if self.config.mode == ChatMode::Video {
            self.emit(SessionEvent::RemoteMediaCleared);
        }
    }

    fn reset_pairing(&mut self) {
        self.destroy_partner_link();
        self.repair_at = None;
    }

    fn close_channel(&mut self) {
        self.reset_pairing();
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.channel_events = None;
    }

    fn send(&self, message: ClientMessage) {
        let Some(channel) = &self.channel else {
            debug!(target = "stranger::session", "no channel; envelope dropped");
            return;
        };
        if let Err(err) = channel.send(message) {
            debug!(target = "stranger::session", error = %err, "envelope not sent");
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        info!(target = "stranger::session", from = ?self.state, to = ?next, "session state");
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::State(next));
    }

    fn report_negotiation(&self, before: NegotiationState, after: NegotiationState) {
        if before != after {
            self.emit(SessionEvent::Negotiation(after));
        }
    }

    fn report_local_media(&self) {
        if let Some(media) = &self.media {
            self.emit(SessionEvent::LocalMedia {
                video: media.is_enabled(TrackKind::Video),
                audio: media.is_enabled(TrackKind::Audio),
            });
        }
    }

    fn notice(&self, text: &str) {
        self.emit(SessionEvent::Transcript(TranscriptEntry::Notice(
            text.to_string(),
        )));
    }

    fn remote_status(&self, text: &str) {
        if self.config.mode == ChatMode::Video {
            self.emit(SessionEvent::RemoteStatus(text.to_string()));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn clean_interests(interests: Vec<String>) -> Vec<String> {
    interests
        .into_iter()
        .map(|interest| interest.trim().to_string())
        .filter(|interest| !interest.is_empty())
        .collect()
}

#[cfg(test)]
mod tests;
