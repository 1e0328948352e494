//! In-process channel used by tests and embedders that script the server
//! side themselves. Every successful `open` hands a [`MemoryRemote`] to the
//! receiver returned by [`MemoryConnector::new`].

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Channel, ChannelEvent, ChannelSender, Connector, Outbound, TransportError};
use crate::config::ChatMode;
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Debug)]
pub struct MemoryConnector {
    remotes: mpsc::UnboundedSender<MemoryRemote>,
    failures: Mutex<VecDeque<String>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryRemote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes,
                failures: Mutex::new(VecDeque::new()),
            },
            rx,
        )
    }

    /// Makes the next `open` fail with a protocol error carrying `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        self.failures.lock().push_back(reason.into());
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, mode: ChatMode) -> Result<Channel, TransportError> {
        if let Some(reason) = self.failures.lock().pop_front() {
            return Err(TransportError::Protocol(reason));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let remote = MemoryRemote {
            mode,
            outbound: out_rx,
            events: event_tx,
            closed_by_client: false,
        };
        self.remotes
            .send(remote)
            .map_err(|_| TransportError::ChannelClosed)?;
        Ok(Channel::new(ChannelSender::new(out_tx), event_rx))
    }
}

/// Server end of a [`MemoryConnector`] channel.
#[derive(Debug)]
pub struct MemoryRemote {
    mode: ChatMode,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed_by_client: bool,
}

impl MemoryRemote {
    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    /// Next envelope the client sent. `None` once the client closed the
    /// channel or dropped its sender.
    pub async fn next_message(&mut self) -> Option<ClientMessage> {
        if self.closed_by_client {
            return None;
        }
        match self.outbound.recv().await {
            Some(Outbound::Message(message)) => Some(message),
            Some(Outbound::Close) | None => {
                self.closed_by_client = true;
                None
            }
        }
    }

    /// Non-blocking variant for asserting that nothing was sent.
    pub fn try_next_message(&mut self) -> Option<ClientMessage> {
        if self.closed_by_client {
            return None;
        }
        match self.outbound.try_recv() {
            Ok(Outbound::Message(message)) => Some(message),
            Ok(Outbound::Close) | Err(mpsc::error::TryRecvError::Disconnected) => {
                self.closed_by_client = true;
                None
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
        }
    }

    /// True once the client asked to close or went away.
    pub fn client_closed(&mut self) -> bool {
        let _ = self.try_next_message();
        self.closed_by_client || self.outbound.is_closed()
    }

    pub fn push(&self, message: &ServerMessage) {
        if let Ok(frame) = serde_json::to_string(message) {
            self.push_text(frame);
        }
    }

    pub fn push_json(&self, value: Value) {
        self.push_text(value.to_string());
    }

    pub fn push_text(&self, frame: impl Into<String>) {
        let _ = self.events.send(ChannelEvent::Text(frame.into()));
    }

    pub fn system(&self, text: &str) {
        self.push(&ServerMessage::System {
            message: text.to_string(),
        });
    }

    /// Server-side close.
    pub fn close(&self) {
        let _ = self.events.send(ChannelEvent::Closed);
    }

    /// Abrupt transport failure.
    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(ChannelEvent::Error(reason.to_string()));
        let _ = self.events.send(ChannelEvent::Closed);
    }
}
