use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::config::ChatMode;
use crate::protocol::ClientMessage;

pub mod mock;
pub mod rest;
pub mod websocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unexpected server response: {0}")]
    Protocol(String),
    #[error("channel closed")]
    ChannelClosed,
}

/// What the owning session observes on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One inbound text frame, still undecoded
    Text(String),
    /// Transport failure; `Closed` follows
    Error(String),
    Closed,
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Message(ClientMessage),
    Close,
}

/// Write half of a channel. Cloned into each negotiation so signals share
/// the session's ordering.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Message(message))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Asks the pump to shut the connection down. Clones become inert.
    pub fn close(&self) {
        if self.tx.send(Outbound::Close).is_err() {
            debug!(target = "stranger::transport", "close requested on finished channel");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One open duplex channel to the matchmaking server.
#[derive(Debug)]
pub struct Channel {
    pub sender: ChannelSender,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    pub(crate) fn new(
        sender: ChannelSender,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self { sender, events }
    }
}

/// Opens a fresh channel per `start()`. Reconnecting is never automatic.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, mode: ChatMode) -> Result<Channel, TransportError>;
}

fn is_loopback(server: &str) -> bool {
    server.starts_with("localhost") || server.starts_with("127.") || server.starts_with("[::1]")
}

fn invalid(address: &str, reason: impl ToString) -> TransportError {
    TransportError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

/// Base url of the server with the scheme family chosen by `secure`/`plain`.
fn base_url(server: &str, plain: &str, secure: &str) -> Result<Url, TransportError> {
    let server = server.trim().trim_end_matches('/');
    if server.is_empty() {
        return Err(invalid(server, "empty address"));
    }
    let with_scheme = if let Some(rest) = server.strip_prefix("https://") {
        format!("{secure}://{rest}")
    } else if let Some(rest) = server.strip_prefix("wss://") {
        format!("{secure}://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("{plain}://{rest}")
    } else if let Some(rest) = server.strip_prefix("ws://") {
        format!("{plain}://{rest}")
    } else if is_loopback(server) {
        format!("{plain}://{server}")
    } else {
        format!("{secure}://{server}")
    };
    Url::parse(&with_scheme).map_err(|err| invalid(server, err))
}

/// `ws(s)://<server>/ws/<mode>`
pub fn websocket_url(server: &str, mode: ChatMode) -> Result<Url, TransportError> {
    let mut url = base_url(server, "ws", "wss")?;
    url.path_segments_mut()
        .map_err(|_| invalid(server, "cannot carry a path"))?
        .pop_if_empty()
        .push("ws")
        .push(mode.as_str());
    Ok(url)
}

/// `http(s)://<server>/api`
pub fn api_base_url(server: &str) -> Result<Url, TransportError> {
    let mut url = base_url(server, "http", "https")?;
    url.path_segments_mut()
        .map_err(|_| invalid(server, "cannot carry a path"))?
        .pop_if_empty()
        .push("api");
    Ok(url)
}

pub(crate) fn api_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.extend(segments);
    }
    url
}
