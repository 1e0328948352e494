//! HTTP polling rendition of the channel for clients that cannot keep a
//! WebSocket open. Outbound envelopes map onto `/api/*` calls and the
//! inbox is drained on a fixed cadence.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    Channel, ChannelEvent, ChannelSender, Connector, Outbound, TransportError, api_base_url,
    api_url,
};
use crate::config::ChatMode;
use crate::protocol::{ClientMessage, VideoSignal};

#[derive(Debug, Clone)]
pub struct RestConnector {
    client: Client,
    server: String,
    poll_interval: Duration,
}

impl RestConnector {
    pub fn new(server: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            client: Client::new(),
            server: server.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn open(&self, mode: ChatMode) -> Result<Channel, TransportError> {
        let base = api_base_url(&self.server)?;
        info!(target = "stranger::transport", base = %base, "opening rest channel");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = RestSession {
            client: self.client.clone(),
            base,
            mode,
            connection_id: None,
        };
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            session.pump(out_rx, event_tx, poll_interval).await;
        });

        Ok(Channel::new(ChannelSender::new(out_tx), event_rx))
    }
}

#[derive(Serialize)]
struct StartRequest<'a> {
    chat_type: &'a str,
    interests: &'a [String],
}

#[derive(Deserialize)]
struct StartResponse {
    connection_id: String,
}

#[derive(Serialize)]
struct FindNewRequest<'a> {
    connection_id: &'a str,
    interests: &'a [String],
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    connection_id: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct TypingRequest<'a> {
    connection_id: &'a str,
    #[serde(rename = "isTyping")]
    is_typing: bool,
}

#[derive(Serialize)]
struct VideoSignalRequest<'a> {
    connection_id: &'a str,
    signal: &'a VideoSignal,
}

#[derive(Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    messages: Vec<Value>,
}

struct RestSession {
    client: Client,
    base: Url,
    mode: ChatMode,
    connection_id: Option<String>,
}

impl RestSession {
    async fn pump(
        mut self,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        events: mpsc::UnboundedSender<ChannelEvent>,
        poll_interval: Duration,
    ) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'pump: loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(Outbound::Message(message)) => {
                        if let Err(err) = self.deliver(message).await {
                            warn!(target = "stranger::transport", error = %err, "rest delivery failed");
                            let _ = events.send(ChannelEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => break,
                },
                _ = ticker.tick(), if self.connection_id.is_some() => {
                    match self.poll().await {
                        Ok(frames) => {
                            for frame in frames {
                                if events.send(ChannelEvent::Text(frame.to_string())).is_err() {
                                    debug!(target = "stranger::transport", "channel events dropped; ending rest session");
                                    break 'pump;
                                }
                            }
                        }
                        Err(err) => {
                            warn!(target = "stranger::transport", error = %err, "rest poll failed");
                            let _ = events.send(ChannelEvent::Error(err.to_string()));
                            break;
                        }
                    }
                }
            }
        }

        self.end().await;
        let _ = events.send(ChannelEvent::Closed);
    }

    fn connection_id(&self) -> Result<&str, TransportError> {
        self.connection_id
            .as_deref()
            .ok_or_else(|| TransportError::Protocol("no rest session started".into()))
    }

    async fn deliver(&mut self, message: ClientMessage) -> Result<(), TransportError> {
        match &message {
            ClientMessage::Interests { interests } if self.connection_id.is_none() => {
                let url = api_url(&self.base, &["session", "start"]);
                let response: StartResponse = self
                    .client
                    .post(url)
                    .json(&StartRequest {
                        chat_type: self.mode.as_str(),
                        interests,
                    })
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                debug!(target = "stranger::transport", connection_id = %response.connection_id, "rest session started");
                self.connection_id = Some(response.connection_id);
                Ok(())
            }
            ClientMessage::Interests { interests } | ClientMessage::FindNew { interests } => {
                let body = FindNewRequest {
                    connection_id: self.connection_id()?,
                    interests,
                };
                self.post(&["find-new"], &body).await
            }
            ClientMessage::Message { message } => {
                let body = MessageRequest {
                    connection_id: self.connection_id()?,
                    message,
                };
                self.post(&["message"], &body).await
            }
            ClientMessage::Typing { is_typing } => {
                let body = TypingRequest {
                    connection_id: self.connection_id()?,
                    is_typing: *is_typing,
                };
                self.post(&["typing"], &body).await
            }
            ClientMessage::VideoSignal { signal } => {
                let body = VideoSignalRequest {
                    connection_id: self.connection_id()?,
                    signal,
                };
                self.post(&["video-signal"], &body).await
            }
        }
    }

    async fn post<T: Serialize>(&self, path: &[&str], body: &T) -> Result<(), TransportError> {
        self.client
            .post(api_url(&self.base, path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<Value>, TransportError> {
        let url = api_url(&self.base, &["updates", self.connection_id()?]);
        let updates: UpdatesResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(updates.messages)
    }

    async fn end(&self) {
        let Some(connection_id) = self.connection_id.as_deref() else {
            return;
        };
        let url = api_url(&self.base, &["session", connection_id]);
        if let Err(err) = self.client.delete(url).send().await {
            debug!(target = "stranger::transport", error = %err, "rest session end failed");
        }
    }
}
