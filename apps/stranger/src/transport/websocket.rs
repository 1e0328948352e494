use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    Channel, ChannelEvent, ChannelSender, Connector, Outbound, TransportError, websocket_url,
};
use crate::config::ChatMode;
use crate::protocol::encode_client_message;

/// Opens `/ws/<mode>` on the matchmaking server.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    server: String,
}

impl WebSocketConnector {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, mode: ChatMode) -> Result<Channel, TransportError> {
        let url = websocket_url(&self.server, mode)?;
        info!(target = "stranger::transport", url = %url, "opening websocket channel");
        let (ws_stream, _) = connect_async(url.as_str()).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            pump(ws_stream, out_rx, event_tx).await;
        });

        Ok(Channel::new(ChannelSender::new(out_tx), event_rx))
    }
}

/// Moves frames both ways until either side ends. Always finishes with
/// `ChannelEvent::Closed`.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Message(message)) => {
                    let frame = match encode_client_message(&message) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(target = "stranger::transport", error = %err, "dropping unencodable envelope");
                            continue;
                        }
                    };
                    if let Err(err) = ws_sender.send(Message::Text(frame)).await {
                        let _ = events.send(ChannelEvent::Error(err.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!(target = "stranger::transport", "closing websocket channel");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if events.send(ChannelEvent::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(target = "stranger::transport", ?frame, "server closed websocket");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target = "stranger::transport", error = %err, "websocket receive failed");
                    let _ = events.send(ChannelEvent::Error(err.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    let _ = events.send(ChannelEvent::Closed);
}
