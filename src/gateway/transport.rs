//! Socket abstraction for the gateway link.
//!
//! A [`Connector`] opens one bidirectional text channel and hands back a
//! pair of queues. The production connector pumps a tokio-tungstenite
//! WebSocket; tests substitute in-memory channels.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};

/// Something read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame.
    Frame(String),
    /// The socket is gone; no further events follow.
    Closed(Option<String>),
}

/// Both directions of an open socket.
///
/// Dropping `outgoing` closes the socket.
#[derive(Debug)]
pub struct TransportHandle {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket to `url`. Fails if the transport cannot be established.
    async fn open(&self, url: &str) -> GatewayResult<TransportHandle>;
}

/// WebSocket connector (ws:// and wss://).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> GatewayResult<TransportHandle> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        debug!(url, "gateway socket open");

        let (mut sink, mut stream) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %err, "gateway socket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                let event = match stream.next().await {
                    Some(Ok(Message::Text(text))) => TransportEvent::Frame(text.to_string()),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => TransportEvent::Frame(text),
                        Err(_) => {
                            warn!(len = data.len(), "dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                };
                if incoming_tx.send(event).is_err() {
                    // Client dropped its end of the link.
                    return;
                }
            };
            let _ = incoming_tx.send(TransportEvent::Closed(reason));
        });

        Ok(TransportHandle { outgoing, incoming })
    }
}
