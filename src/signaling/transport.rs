use crate::error::ChannelError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// One open duplex text link to the relay.
///
/// Dropping `outgoing` closes the link; `incoming` yields `None` once the
/// remote side went away.
pub struct SignalLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl SignalLink {
    /// Two links wired back to back.
    pub fn pair() -> (SignalLink, SignalLink) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            SignalLink {
                outgoing: a_tx,
                incoming: b_rx,
            },
            SignalLink {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<SignalLink, ChannelError>;
}

/// Relay connection over a WebSocket.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl SignalTransport for WebSocketTransport {
    async fn connect(&self, endpoint: &str) -> Result<SignalLink, ChannelError> {
        let (ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        info!("WebSocket connected to {}", endpoint);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("WebSocket writer finished");
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(SignalLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
