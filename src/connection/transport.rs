//! Duplex text channel abstraction and its WebSocket implementation.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// An open duplex connection carrying text frames.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next inbound text frame. `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// Opens [`Channel`]s to the push endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Channel>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Connector`] for a `ws://` or `wss://` endpoint.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Channel>> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::Connection(format!("WebSocket connect: {e}")))?;
        debug!(url = %self.url, "WebSocket open");
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WsStream,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_string())),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|e| SyncError::MalformedMessage(e.to_string())),
                    )
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(SyncError::Connection(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
