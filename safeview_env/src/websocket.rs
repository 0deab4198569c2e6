//! WebSocket transport backed by tokio-tungstenite.

use crate::error::EnvError;
use crate::transport::{StreamConnection, StreamTransport};
use crate::types::InboundFrame;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production transport: one WebSocket per `connect` call.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, EnvError> {
        let handshake = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| EnvError::Timeout(self.connect_timeout.as_millis() as u64))?;

        let (socket, _response) = handshake.map_err(|e| EnvError::connect_failed(url, e))?;

        Ok(Box::new(WebSocketConnection {
            socket,
            peer: url.to_string(),
            closed: false,
        }))
    }
}

/// An open WebSocket.
pub struct WebSocketConnection {
    socket: Socket,
    peer: String,
    /// Set after a fatal socket error so the next `recv` reports the close
    closed: bool,
}

#[async_trait]
impl StreamConnection for WebSocketConnection {
    async fn recv(&mut self) -> Option<Result<InboundFrame, EnvError>> {
        if self.closed {
            return None;
        }

        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(InboundFrame::Binary(bytes))),
                Ok(Message::Close(_)) => {
                    self.closed = true;
                    return None;
                }
                // Pongs are queued by tungstenite and flushed on the next read
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    self.closed = true;
                    return None;
                }
                // Oversized or badly encoded frames spoil one message, not the socket
                Err(e @ (tungstenite::Error::Utf8 | tungstenite::Error::Capacity(_))) => {
                    return Some(Err(EnvError::network(e.to_string())));
                }
                Err(e) => {
                    self.closed = true;
                    return Some(Err(EnvError::network(e.to_string())));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.socket.close(None).await {
            tracing::debug!(peer = %self.peer, "close handshake failed: {e}");
        }
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
