//! Stream transport boundary.
//!
//! The upstream pushes JSON message frames over one logical connection per
//! client. The traits here keep the connection machinery independent of the
//! concrete transport so the state machine is testable without a network;
//! the production implementation dials a WebSocket endpoint.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use wavelink_protocol::{codec, Message};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the stream failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// The connection is closed.
    #[error("Connection closed")]
    Closed,

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport that can open the server-push stream.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open one logical stream for the given client identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be established.
    async fn open(&self, client_id: &str) -> Result<Box<dyn StreamConnection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// An open server-push stream.
#[async_trait]
pub trait StreamConnection: Send {
    /// Receive the next message from the stream.
    ///
    /// Returns `None` when the remote end closed the stream cleanly.
    /// Malformed frames are logged and skipped, never surfaced as errors.
    async fn next_message(&mut self) -> Result<Option<Message>, TransportError>;

    /// Close the stream locally.
    async fn close(&mut self);
}

/// WebSocket stream transport.
pub struct WebSocketTransport {
    base_url: String,
    auth_token: Option<String>,
}

impl WebSocketTransport {
    /// Create a transport dialing `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token,
        }
    }

    /// The stream URL for a client, carrying the client id (and token) as
    /// query parameters.
    fn stream_url(&self, client_id: &str) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        let mut url = format!("{}{}client={}", self.base_url, separator, client_id);
        if let Some(token) = &self.auth_token {
            url.push_str("&token=");
            url.push_str(token);
        }
        url
    }
}

#[async_trait]
impl StreamTransport for WebSocketTransport {
    async fn open(&self, client_id: &str) -> Result<Box<dyn StreamConnection>, TransportError> {
        let url = self.stream_url(client_id);
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(client = %client_id, "WebSocket stream established");
        Ok(Box::new(WebSocketStreamConnection { stream }))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// An open WebSocket stream.
pub struct WebSocketStreamConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamConnection for WebSocketStreamConnection {
    async fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match codec::decode_message(&text) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed frame");
                    }
                },
                Some(Ok(WsMessage::Binary(data))) => match codec::decode_message_bytes(&data) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed binary frame");
                    }
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    // Transport-level keepalive; answer and keep reading.
                    if let Err(e) = self.stream.send(WsMessage::Pong(payload)).await {
                        warn!(error = %e, "Failed to send pong");
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    // Application heartbeats arrive as message frames.
                }
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    debug!("Connection closed");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Close handshake failed");
        }
    }
}
