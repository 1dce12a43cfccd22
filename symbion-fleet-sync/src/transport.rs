//! Duplex transport under the connection manager.
//!
//! The manager never talks to a socket directly: it asks a `Transport` for
//! a `TransportStream` and reads frames from it. Production uses
//! `WsTransport`; tests use the devkit's mock.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::models::Credential;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: Option<u16>, reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection, authenticated when a credential is given.
    async fn connect(&self, credential: Option<&Credential>) -> Result<Box<dyn TransportStream>, TransportError>;
}

#[async_trait]
pub trait TransportStream: Send {
    /// Next inbound frame; `None` once the peer went away without a close frame.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Client-side close. Errors are swallowed: the stream is gone either way.
    async fn close(&mut self);
}

/// WebSocket transport. Anonymous sessions use `public_endpoint` when set.
#[derive(Debug, Clone)]
pub struct WsTransport {
    endpoint: String,
    public_endpoint: Option<String>,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>, public_endpoint: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            public_endpoint,
        }
    }

    fn endpoint_for(&self, credential: Option<&Credential>) -> &str {
        match (credential, &self.public_endpoint) {
            (None, Some(public)) => public,
            _ => &self.endpoint,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, credential: Option<&Credential>) -> Result<Box<dyn TransportStream>, TransportError> {
        let url = self.endpoint_for(credential);
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Endpoint(format!("{url}: {e}")))?;

        if let Some(credential) = credential {
            let value = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
                .map_err(|e| TransportError::Endpoint(format!("bad credential header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(endpoint = url, authenticated = credential.is_some(), "opening websocket");
        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Box::new(WsStream { socket }))
    }
}

struct WsStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.socket.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Protocol(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => debug!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(Frame::Close { code, reason }));
                }
                // pings are answered by tungstenite on the next read
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            debug!("websocket close: {e}");
        }
        let _ = self.socket.flush().await;
    }
}
