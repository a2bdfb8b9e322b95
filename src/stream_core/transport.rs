//! Transport seam for the push subscription
//!
//! The connection manager speaks STOMP text frames over a `Transport`. The
//! production transport is a WebSocket (the raw-WebSocket leg of the backend's
//! SockJS endpoint, `/ws/websocket`); tests plug in in-memory transports.

use super::stomp::FrameError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Socket could not be opened or failed mid-stream
    Transport(String),
    /// Broker sent an ERROR frame or an unexpected frame
    Protocol(String),
    /// Inbound text could not be parsed as STOMP
    Frame(String),
    /// Peer closed the connection
    Closed,
    /// Connect + handshake did not finish in time
    Timeout,
    /// start() called while a session is already active
    AlreadyActive,
    /// start() called after stop()
    Terminated,
    /// Reconnect gave up after this many consecutive failures
    RetriesExhausted(u32),
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        ConnectionError::Frame(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
            other => ConnectionError::Transport(other.to_string()),
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ConnectionError::Protocol(msg) => write!(f, "STOMP error: {}", msg),
            ConnectionError::Frame(msg) => write!(f, "Malformed frame: {}", msg),
            ConnectionError::Closed => write!(f, "Connection closed by peer"),
            ConnectionError::Timeout => write!(f, "Timed out establishing subscription"),
            ConnectionError::AlreadyActive => write!(f, "Subscription already active"),
            ConnectionError::Terminated => write!(f, "Connection manager was stopped"),
            ConnectionError::RetriesExhausted(n) => {
                write!(f, "Gave up reconnecting after {} attempts", n)
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// A connected, text-framed duplex channel
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError>;

    /// Next inbound text message; `None` once the peer has closed
    async fn next_text(&mut self) -> Option<Result<String, ConnectionError>>;

    /// Best-effort close; errors are ignored
    async fn close(&mut self);
}

/// Opens fresh transports, one per session
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

/// Connects to a WebSocket URL (`ws://` or `wss://`)
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, ConnectionError> {
        let (stream, response) = connect_async(self.url.as_str()).await?;
        log::debug!("WebSocket upgrade to {} ({})", self.url, response.status());
        Ok(Box::new(WebSocketTransport { stream }))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, ConnectionError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| ConnectionError::Frame(e.to_string())),
                    )
                }
                Ok(Message::Close(frame)) => {
                    log::debug!("WebSocket close frame: {:?}", frame);
                    return None;
                }
                // Ping replies are queued by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("WebSocket close: {}", e);
        }
    }
}
