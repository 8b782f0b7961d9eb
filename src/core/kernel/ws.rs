use crate::core::errors::TransportError;
use crate::core::kernel::codec::WsCodec;
use crate::core::types::HeaderSet;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, warn};

/// Target and headers of one WebSocket handshake
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub url: String,
    pub headers: HeaderSet,
}

/// WebSocket session trait - pure transport layer
#[async_trait]
pub trait WsSession<C: WsCodec>: Send {
    /// Open a connection; any previous connection must already be closed
    async fn connect(&mut self, request: HandshakeRequest) -> Result<(), TransportError>;

    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), TransportError>;

    /// Receive the next data or close message; pings are answered here
    async fn next_raw(&mut self) -> Option<Result<Message, TransportError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is alive
    fn is_connected(&self) -> bool;

    /// Access the codec
    fn codec(&self) -> &C;

    /// Encode `frame` with the codec and send it
    async fn send_frame(&mut self, frame: &C::Frame) -> Result<(), TransportError> {
        let message = self.codec().encode_frame(frame)?;
        self.send_raw(message).await
    }

    /// Get the next decoded message; `None` once the server closed the stream
    async fn next_message(&mut self) -> Option<Result<C::Message, TransportError>> {
        loop {
            match self.next_raw().await? {
                Ok(Message::Close(_)) => return None,
                Ok(raw) => match self.codec().decode_message(raw) {
                    Ok(Some(decoded)) => return Some(Ok(decoded)),
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tungstenite-based WebSocket implementation
pub struct TungsteniteWs<C: WsCodec> {
    url: String,
    write: Option<SplitSink<Stream, Message>>,
    read: Option<SplitStream<Stream>>,
    connected: bool,
    codec: C,
    connect_timeout: Duration,
}

impl<C: WsCodec> TungsteniteWs<C> {
    /// Create a new, unconnected WebSocket session with the specified codec
    pub fn new(codec: C, connect_timeout: Duration) -> Self {
        Self {
            url: String::new(),
            write: None,
            read: None,
            connected: false,
            codec,
            connect_timeout,
        }
    }

    /// URL of the last handshake
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Drop both halves of a dead stream
    fn release(&mut self) {
        self.connected = false;
        self.write = None;
        self.read = None;
    }
}

fn handshake_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Network(format!("Invalid handshake request: {}", e))
}

#[async_trait]
impl<C: WsCodec> WsSession<C> for TungsteniteWs<C> {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn connect(&mut self, request: HandshakeRequest) -> Result<(), TransportError> {
        let mut handshake = request
            .url
            .as_str()
            .into_client_request()
            .map_err(handshake_error)?;
        for (name, value) in request.headers.iter() {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(handshake_error)?;
            let value = HeaderValue::from_str(value).map_err(handshake_error)?;
            handshake.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(handshake))
            .await
            .map_err(|_| TransportError::Network("WebSocket connection timeout".to_string()))?
            .map_err(|e| TransportError::Network(format!("WebSocket connection failed: {}", e)))?;

        let (write, read) = stream.split();
        self.url = request.url;
        self.write = Some(write);
        self.read = Some(read);
        self.connected = true;

        debug!("WebSocket connected");
        Ok(())
    }

    async fn send_raw(&mut self, msg: Message) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Network(
                "WebSocket not connected".to_string(),
            ));
        }

        let write = self.write.as_mut().ok_or_else(|| {
            TransportError::Network("WebSocket write stream not available".to_string())
        })?;

        write.send(msg).await.map_err(|e| {
            self.connected = false;
            TransportError::Network(format!("Failed to send WebSocket message: {}", e))
        })
    }

    async fn next_raw(&mut self) -> Option<Result<Message, TransportError>> {
        loop {
            if !self.connected {
                return Some(Err(TransportError::Network(
                    "WebSocket not connected".to_string(),
                )));
            }

            let read = self.read.as_mut()?;

            match read.next().await {
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.send_raw(Message::Pong(data)).await {
                        warn!("Failed to send pong response: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(message)) => {
                    if matches!(message, Message::Close(_)) {
                        self.connected = false;
                    }
                    return Some(Ok(message));
                }
                Some(Err(e)) => {
                    self.release();
                    return Some(Err(TransportError::Network(format!(
                        "WebSocket error: {}",
                        e
                    ))));
                }
                None => {
                    self.release();
                    return None;
                }
            }
        }
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(write) = self.write.as_mut() {
            let _ = write.send(Message::Close(None)).await;
        }
        self.release();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn codec(&self) -> &C {
        &self.codec
    }
}
