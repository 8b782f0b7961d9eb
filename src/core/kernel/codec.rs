use crate::core::errors::TransportError;
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for converting between raw WebSocket messages and typed frames
///
/// Control messages (ping, pong, close) never reach the codec; the transport
/// handles them.
pub trait WsCodec: Send + Sync + 'static {
    /// Decoded inbound event
    type Message: Send + Sync;

    /// Outbound frame
    type Frame: Send + Sync;

    /// Encode an outbound frame into a WebSocket message
    fn encode_frame(&self, frame: &Self::Frame) -> Result<Message, TransportError>;

    /// Decode a raw WebSocket message
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Message was ignored by the codec
    /// - `Err(error)` - The payload is malformed
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, TransportError>;
}
