use crate::core::errors::TransportError;
use crate::core::kernel::codec::WsCodec;
use crate::realtime::topic::{classify, EventTopic};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;

/// Inbound realtime event: `{"t": <type>, "o": <payload>}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub t: i64,
    #[serde(default)]
    pub o: Value,
}

impl RealtimeEvent {
    /// Community the event belongs to; 0 for global events
    pub fn ndc_id(&self) -> i64 {
        self.o.get("ndcId").and_then(Value::as_i64).unwrap_or(0)
    }

    /// `chatMessage.type`, when the payload carries a chat message
    pub fn subtype(&self) -> Option<i64> {
        self.o
            .get("chatMessage")
            .and_then(|message| message.get("type"))
            .and_then(Value::as_i64)
    }

    pub fn topic(&self) -> EventTopic {
        classify(self.t, self.subtype())
    }

    pub fn chat_message(&self) -> Option<ChatMessage> {
        self.o
            .get("chatMessage")
            .and_then(|message| ChatMessage::deserialize(message).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "type", default)]
    pub kind: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outbound realtime frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub t: i64,
    pub o: Value,
}

/// JSON text codec for the platform's realtime frames
#[derive(Debug, Clone, Copy, Default)]
pub struct NdcCodec;

impl WsCodec for NdcCodec {
    type Message = RealtimeEvent;
    type Frame = Frame;

    fn encode_frame(&self, frame: &Frame) -> Result<Message, TransportError> {
        serde_json::to_string(frame)
            .map(Message::Text)
            .map_err(|e| TransportError::InvalidParameters(format!("Failed to encode frame: {}", e)))
    }

    fn decode_message(&self, message: Message) -> Result<Option<RealtimeEvent>, TransportError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8(data).map_err(|e| {
                TransportError::Decode(format!("Binary frame is not UTF-8: {}", e))
            })?,
            _ => return Ok(None),
        };

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| TransportError::Decode(format!("Malformed frame: {}", e)))
    }
}
