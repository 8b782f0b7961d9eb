//! Realtime event stream: one signed WebSocket link with endpoint rotation,
//! topic dispatch, chat commands and voice keep-alive.
pub mod clock;
pub mod codec;
pub mod command;
pub mod frames;
pub mod session;
pub mod topic;

pub use clock::ElapsedClock;
pub use codec::{ChatMessage, Frame, NdcCodec, RealtimeEvent};
pub use command::{match_prefix, tokenize, Arg, CommandContext};
pub use session::{
    NamespaceFactory, RealtimeCredentials, RealtimeHandle, RealtimeSession, SessionOptions,
    SessionState,
};
pub use topic::{classify, EventTopic};
