pub mod core;
pub mod realtime;

pub use self::core::{
    cache::{CacheKey, SessionCache},
    config::{CacheConfig, ClientConfig, RealtimeConfig},
    errors::TransportError,
    kernel::HttpTransport,
    types::*,
};
pub use realtime::{EventTopic, RealtimeHandle, RealtimeSession, SessionState};
