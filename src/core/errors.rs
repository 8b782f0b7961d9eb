use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Signing provider error: {0}")]
    SigningProvider(String),

    #[error("HTTP status error: {status}")]
    HttpStatus { status: u16 },

    #[error("API error: {code} - {}", message.as_deref().unwrap_or("no message"))]
    Api { code: i64, message: Option<String> },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::core::config::ConfigError),

    #[error("Cache error: {0}")]
    Cache(String),
}

impl TransportError {
    /// Whether the failure came from the egress path and may succeed through another one.
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Application status code carried by the envelope, if any.
    pub const fn api_code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}
