use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://service.aminoapps.com/api/v1";
pub const DEFAULT_SIGNATURE_PREFIX: u8 = 0x19;
pub const DEFAULT_USER_AGENT: &str = "Apple iPhone12,1 iOS v15.5 Main/3.12.2";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Authorization for the signing service
    pub api_key: Secret<String>,
    /// Key for the `NDC-MSG-SIG` keyed hash
    pub message_key: Secret<String>,
    pub signature_prefix: u8,
    pub device_id: String,
    pub base_url: String,
    pub signature_url: String,
    pub proxies: Vec<String>,
    pub timeout_seconds: u64,
    pub user_agent: String,
    pub realtime: RealtimeConfig,
    pub cache: CacheConfig,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for ClientConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ClientConfig", 8)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("message_key", "[REDACTED]")?;
        state.serialize_field("device_id", &self.device_id)?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("signature_url", &self.signature_url)?;
        state.serialize_field("proxy_count", &self.proxies.len())?;
        state.serialize_field("timeout_seconds", &self.timeout_seconds)?;
        state.serialize_field("user_agent", &self.user_agent)?;
        state.end()
    }
}

// Custom Deserialize implementation
impl<'de> Deserialize<'de> for ClientConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ClientConfigHelper {
            api_key: String,
            message_key: String,
            device_id: String,
            signature_url: String,
            base_url: Option<String>,
            signature_prefix: Option<u8>,
            #[serde(default)]
            proxies: Vec<String>,
            timeout_seconds: Option<u64>,
            user_agent: Option<String>,
        }

        let helper = ClientConfigHelper::deserialize(deserializer)?;
        let mut config = Self::new(
            helper.api_key,
            helper.message_key,
            helper.device_id,
            helper.signature_url,
        )
        .with_proxies(helper.proxies);

        if let Some(base_url) = helper.base_url {
            config.base_url = base_url;
        }
        if let Some(prefix) = helper.signature_prefix {
            config.signature_prefix = prefix;
        }
        if let Some(timeout) = helper.timeout_seconds {
            config.timeout_seconds = timeout;
        }
        if let Some(user_agent) = helper.user_agent {
            config.user_agent = user_agent;
        }
        Ok(config)
    }
}

impl ClientConfig {
    /// Create a new configuration with the signing credentials and device identity
    #[must_use]
    pub fn new(
        api_key: String,
        message_key: String,
        device_id: String,
        signature_url: String,
    ) -> Self {
        Self {
            api_key: Secret::new(api_key),
            message_key: Secret::new(message_key),
            signature_prefix: DEFAULT_SIGNATURE_PREFIX,
            device_id,
            base_url: DEFAULT_BASE_URL.to_string(),
            signature_url,
            proxies: Vec::new(),
            timeout_seconds: 30,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            realtime: RealtimeConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_API_KEY`
    /// - `{PREFIX}_MESSAGE_KEY`
    /// - `{PREFIX}_DEVICE_ID`
    /// - `{PREFIX}_SIGNATURE_URL`
    /// - `{PREFIX}_BASE_URL` (optional)
    /// - `{PREFIX}_PROXIES` (optional, comma separated)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let required = |name: &str| {
            let var = format!("{}_{}", prefix, name);
            env::var(&var).map_err(|_| ConfigError::MissingEnvironmentVariable(var))
        };

        let api_key = required("API_KEY")?;
        let message_key = required("MESSAGE_KEY")?;
        let device_id = required("DEVICE_ID")?;
        let signature_url = required("SIGNATURE_URL")?;

        let mut config = Self::new(api_key, message_key, device_id, signature_url);

        if let Ok(base_url) = env::var(format!("{}_BASE_URL", prefix)) {
            config.base_url = base_url;
        }
        if let Ok(proxies) = env::var(format!("{}_PROXIES", prefix)) {
            config.proxies = parse_proxy_list(&proxies);
        }

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from a `.env` file and environment variables
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific `.env` file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // no file, fall through to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "device id cannot be empty".to_string(),
            ));
        }
        if self.message_key.expose_secret().is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "message key cannot be empty".to_string(),
            ));
        }
        if self.realtime.endpoint_ids.is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "realtime endpoint pool cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies;
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    #[must_use]
    pub fn with_signature_prefix(mut self, prefix: u8) -> Self {
        self.signature_prefix = prefix;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    #[must_use]
    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Get the signing service key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get the message signing key (use carefully - exposes secret)
    pub fn message_key(&self) -> &str {
        self.message_key.expose_secret()
    }
}

/// Realtime session tuning
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Endpoint URL with a `{}` placeholder for the discriminator
    pub endpoint_template: String,
    pub endpoint_ids: Vec<String>,
    pub initial_endpoint: String,
    pub reconnect_interval: Duration,
    pub voice_keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            endpoint_template: "ws://ws{}.aminoapps.com".to_string(),
            endpoint_ids: ["1", "2", "3", "4"].iter().map(|s| s.to_string()).collect(),
            initial_endpoint: "1".to_string(),
            reconnect_interval: Duration::from_secs(180),
            voice_keepalive_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RealtimeConfig {
    pub fn endpoint_url(&self, id: &str) -> String {
        self.endpoint_template.replace("{}", id)
    }

    #[must_use]
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    #[must_use]
    pub fn with_voice_keepalive_interval(mut self, interval: Duration) -> Self {
        self.voice_keepalive_interval = interval;
        self
    }
}

/// Session cache sizing and persistence
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub max_size: usize,
    /// `None` keeps entries until evicted by capacity
    pub max_age: Option<Duration>,
    pub debounce: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cache.json"),
            max_size: 1000,
            max_age: None,
            debounce: Duration::from_millis(1000),
        }
    }
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
