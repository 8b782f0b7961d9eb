use reqwest::Method;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::core::errors::TransportError;

pub const AUID: &str = "AUID";
pub const NDC_DEVICE_ID: &str = "NDCDEVICEID";
pub const NDC_AUTH: &str = "NDCAUTH";
pub const NDC_MSG_SIG: &str = "NDC-MSG-SIG";
pub const NDC_MESSAGE_SIGNATURE: &str = "NDC-MESSAGE-SIGNATURE";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const URL_ENCODED_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Insertion-ordered header map with case-insensitive names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: Vec<(String, String)>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Insert or override a header, keeping its original position
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    /// Apply `other` on top of `self`: new values win, untouched keys persist
    pub fn merge(&mut self, other: &Self) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut headers = self.clone();
        headers.merge(other);
        headers
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.set(name, value);
        }
        headers
    }
}

/// Headers every API call starts from
pub fn api_headers(user_agent: &str, device_id: &str) -> HeaderSet {
    [
        ("Accept-Language", "en-US"),
        (CONTENT_TYPE, JSON_CONTENT_TYPE),
        ("User-Agent", user_agent),
        ("NDCLANG", "en"),
        (NDC_DEVICE_ID, device_id),
    ]
    .into_iter()
    .collect()
}

/// Headers sent with the realtime handshake, before session credentials
pub fn realtime_headers(user_agent: &str) -> HeaderSet {
    [("Accept-Language", "en-US"), ("User-Agent", user_agent)]
        .into_iter()
        .collect()
}

/// Which signatures a POST carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    /// Message signature plus the remote ECDSA signature
    Remote,
    /// Message signature only; used before a session exists
    MessageOnly,
}

#[derive(Debug, Clone)]
pub enum RequestConfig {
    Raw {
        method: Method,
        path: String,
        headers: HeaderSet,
        body: Option<Vec<u8>>,
    },
    Get {
        path: String,
        content_type: Option<String>,
    },
    Delete {
        path: String,
    },
    Post {
        path: String,
        body: Vec<u8>,
        content_type: Option<String>,
        signature: SignatureMode,
    },
    UrlEncoded {
        path: String,
        content_type: Option<String>,
    },
    Buffer {
        path: String,
        body: Vec<u8>,
        content_type: Option<String>,
    },
}

impl RequestConfig {
    pub fn get(path: impl Into<String>) -> Self {
        Self::Get {
            path: path.into(),
            content_type: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete { path: path.into() }
    }

    /// POST with a body serialized once, up front; the signature covers these bytes
    pub fn post_json<B: Serialize>(
        path: impl Into<String>,
        body: &B,
        signature: SignatureMode,
    ) -> Result<Self, TransportError> {
        let body = serde_json::to_vec(body).map_err(|e| {
            TransportError::InvalidParameters(format!("Failed to serialize request body: {}", e))
        })?;
        Ok(Self::Post {
            path: path.into(),
            body,
            content_type: None,
            signature,
        })
    }

    /// Empty-bodied form POST; `content_type` defaults to `application/x-www-form-urlencoded`
    pub fn url_encoded(path: impl Into<String>, content_type: Option<&str>) -> Self {
        Self::UrlEncoded {
            path: path.into(),
            content_type: Some(content_type.unwrap_or(URL_ENCODED_CONTENT_TYPE).to_string()),
        }
    }

    pub fn buffer(path: impl Into<String>, body: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self::Buffer {
            path: path.into(),
            body,
            content_type: Some(content_type.into()),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Raw { path, .. }
            | Self::Get { path, .. }
            | Self::Delete { path }
            | Self::Post { path, .. }
            | Self::UrlEncoded { path, .. }
            | Self::Buffer { path, .. } => path,
        }
    }

    pub fn method(&self) -> Method {
        match self {
            Self::Raw { method, .. } => method.clone(),
            Self::Get { .. } => Method::GET,
            Self::Delete { .. } => Method::DELETE,
            Self::Post { .. } | Self::UrlEncoded { .. } | Self::Buffer { .. } => Method::POST,
        }
    }
}

/// Minimal shape every API response decodes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "api:statuscode")]
    pub status_code: i64,
    #[serde(rename = "api:message", default)]
    pub message: Option<String>,
    #[serde(rename = "api:duration", default)]
    pub duration: Option<String>,
    #[serde(rename = "api:timestamp", default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An authenticated session on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub session_id: String,
    pub device_id: String,
    pub user: UserProfile,
}

impl Account {
    pub fn auth_header(&self) -> String {
        format!("sid={}", self.session_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAccount {
    pub account: Account,
    pub email: String,
    #[serde(serialize_with = "serialize_exposed")]
    pub password: Secret<String>,
}

impl CachedAccount {
    pub fn new(account: Account, email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account,
            email: email.into(),
            password: Secret::new(password.into()),
        }
    }
}

// The cache file must round-trip the credential pair it is keyed on.
fn serialize_exposed<S: Serializer>(secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}
