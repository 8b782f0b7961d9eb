use crate::core::errors::TransportError;
use async_trait::async_trait;
use reqwest::{Client, Method};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{instrument, trace};

/// Remote signing service used for asymmetric request signatures
#[async_trait]
pub trait SignatureProvider: Send + Sync {
    /// ECDSA signature over `payload` on behalf of `user_id`
    async fn ecdsa(&self, payload: &str, user_id: &str) -> Result<String, TransportError>;

    /// Public-key credentials to register for `user_id`
    async fn public_key_credentials(&self, user_id: &str) -> Result<Value, TransportError>;
}

/// Source of the server-synchronized elapsed-realtime value
#[async_trait]
pub trait ElapsedSource: Send + Sync {
    async fn elapsed_realtime(&self) -> Result<u64, TransportError>;
}

#[derive(Debug, Deserialize)]
struct EcdsaResponse {
    #[serde(rename = "ECDSA", default)]
    ecdsa: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialsResponse {
    #[serde(default)]
    credentials: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElapsedRealtime {
    #[serde(rename = "elapsedRealtime", deserialize_with = "u64_from_string_or_number")]
    pub elapsed_realtime: u64,
}

fn u64_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// `SignatureProvider` over HTTP, with its own connection pool
#[derive(Clone)]
pub struct ReqwestSignatureService {
    client: Client,
    base_url: String,
    api_key: Secret<String>,
}

impl std::fmt::Debug for ReqwestSignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestSignatureService")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ReqwestSignatureService {
    pub fn new(base_url: String, api_key: String, timeout_seconds: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| {
                TransportError::InvalidParameters(format!(
                    "Failed to build signing service client: {}",
                    e
                ))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: Secret::new(api_key),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", self.api_key.expose_secret());

        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SigningProvider(format!("Request failed: {}", e)))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| {
            TransportError::SigningProvider(format!("Failed to read response body: {}", e))
        })?;

        trace!(%status, "Signing service response: {}", text);

        serde_json::from_str(&text).map_err(|e| {
            TransportError::SigningProvider(format!(
                "Unexpected response ({}) from {}: {}",
                status, path, e
            ))
        })
    }
}

#[async_trait]
impl SignatureProvider for ReqwestSignatureService {
    #[instrument(skip(self, payload), fields(user_id = %user_id))]
    async fn ecdsa(&self, payload: &str, user_id: &str) -> Result<String, TransportError> {
        let response: EcdsaResponse = self
            .call(
                Method::POST,
                "/api/v1/signature/ecdsa",
                Some(json!({ "payload": payload, "userId": user_id })),
            )
            .await?;

        response.ecdsa.filter(|s| !s.is_empty()).ok_or_else(|| {
            TransportError::SigningProvider(
                response
                    .message
                    .unwrap_or_else(|| "signature missing from response".to_string()),
            )
        })
    }

    #[instrument(skip(self))]
    async fn public_key_credentials(&self, user_id: &str) -> Result<Value, TransportError> {
        let response: CredentialsResponse = self
            .call(
                Method::GET,
                &format!("/api/v1/signature/credentials/{}", user_id),
                None,
            )
            .await?;

        response.credentials.ok_or_else(|| {
            TransportError::SigningProvider(
                response
                    .message
                    .unwrap_or_else(|| "credentials missing from response".to_string()),
            )
        })
    }
}

#[async_trait]
impl ElapsedSource for ReqwestSignatureService {
    #[instrument(skip(self))]
    async fn elapsed_realtime(&self) -> Result<u64, TransportError> {
        let response: ElapsedRealtime = self
            .call(Method::GET, "/api/v1/signature/getElapsed", None)
            .await?;
        Ok(response.elapsed_realtime)
    }
}
