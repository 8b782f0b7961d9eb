use crate::core::config::ClientConfig;
use crate::core::errors::TransportError;
use crate::core::kernel::headers::HeaderComposer;
use crate::core::kernel::proxy::{ProxyDescriptor, ProxyPool};
use crate::core::kernel::signature::{ElapsedSource, ReqwestSignatureService, SignatureProvider};
use crate::core::kernel::signer::{HmacSigner, Signer};
use crate::core::types::{
    api_headers, Account, Envelope, HeaderSet, RequestConfig, SignatureMode, AUID, CONTENT_LENGTH,
    CONTENT_TYPE, NDC_AUTH, NDC_DEVICE_ID,
};
use async_trait::async_trait;
use reqwest::{Client, Method, Proxy};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

/// A fully prepared request, headers signed and body final
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderSet,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// One network path to the upstream: a direct pool or a proxy tunnel
#[async_trait]
pub trait Egress: Send + Sync {
    async fn dispatch(&self, request: OutboundRequest) -> Result<RawResponse, TransportError>;

    /// Release the underlying connections; later dispatches fail
    fn close(&self);

    fn label(&self) -> &str;
}

/// Opens egress paths
pub trait EgressFactory: Send + Sync {
    fn direct(&self) -> Result<Arc<dyn Egress>, TransportError>;

    fn tunnel(&self, proxy: &ProxyDescriptor) -> Result<Arc<dyn Egress>, TransportError>;
}

/// `Egress` backed by a reqwest connection pool
pub struct ReqwestEgress {
    client: RwLock<Option<Client>>,
    label: String,
}

impl ReqwestEgress {
    pub fn new(client: Client, label: String) -> Self {
        Self {
            client: RwLock::new(Some(client)),
            label,
        }
    }
}

#[async_trait]
impl Egress for ReqwestEgress {
    async fn dispatch(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
        let client = self
            .client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::Network(format!("{} egress is closed", self.label)))?;

        let mut builder = client.request(request.method, &request.url);
        for (name, value) in request.headers.iter() {
            // reqwest derives the length from the attached body
            if request.body.is_some() && name.eq_ignore_ascii_case(CONTENT_LENGTH) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(format!("Request failed: {}", e)))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            TransportError::Network(format!("Failed to read response body: {}", e))
        })?;

        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }

    fn close(&self) {
        if self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!(egress = %self.label, "Closed egress");
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Builds reqwest clients, direct or tunnelled through a proxy
#[derive(Debug, Clone)]
pub struct ReqwestEgressFactory {
    timeout: Duration,
    user_agent: String,
}

impl ReqwestEgressFactory {
    pub fn new(timeout: Duration, user_agent: String) -> Self {
        Self {
            timeout,
            user_agent,
        }
    }
}

impl EgressFactory for ReqwestEgressFactory {
    fn direct(&self) -> Result<Arc<dyn Egress>, TransportError> {
        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| {
                TransportError::InvalidParameters(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Arc::new(ReqwestEgress::new(client, "direct".to_string())))
    }

    fn tunnel(&self, proxy: &ProxyDescriptor) -> Result<Arc<dyn Egress>, TransportError> {
        let upstream = Proxy::all(proxy.url())
            .map_err(|e| TransportError::Network(format!("Invalid proxy {}: {}", proxy, e)))?;

        // the upstream chain is not validated when tunnelling
        let client = Client::builder()
            .proxy(upstream)
            .danger_accept_invalid_certs(true)
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to open tunnel {}: {}", proxy, e)))?;

        Ok(Arc::new(ReqwestEgress::new(client, proxy.to_string())))
    }
}

pub const fn is_status_ok(status: u16) -> bool {
    status >= 200 && status < 300
}

/// Validate the response envelope and decode the expected shape
///
/// JSON bodies must carry `api:statuscode`; a non-zero code is an API error
/// regardless of the HTTP status. Non-JSON bodies are tolerated on success
/// statuses and decoded as a plain string (`null` when empty).
pub fn decode_response<T: DeserializeOwned>(
    status: u16,
    path: &str,
    body: &[u8],
) -> Result<T, TransportError> {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        if !is_status_ok(status) {
            return Err(TransportError::HttpStatus { status });
        }

        let text = String::from_utf8_lossy(body);
        trace!(path, status, "Plain-text response: {}", text);
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            Value::String(text.into_owned())
        };
        return serde_json::from_value(value).map_err(|e| {
            TransportError::Decode(format!("Failed to decode plain-text response: {}", e))
        });
    };

    let envelope = match Envelope::deserialize(&value) {
        Ok(envelope) => envelope,
        Err(_) if !is_status_ok(status) => return Err(TransportError::HttpStatus { status }),
        Err(e) => {
            return Err(TransportError::Decode(format!(
                "Response has no status envelope: {}",
                e
            )))
        }
    };

    info!(path, status_code = envelope.status_code, "API call completed");

    if envelope.status_code != 0 {
        return Err(TransportError::Api {
            code: envelope.status_code,
            message: envelope.message,
        });
    }

    serde_json::from_value(value)
        .map_err(|e| TransportError::Decode(format!("Failed to deserialize response: {}", e)))
}

/// Builder for `HttpTransport`
pub struct HttpTransportBuilder {
    config: ClientConfig,
    signer: Option<Arc<dyn Signer>>,
    provider: Option<(Arc<dyn SignatureProvider>, Arc<dyn ElapsedSource>)>,
    factory: Option<Arc<dyn EgressFactory>>,
}

impl HttpTransportBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            signer: None,
            provider: None,
            factory: None,
        }
    }

    /// Replace the message signer built from `ClientConfig::message_key`
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Replace the HTTP signing service client
    pub fn with_signature_service<S>(mut self, service: Arc<S>) -> Self
    where
        S: SignatureProvider + ElapsedSource + 'static,
    {
        let provider: Arc<dyn SignatureProvider> = service.clone();
        let elapsed: Arc<dyn ElapsedSource> = service;
        self.provider = Some((provider, elapsed));
        self
    }

    /// Replace the reqwest-based egress factory
    pub fn with_egress_factory(mut self, factory: Arc<dyn EgressFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let config = self.config;

        let signer = match self.signer {
            Some(signer) => signer,
            None => Arc::new(HmacSigner::new(
                config.message_key().to_string(),
                config.signature_prefix,
            )),
        };

        let (provider, elapsed) = match self.provider {
            Some(pair) => pair,
            None => {
                let service = Arc::new(ReqwestSignatureService::new(
                    config.signature_url.clone(),
                    config.api_key().to_string(),
                    config.timeout_seconds,
                )?);
                let provider: Arc<dyn SignatureProvider> = service.clone();
                let elapsed: Arc<dyn ElapsedSource> = service;
                (provider, elapsed)
            }
        };

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(ReqwestEgressFactory::new(
                Duration::from_secs(config.timeout_seconds),
                config.user_agent.clone(),
            ))
        });

        let direct = factory.direct()?;
        let mut pool = ProxyPool::from_strings(&config.proxies, factory);
        if pool.remaining() > 0 {
            pool.select_next();
        }

        Ok(HttpTransport {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            headers: RwLock::new(api_headers(&config.user_agent, &config.device_id)),
            composer: HeaderComposer::new(signer, provider.clone()),
            provider,
            elapsed,
            direct,
            pool: Mutex::new(pool),
        })
    }
}

/// Signed HTTP transport with proxy failover
///
/// Owns the session's header state and the proxy pool. Calls are independent
/// and may run concurrently; only proxy rotation takes the pool lock.
pub struct HttpTransport {
    base_url: String,
    headers: RwLock<HeaderSet>,
    composer: HeaderComposer,
    provider: Arc<dyn SignatureProvider>,
    elapsed: Arc<dyn ElapsedSource>,
    direct: Arc<dyn Egress>,
    pool: Mutex<ProxyPool>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("pool", &*self.lock_pool())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn builder(config: ClientConfig) -> HttpTransportBuilder {
        HttpTransportBuilder::new(config)
    }

    /// Snapshot of the current session headers
    pub fn headers(&self) -> HeaderSet {
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(str::to_string)
    }

    /// Merge `headers` into the session headers
    pub fn set_headers(&self, headers: &HeaderSet) {
        self.headers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(headers);
    }

    /// Install the authentication headers of an account (fresh login or cache hit)
    pub fn install_account(&self, account: &Account) {
        let headers: HeaderSet = [
            (AUID, account.user.uid.clone()),
            (NDC_DEVICE_ID, account.device_id.clone()),
            (NDC_AUTH, account.auth_header()),
        ]
        .into_iter()
        .collect();
        self.set_headers(&headers);
        info!(uid = %account.user.uid, "Installed session headers");
    }

    pub fn composer(&self) -> &HeaderComposer {
        &self.composer
    }

    pub fn proxies_remaining(&self) -> usize {
        self.lock_pool().remaining()
    }

    pub fn has_tunnel(&self) -> bool {
        self.lock_pool().has_active()
    }

    pub async fn public_key_credentials(&self, user_id: &str) -> Result<Value, TransportError> {
        self.provider.public_key_credentials(user_id).await
    }

    #[instrument(skip(self), fields(method = %method, path = %path))]
    pub async fn send_raw<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        headers: HeaderSet,
        body: Option<Vec<u8>>,
    ) -> Result<T, TransportError> {
        self.execute(&RequestConfig::Raw {
            method,
            path: path.to_string(),
            headers,
            body,
        })
        .await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn send_get<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        self.execute(&RequestConfig::get(path)).await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn send_delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        self.execute(&RequestConfig::delete(path)).await
    }

    /// POST carrying both the message signature and the remote signature
    #[instrument(skip(self, body), fields(path = %path))]
    pub async fn send_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: impl Into<Vec<u8>> + Send,
        content_type: Option<&str>,
    ) -> Result<T, TransportError> {
        self.execute(&RequestConfig::Post {
            path: path.to_string(),
            body: body.into(),
            content_type: content_type.map(str::to_string),
            signature: SignatureMode::Remote,
        })
        .await
    }

    /// POST carrying only the message signature, usable before a session exists
    #[instrument(skip(self, body), fields(path = %path))]
    pub async fn send_early_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: impl Into<Vec<u8>> + Send,
        content_type: Option<&str>,
    ) -> Result<T, TransportError> {
        self.execute(&RequestConfig::Post {
            path: path.to_string(),
            body: body.into(),
            content_type: content_type.map(str::to_string),
            signature: SignatureMode::MessageOnly,
        })
        .await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn send_url_encoded<T: DeserializeOwned>(
        &self,
        path: &str,
        content_type: Option<&str>,
    ) -> Result<T, TransportError> {
        self.execute(&RequestConfig::url_encoded(path, content_type))
            .await
    }

    #[instrument(skip(self, body), fields(path = %path, size = body.len()))]
    pub async fn send_buffer<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<T, TransportError> {
        self.execute(&RequestConfig::buffer(path, body, content_type))
            .await
    }

    /// Issue `config`, rotating proxies on network failures until the pool runs out
    pub async fn execute<T: DeserializeOwned>(
        &self,
        config: &RequestConfig,
    ) -> Result<T, TransportError> {
        loop {
            let (egress, generation) = self.current_egress();

            match self.attempt(egress.as_ref(), config).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.fail_over(&err, generation) {
                        return Err(err);
                    }
                    debug!(path = config.path(), "Re-issuing call through a new egress");
                }
            }
        }
    }

    fn current_egress(&self) -> (Arc<dyn Egress>, Option<u64>) {
        match self.lock_pool().active() {
            Some((egress, generation)) => (egress, Some(generation)),
            None => (self.direct.clone(), None),
        }
    }

    /// Whether a failed attempt should be re-issued
    fn fail_over(&self, err: &TransportError, used: Option<u64>) -> bool {
        if !err.is_network() {
            return false;
        }
        let Some(used) = used else {
            return false;
        };

        let mut pool = self.lock_pool();
        match pool.active() {
            None => false,
            Some((_, current)) if current != used => true,
            Some(_) if pool.remaining() > 0 => {
                warn!("Egress failed: {}", err);
                pool.select_next().is_some()
            }
            Some(_) => {
                warn!("Egress failed with an exhausted pool: {}", err);
                pool.drop_active();
                false
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        egress: &dyn Egress,
        config: &RequestConfig,
    ) -> Result<T, TransportError> {
        let request = self.prepare(config).await?;
        let path = request.url.clone();

        trace!(egress = egress.label(), url = %path, "Dispatching request");
        let response = egress.dispatch(request).await?;

        decode_response(response.status, &path, &response.body)
    }

    async fn prepare(&self, config: &RequestConfig) -> Result<OutboundRequest, TransportError> {
        let base = self.headers();

        let (headers, body) = match config {
            RequestConfig::Raw { headers, body, .. } => (base.merged(headers), body.clone()),
            RequestConfig::Get { content_type, .. } => {
                let mut headers = base;
                if let Some(content_type) = content_type {
                    headers.set(CONTENT_TYPE, content_type.as_str());
                }
                (headers, None)
            }
            RequestConfig::Delete { .. } => (base, None),
            RequestConfig::Post {
                body,
                content_type,
                signature: SignatureMode::Remote,
                ..
            } => {
                let headers = self
                    .composer
                    .compose_with_remote_signature(&base, body, content_type.as_deref())
                    .await?;
                (headers, Some(body.clone()))
            }
            RequestConfig::Post {
                body,
                content_type,
                signature: SignatureMode::MessageOnly,
                ..
            }
            | RequestConfig::Buffer {
                body, content_type, ..
            } => {
                let headers = self
                    .composer
                    .compose(&base, body, content_type.as_deref())?;
                (headers, Some(body.clone()))
            }
            RequestConfig::UrlEncoded { content_type, .. } => {
                let headers = self.composer.compose(&base, &[], content_type.as_deref())?;
                (headers, Some(Vec::new()))
            }
        };

        Ok(OutboundRequest {
            method: config.method(),
            url: self.build_url(config.path()),
            headers,
            body,
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn lock_pool(&self) -> MutexGuard<'_, ProxyPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ElapsedSource for HttpTransport {
    async fn elapsed_realtime(&self) -> Result<u64, TransportError> {
        self.elapsed.elapsed_realtime().await
    }
}
