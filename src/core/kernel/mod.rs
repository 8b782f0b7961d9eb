/// `ndclink` Kernel - transport layer for the platform's HTTP and realtime APIs
///
/// The kernel holds transport logic and the trait seams it is built on. It has
/// no knowledge of business endpoints or event payloads beyond the response
/// envelope.
///
/// # Architecture
///
/// ## Transport Layer
/// - `HttpTransport`: signed HTTP calls with envelope validation and proxy failover
/// - `Egress` / `EgressFactory`: one network path (direct pool or proxy tunnel)
/// - `ProxyPool`: single-use egress proxies, at most one open tunnel
/// - `WsSession`: WebSocket connection management
///
/// ## Authentication
/// - `Signer` / `HmacSigner`: symmetric `NDC-MSG-SIG` signature
/// - `SignatureProvider`: remote ECDSA `NDC-MESSAGE-SIGNATURE`
/// - `HeaderComposer`: per-request header sets
///
/// ## Message Handling
/// - `WsCodec`: realtime frame encoding/decoding
///
/// # Usage
/// ```rust,no_run
/// use ndclink::core::config::ClientConfig;
/// use ndclink::core::kernel::HttpTransport;
/// use serde_json::Value;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new(
///     "api_key".to_string(),
///     "message_key".to_string(),
///     "device_id".to_string(),
///     "https://signer.example".to_string(),
/// );
/// let transport = HttpTransport::builder(config).build()?;
///
/// let account: Value = transport.send_get("/g/s/account").await?;
/// # Ok(())
/// # }
/// ```
pub mod codec;
#[cfg(test)]
pub(crate) mod fakes;
pub mod headers;
pub mod proxy;
pub mod rest;
pub mod signature;
pub mod signer;
pub mod ws;

// Re-export key types for convenience
pub use codec::WsCodec;
pub use headers::HeaderComposer;
pub use proxy::{ProxyDescriptor, ProxyPool, ProxyScheme};
pub use rest::{
    decode_response, Egress, EgressFactory, HttpTransport, HttpTransportBuilder, OutboundRequest,
    RawResponse, ReqwestEgress, ReqwestEgressFactory,
};
pub use signature::{ElapsedSource, ReqwestSignatureService, SignatureProvider};
pub use signer::{HmacSigner, Signer};
pub use ws::{HandshakeRequest, TungsteniteWs, WsSession};
