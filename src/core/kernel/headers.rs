use crate::core::errors::TransportError;
use crate::core::kernel::signature::SignatureProvider;
use crate::core::kernel::signer::Signer;
use crate::core::types::{HeaderSet, AUID, CONTENT_LENGTH, CONTENT_TYPE, NDC_MESSAGE_SIGNATURE, NDC_MSG_SIG};
use std::sync::Arc;
use tracing::debug;

/// Builds per-request header sets on top of the session's base headers
#[derive(Clone)]
pub struct HeaderComposer {
    signer: Arc<dyn Signer>,
    provider: Arc<dyn SignatureProvider>,
}

impl HeaderComposer {
    pub fn new(signer: Arc<dyn Signer>, provider: Arc<dyn SignatureProvider>) -> Self {
        Self { signer, provider }
    }

    /// Base headers plus content length, content type and the message signature over `body`
    pub fn compose(
        &self,
        base: &HeaderSet,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<HeaderSet, TransportError> {
        let mut headers = base.clone();
        headers.set(CONTENT_LENGTH, body.len().to_string());
        headers.set(NDC_MSG_SIG, self.signer.sign(body)?);

        if let Some(content_type) = content_type {
            headers.set(CONTENT_TYPE, content_type);
        }

        Ok(headers)
    }

    /// `compose` plus the remote ECDSA signature for the session's user
    pub async fn compose_with_remote_signature(
        &self,
        base: &HeaderSet,
        body: &[u8],
        content_type: Option<&str>,
    ) -> Result<HeaderSet, TransportError> {
        let mut headers = self.compose(base, body, content_type)?;

        let user_id = base.get(AUID).unwrap_or_default();
        let payload = String::from_utf8_lossy(body);
        let signature = self.provider.ecdsa(&payload, user_id).await?;

        if signature.is_empty() {
            return Err(TransportError::SigningProvider(
                "signing service returned an empty signature".to_string(),
            ));
        }

        debug!(user_id, "Attached remote signature");
        headers.set(NDC_MESSAGE_SIGNATURE, signature);
        Ok(headers)
    }

    /// Sign an arbitrary payload with the message signer (realtime handshake)
    pub fn sign(&self, payload: &[u8]) -> Result<String, TransportError> {
        self.signer.sign(payload)
    }
}
