use crate::core::errors::TransportError;
use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;

/// Signer trait for the symmetric message signature
///
/// Implementations must sign the exact bytes that go on the wire; the
/// platform rejects a request whose `NDC-MSG-SIG` was computed over anything
/// else (a re-serialized body, a trimmed body, ...).
pub trait Signer: Send + Sync {
    fn sign(&self, payload: &[u8]) -> Result<String, TransportError>;
}

/// HMAC-SHA256 signer producing `base64(prefix || mac)`
pub struct HmacSigner {
    key: Secret<String>,
    prefix: u8,
}

impl HmacSigner {
    /// Create a new HMAC signer
    ///
    /// # Arguments
    /// * `key` - Shared signing key
    /// * `prefix` - Version byte prepended to the digest
    pub fn new(key: String, prefix: u8) -> Self {
        Self {
            key: Secret::new(key),
            prefix,
        }
    }
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Signer for HmacSigner {
    fn sign(&self, payload: &[u8]) -> Result<String, TransportError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.expose_secret().as_bytes())
            .map_err(|e| TransportError::SigningProvider(format!("Invalid message key: {}", e)))?;

        mac.update(payload);
        let digest = mac.finalize().into_bytes();

        let mut signed = Vec::with_capacity(digest.len() + 1);
        signed.push(self.prefix);
        signed.extend_from_slice(&digest);

        Ok(general_purpose::STANDARD.encode(signed))
    }
}
