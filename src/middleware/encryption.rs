//! AES-256-GCM encryption stage.
//!
//! Each message gets a fresh random 96-bit nonce; the wire form is
//! `nonce (12 bytes) || ciphertext+tag`. Output is binary, so pair it with
//! [`Base64Middleware`](super::Base64Middleware) after it.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::{Middleware, MiddlewareError, Next};

const NONCE_LEN: usize = 12;
const STAGE: &str = "encryption";

/// Symmetric encryption with a pre-shared 256-bit key.
#[derive(Clone)]
pub struct EncryptionMiddleware {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EncryptionMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionMiddleware").finish_non_exhaustive()
    }
}

impl EncryptionMiddleware {
    /// Create the stage from raw key bytes.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Create the stage from a base64-encoded 32-byte key.
    pub fn from_base64_key(encoded: &str) -> Result<Self, MiddlewareError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| MiddlewareError::transform(STAGE, format!("invalid key encoding: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            MiddlewareError::transform(STAGE, format!("key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::new(key))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, MiddlewareError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| MiddlewareError::transform(STAGE, format!("encrypt failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, MiddlewareError> {
        if sealed.len() < NONCE_LEN {
            return Err(MiddlewareError::rejected(
                STAGE,
                format!("payload too short: {} bytes", sealed.len()),
            ));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| MiddlewareError::rejected(STAGE, format!("decrypt failed: {e}")))
    }
}

#[async_trait]
impl Middleware for EncryptionMiddleware {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn on_send(&self, payload: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>, MiddlewareError> {
        let sealed = self.seal(&payload)?;
        next.run(sealed).await
    }

    async fn on_receive(
        &self,
        payload: Vec<u8>,
        next: Next<'_>,
    ) -> Result<Vec<u8>, MiddlewareError> {
        let opened = self.open(&payload)?;
        next.run(opened).await
    }
}
