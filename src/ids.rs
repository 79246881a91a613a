//! Opaque document identifiers.
//!
//! Row ids never leave the server in the clear. Each id is encrypted with
//! AES-256-GCM under a random nonce, and the token is `nonce || ciphertext`
//! in URL-safe base64 without padding. Encrypting the same id twice yields
//! different tokens; both decrypt to the same id.

use crate::error::PipelineError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use std::fmt;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct IdCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for IdCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdCipher(<redacted>)")
    }
}

impl IdCipher {
    /// Build from a raw 32-byte key.
    pub fn from_key_bytes(key_bytes: &[u8]) -> Result<Self, PipelineError> {
        if key_bytes.len() != 32 {
            return Err(PipelineError::Misconfigured(format!(
                "document id key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Build from a standard base64 encoding of a 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, PipelineError> {
        let key_bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| PipelineError::Misconfigured(format!("document id key is not base64: {e}")))?;
        Self::from_key_bytes(&key_bytes)
    }

    pub fn encrypt(&self, id: i64) -> Result<String, PipelineError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, id.to_string().as_bytes())
            .map_err(|e| PipelineError::Internal(format!("id encryption failed: {e}")))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(combined))
    }

    /// Recover the row id. Every failure (bad base64, short input, failed
    /// authentication, non-numeric plaintext) is [`PipelineError::InvalidIdentifier`].
    pub fn decrypt(&self, token: &str) -> Result<i64, PipelineError> {
        let combined = general_purpose::URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| PipelineError::InvalidIdentifier)?;
        if combined.len() <= NONCE_LEN {
            return Err(PipelineError::InvalidIdentifier);
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PipelineError::InvalidIdentifier)?;

        std::str::from_utf8(&plaintext)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(PipelineError::InvalidIdentifier)
    }
}
