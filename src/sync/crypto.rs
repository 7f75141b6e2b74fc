//! Opaque encrypt/decrypt capability for RPC payloads.
//!
//! Ciphertext layout: `[variant byte][12-byte nonce][AES-256-GCM output]`.
//! Only the data-key variant is produced or accepted here; legacy payloads
//! are recognised by their variant byte and rejected.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{AppError, Result};

const NONCE_LEN: usize = 12;

/// Leading byte of an encrypted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionVariant {
    /// Secretbox-era payloads. Not supported by this cipher.
    Legacy,
    /// AES-256-GCM under the machine's data key.
    DataKey,
}

impl EncryptionVariant {
    /// Wire byte.
    #[must_use]
    pub fn byte(self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::DataKey => 1,
        }
    }

    /// Variant for a wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Legacy),
            1 => Some(Self::DataKey),
            _ => None,
        }
    }
}

/// Symmetric cipher keyed by the machine's shared secret.
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` if encryption fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt `ciphertext`; `None` if it is malformed, of an unsupported
    /// variant, or fails authentication.
    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>>;
}

/// AES-256-GCM implementation of [`Cipher`].
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Cipher keyed by `secret`.
    #[must_use]
    pub fn new(secret: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(secret);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| AppError::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        out.push(EncryptionVariant::DataKey.byte());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let (&variant, rest) = ciphertext.split_first()?;
        match EncryptionVariant::from_byte(variant) {
            Some(EncryptionVariant::DataKey) => {}
            other => {
                debug!(?other, "unsupported payload variant");
                return None;
            }
        }
        if rest.len() < NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .ok()
    }
}

/// Serialize `value`, encrypt it, and base64 the result.
///
/// # Errors
///
/// Returns `AppError::Crypto` if serialization or encryption fails.
pub fn encrypt_json<T: Serialize>(cipher: &dyn Cipher, value: &T) -> Result<String> {
    let plain = serde_json::to_vec(value)
        .map_err(|err| AppError::Crypto(format!("failed to serialize payload: {err}")))?;
    Ok(STANDARD.encode(cipher.encrypt(&plain)?))
}

/// Reverse of [`encrypt_json`].
///
/// # Errors
///
/// Returns `AppError::Crypto` if the payload is not base64, cannot be
/// decrypted, or does not deserialize into `T`.
pub fn decrypt_json<T: DeserializeOwned>(cipher: &dyn Cipher, encoded: &str) -> Result<T> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|err| AppError::Crypto(format!("payload is not base64: {err}")))?;
    let plain = cipher
        .decrypt(&raw)
        .ok_or_else(|| AppError::Crypto("payload could not be decrypted".into()))?;
    serde_json::from_slice(&plain)
        .map_err(|err| AppError::Crypto(format!("decrypted payload is not valid json: {err}")))
}
