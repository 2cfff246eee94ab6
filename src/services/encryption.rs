use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use std::borrow::Cow;

/// Marker written in front of sealed objects by the upload side.
const SEALED_MAGIC: &[u8] = b"IIENC1";
const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for documents stored encrypted at rest.
///
/// Sealed layout: `IIENC1 || nonce (12 bytes) || ciphertext`. Objects without
/// the marker predate encryption and pass through untouched.
pub struct EncryptionService {
    cipher: Aes256Gcm,
}

impl EncryptionService {
    /// Create from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self, EncryptionError> {
        use base64::Engine;
        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|_| EncryptionError::InvalidKey)?;

        if key_bytes.len() != 32 {
            return Err(EncryptionError::InvalidKey);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| EncryptionError::InvalidKey)?;

        Ok(Self { cipher })
    }

    /// Decrypt a sealed object; unsealed input is returned as-is.
    pub fn open<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>, EncryptionError> {
        let Some(body) = data.strip_prefix(SEALED_MAGIC) else {
            return Ok(Cow::Borrowed(data));
        };
        if body.len() < NONCE_LEN {
            return Err(EncryptionError::DecryptFailed);
        }

        let (nonce_bytes, ciphertext) = body.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map(Cow::Owned)
            .map_err(|_| EncryptionError::DecryptFailed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("Invalid encryption key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Decryption failed")]
    DecryptFailed,
}
