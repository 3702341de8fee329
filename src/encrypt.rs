//! At-rest encryption for stored provider credentials (AES-256-GCM).
//! Ciphertext layout: 12 byte nonce followed by the sealed bytes.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EncryptError {
    #[error("Encryption key must be 32 bytes of hex")]
    InvalidKey,
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
    #[error("Ciphertext too short")]
    TooShort,
    #[error("Decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Clone)]
pub struct KeyCipher {
    cipher: Aes256Gcm,
}

impl KeyCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, EncryptError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|_| EncryptError::InvalidKey)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| EncryptError::InvalidKey)?;
        Ok(Self::new(&key))
    }

    pub fn encrypt_string(&self, plaintext: &str) -> Result<Vec<u8>, EncryptError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| EncryptError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt_string(&self, data: &[u8]) -> Result<String, EncryptError> {
        if data.len() <= NONCE_LEN {
            return Err(EncryptError::TooShort);
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| EncryptError::Decrypt)?;
        String::from_utf8(plain).map_err(|_| EncryptError::InvalidUtf8)
    }
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher").field("key", &"[REDACTED]").finish()
    }
}
