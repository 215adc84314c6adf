//! Symmetric encryption for third-party credentials at rest.
//!
//! Ciphertexts are laid out as `nonce (12 bytes) || AES-256-GCM ciphertext`.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be base64 encoding of {KEY_LEN} bytes")]
    InvalidKey,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or tampered data)")]
    Decrypt,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn from_base64(key: &SecretString) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(key.expose_secret().trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        Self::new(&bytes)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CryptoError> {
        let raw = serde_json::to_vec(value)?;
        self.encrypt(&raw)
    }

    pub fn decrypt_json<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CryptoError> {
        let raw = self.decrypt(data)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn rejects_short_keys() {
        assert!(matches!(
            CredentialCipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKey)
        ));
        let bad = SecretString::from("not base64!!");
        assert!(CredentialCipher::from_base64(&bad).is_err());
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let c = cipher();
        let a = c.encrypt(b"xoxb-token").unwrap();
        let b = c.encrypt(b"xoxb-token").unwrap();
        assert_ne!(a, b);
        assert_eq!(c.decrypt(&a).unwrap(), b"xoxb-token");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let c = cipher();
        let mut data = c.encrypt(b"secret").unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(matches!(c.decrypt(&data), Err(CryptoError::Decrypt)));
        assert!(matches!(c.decrypt(&data[..4]), Err(CryptoError::Truncated)));
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let data = cipher().encrypt(b"secret").unwrap();
        let other = CredentialCipher::new(&[9u8; KEY_LEN]).unwrap();
        assert!(other.decrypt(&data).is_err());
    }
}
