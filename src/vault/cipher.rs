//! AES-256-GCM sealing for vault blobs.
//!
//! Blob layout: `version (1 byte) | nonce (12 bytes) | ciphertext + tag`.
//! Every seal draws a fresh random nonce.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const VERSION: u8 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("key must be 32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("encryption failed")]
    Encrypt,

    /// Wrong key or tampered data
    #[error("authentication failed")]
    Decrypt,

    #[error("invalid blob: {0}")]
    Format(String),
}

/// Generate a new random 256-bit key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub struct VaultCipher {
    cipher: Aes256Gcm,
}

impl VaultCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, CipherError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKey(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(VERSION);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        if blob.len() < 1 + NONCE_LEN {
            return Err(CipherError::Format(format!("{} bytes is too short", blob.len())));
        }
        if blob[0] != VERSION {
            return Err(CipherError::Format(format!("unsupported version {}", blob[0])));
        }
        let nonce = Nonce::from_slice(&blob[1..1 + NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &blob[1 + NONCE_LEN..])
            .map_err(|_| CipherError::Decrypt)
    }

    /// Seal a string and encode the blob as base64.
    pub fn seal_text(&self, text: &str) -> Result<String, CipherError> {
        Ok(BASE64.encode(self.seal(text.as_bytes())?))
    }

    pub fn open_text(&self, encoded: &str) -> Result<String, CipherError> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| CipherError::Format(e.to_string()))?;
        let plain = self.open(&blob)?;
        String::from_utf8(plain).map_err(|e| CipherError::Format(e.to_string()))
    }
}

impl std::fmt::Debug for VaultCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultCipher").field("key", &"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = VaultCipher::from_key(&generate_key()).unwrap();
        let blob = cipher.seal(b"hunter2").unwrap();
        assert_eq!(blob[0], VERSION);
        assert_eq!(cipher.open(&blob).unwrap(), b"hunter2");
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let cipher = VaultCipher::from_key(&generate_key()).unwrap();
        assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let cipher = VaultCipher::from_key(&generate_key()).unwrap();
        let mut blob = cipher.seal(b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(cipher.open(&blob), Err(CipherError::Decrypt));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = VaultCipher::from_key(&generate_key()).unwrap();
        let b = VaultCipher::from_key(&generate_key()).unwrap();
        let sealed = a.seal_text("pw").unwrap();
        assert_eq!(b.open_text(&sealed), Err(CipherError::Decrypt));
        assert_eq!(a.open_text(&sealed).unwrap(), "pw");
    }

    #[test]
    fn test_bad_inputs() {
        assert_eq!(VaultCipher::from_key(&[0u8; 16]).err(), Some(CipherError::InvalidKey(16)));
        let cipher = VaultCipher::from_key(&generate_key()).unwrap();
        assert!(matches!(cipher.open(&[1, 2, 3]), Err(CipherError::Format(_))));
        assert!(matches!(cipher.open_text("not base64!"), Err(CipherError::Format(_))));
    }
}
