//! Sealing for the encrypted vault namespace.
//!
//! Vault values are encrypted with ChaCha20-Poly1305. The 32-byte key comes
//! from the platform keystore, which is an external collaborator; this
//! module never generates or persists keys itself.

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::kv::StorageError;

/// Nonce length for ChaCha20-Poly1305 (12 bytes), prefixed to the ciphertext.
pub const NONCE_LEN: usize = 12;

/// Vault key length (32 bytes).
pub const KEY_LEN: usize = 32;

/// Seals and opens vault values.
pub trait VaultCipher: Send + Sync {
    /// Encrypt a plaintext value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Crypto` if encryption fails.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Decrypt a sealed value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Crypto` if the payload is truncated, has been
    /// tampered with, or was sealed under a different key.
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StorageError>;
}

/// ChaCha20-Poly1305 cipher with a fresh random nonce per seal.
pub struct ChaChaVaultCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaVaultCipher {
    #[must_use]
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl VaultCipher for ChaChaVaultCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StorageError> {
        if sealed.len() < NONCE_LEN {
            return Err(StorageError::Crypto("sealed payload too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| StorageError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ChaChaVaultCipher {
        ChaChaVaultCipher::new(&[7u8; KEY_LEN])
    }

    #[test]
    fn seal_open_roundtrip() {
        let c = cipher();
        let sealed = c.seal(b"receipt blob").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"receipt blob".as_slice());
        assert_eq!(c.open(&sealed).unwrap(), b"receipt blob");
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let c = cipher();
        let a = c.seal(b"same").unwrap();
        let b = c.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_payload_fails_to_open() {
        let c = cipher();
        let mut sealed = c.seal(b"receipt blob").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(c.open(&sealed), Err(StorageError::Crypto(_))));
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = cipher().seal(b"receipt blob").unwrap();
        let other = ChaChaVaultCipher::new(&[8u8; KEY_LEN]);
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(matches!(
            cipher().open(&[1, 2, 3]),
            Err(StorageError::Crypto(_))
        ));
    }
}
