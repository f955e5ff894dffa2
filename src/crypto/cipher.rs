//! AES-256-GCM sealing of individual chunks.
//!
//! The key schedule is wiped when the last handle to a cipher drops.

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use bytes::Bytes;
use thiserror::Error;

use crate::crypto::keys::DerivedKey;

/// GCM nonce length in bytes.
pub const IV_LEN: usize = 12;

/// GCM authentication tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed")]
    Seal,

    #[error("invalid IV length: expected {IV_LEN}, got {0}")]
    InvalidIv(usize),

    #[error("authentication failed")]
    Open,
}

/// A sealed chunk: fresh random IV plus ciphertext-with-tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub iv: Bytes,
    pub ciphertext: Bytes,
}

/// Cipher bound to one derived key. Clones share a single key schedule.
#[derive(Clone)]
pub struct ChunkCipher {
    aead: Arc<Aes256Gcm>,
}

impl ChunkCipher {
    pub fn new(key: &DerivedKey) -> Self {
        Self {
            aead: Arc::new(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))),
        }
    }

    /// Seal `plaintext` under a freshly generated IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Seal)?;
        Ok(EncryptedPayload {
            iv: Bytes::copy_from_slice(nonce.as_slice()),
            ciphertext: Bytes::from(ciphertext),
        })
    }

    /// Open a sealed chunk, verifying its tag.
    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        if iv.len() != IV_LEN {
            return Err(CipherError::InvalidIv(iv.len()));
        }
        self.aead
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| CipherError::Open)
    }
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChunkCipher([REDACTED])")
    }
}
