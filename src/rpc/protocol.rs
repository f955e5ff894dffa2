//! Messages exchanged between the cache and its crypto engine.

use bytes::Bytes;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::cipher::{CipherError, EncryptedPayload};
use crate::error::CacheError;

/// Requests sent to the crypto engine.
pub enum WorkerRequest {
    /// Handshake. Must be the first message; the engine derives its key before replying.
    Initialize {
        secret: Zeroizing<Vec<u8>>,
        generation_tag: String,
        iterations: u32,
    },
    Encrypt {
        request_id: Uuid,
        plaintext: Bytes,
    },
    Decrypt {
        request_id: Uuid,
        iv: Bytes,
        ciphertext: Bytes,
    },
    /// Wipe key material and stop.
    Destroy,
}

impl std::fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRequest::Initialize {
                generation_tag,
                iterations,
                ..
            } => f
                .debug_struct("Initialize")
                .field("secret", &"[REDACTED]")
                .field("generation_tag", generation_tag)
                .field("iterations", iterations)
                .finish(),
            WorkerRequest::Encrypt {
                request_id,
                plaintext,
            } => f
                .debug_struct("Encrypt")
                .field("request_id", request_id)
                .field("len", &plaintext.len())
                .finish(),
            WorkerRequest::Decrypt {
                request_id,
                ciphertext,
                ..
            } => f
                .debug_struct("Decrypt")
                .field("request_id", request_id)
                .field("len", &ciphertext.len())
                .finish(),
            WorkerRequest::Destroy => f.write_str("Destroy"),
        }
    }
}

/// Failure categories reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoErrorKind {
    KeyDerivation,
    Encryption,
    Decryption,
    NotInitialized,
    /// A second handshake arrived; the first key stays in place.
    AlreadyInitialized,
}

impl From<&CipherError> for CryptoErrorKind {
    fn from(err: &CipherError) -> Self {
        match err {
            CipherError::Seal => CryptoErrorKind::Encryption,
            CipherError::InvalidIv(_) | CipherError::Open => CryptoErrorKind::Decryption,
        }
    }
}

impl CryptoErrorKind {
    /// Map an engine-reported failure onto the public error taxonomy.
    pub fn into_cache_error(self, message: String) -> CacheError {
        match self {
            CryptoErrorKind::KeyDerivation
            | CryptoErrorKind::NotInitialized
            | CryptoErrorKind::AlreadyInitialized => {
                CacheError::WorkerInitializationFailed(message)
            }
            CryptoErrorKind::Encryption => CacheError::EncryptionFailed(message),
            CryptoErrorKind::Decryption => CacheError::DecryptionFailed(message),
        }
    }
}

/// Responses from the crypto engine.
#[derive(Debug)]
pub enum WorkerResponse {
    Ready,
    InitError {
        kind: CryptoErrorKind,
        message: String,
    },
    EncryptResult {
        request_id: Uuid,
        payload: EncryptedPayload,
    },
    DecryptResult {
        request_id: Uuid,
        plaintext: Bytes,
    },
    Error {
        request_id: Uuid,
        kind: CryptoErrorKind,
        message: String,
    },
}

impl WorkerResponse {
    /// Failure reply for a cipher error.
    pub fn cipher_failure(request_id: Uuid, err: CipherError) -> Self {
        WorkerResponse::Error {
            request_id,
            kind: CryptoErrorKind::from(&err),
            message: err.to_string(),
        }
    }

    /// Correlation id, for responses that answer a specific request.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            WorkerResponse::EncryptResult { request_id, .. }
            | WorkerResponse::DecryptResult { request_id, .. }
            | WorkerResponse::Error { request_id, .. } => Some(*request_id),
            WorkerResponse::Ready | WorkerResponse::InitError { .. } => None,
        }
    }
}
