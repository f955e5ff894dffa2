//! Crypto engine: an isolated execution context that owns the key.
//!
//! The engine runs on its own OS thread with a private single-threaded
//! runtime. It talks to the cache only through the request / response
//! channels of a [`WorkerEnd`]; the derived key never leaves this module.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::cipher::ChunkCipher;
use crate::crypto::keys::KeyCache;
use crate::crypto::queue::AdaptiveQueue;
use crate::rpc::channel::WorkerEnd;
use crate::rpc::protocol::{CryptoErrorKind, WorkerRequest, WorkerResponse};

/// Name of the engine's OS thread.
pub const ENGINE_THREAD_NAME: &str = "sealed-cache-crypto";

/// Start the crypto engine on a dedicated thread.
///
/// Fails if the engine's runtime or thread cannot be created.
pub fn spawn_engine(end: WorkerEnd) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name(ENGINE_THREAD_NAME.to_string())
        .spawn(move || runtime.block_on(run_engine(end)))?;
    Ok(())
}

/// Serve requests until `Destroy` arrives or the request channel closes.
pub async fn run_engine(end: WorkerEnd) {
    let WorkerEnd {
        mut requests,
        responses,
    } = end;

    let keys = Arc::new(Mutex::new(KeyCache::default()));
    let queue = AdaptiveQueue::spawn();
    let mut cipher: Option<ChunkCipher> = None;

    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Initialize {
                secret,
                generation_tag,
                iterations,
            } => {
                if cipher.is_some() {
                    warn!("Ignoring repeated crypto engine handshake");
                    let _ = responses.send(WorkerResponse::InitError {
                        kind: CryptoErrorKind::AlreadyInitialized,
                        message: "crypto engine is already initialized".to_string(),
                    });
                    continue;
                }
                let response = initialize(&keys, secret, generation_tag, iterations).await;
                match response {
                    Ok(c) => {
                        cipher = Some(c);
                        let _ = responses.send(WorkerResponse::Ready);
                    }
                    Err(message) => {
                        let _ = responses.send(WorkerResponse::InitError {
                            kind: CryptoErrorKind::KeyDerivation,
                            message,
                        });
                    }
                }
            }
            WorkerRequest::Encrypt {
                request_id,
                plaintext,
            } => {
                let Some(c) = cipher.clone() else {
                    reply_not_initialized(&responses, request_id);
                    continue;
                };
                let tx = responses.clone();
                let accepted = queue.submit(Box::new(move || {
                    let response = match c.encrypt(&plaintext) {
                        Ok(payload) => WorkerResponse::EncryptResult {
                            request_id,
                            payload,
                        },
                        Err(e) => WorkerResponse::cipher_failure(request_id, e),
                    };
                    let _ = tx.send(response);
                }));
                if !accepted {
                    warn!(%request_id, "Crypto queue closed, dropping encrypt request");
                }
            }
            WorkerRequest::Decrypt {
                request_id,
                iv,
                ciphertext,
            } => {
                let Some(c) = cipher.clone() else {
                    reply_not_initialized(&responses, request_id);
                    continue;
                };
                let tx = responses.clone();
                let accepted = queue.submit(Box::new(move || {
                    let response = match c.decrypt(&iv, &ciphertext) {
                        Ok(plaintext) => WorkerResponse::DecryptResult {
                            request_id,
                            plaintext: Bytes::from(plaintext),
                        },
                        Err(e) => WorkerResponse::cipher_failure(request_id, e),
                    };
                    let _ = tx.send(response);
                }));
                if !accepted {
                    warn!(%request_id, "Crypto queue closed, dropping decrypt request");
                }
            }
            WorkerRequest::Destroy => {
                debug!("Crypto engine received destroy");
                break;
            }
        }
    }

    queue.close();
    keys.lock().clear();
    drop(cipher);

    let stats = queue.stats();
    info!(
        completed = stats.total_completed,
        increases = stats.limit_increases,
        decreases = stats.limit_decreases,
        "Crypto engine stopped"
    );
}

async fn initialize(
    keys: &Arc<Mutex<KeyCache>>,
    secret: zeroize::Zeroizing<Vec<u8>>,
    generation_tag: String,
    iterations: u32,
) -> Result<ChunkCipher, String> {
    if iterations == 0 {
        return Err("iteration count must be greater than zero".to_string());
    }
    let keys = keys.clone();
    let derived = tokio::task::spawn_blocking(move || {
        keys.lock()
            .get_or_derive(&secret, generation_tag.as_bytes(), iterations)
    })
    .await
    .map_err(|e| format!("key derivation task failed: {e}"))?;
    Ok(ChunkCipher::new(&derived))
}

fn reply_not_initialized(
    responses: &mpsc::UnboundedSender<WorkerResponse>,
    request_id: uuid::Uuid,
) {
    let _ = responses.send(WorkerResponse::Error {
        request_id,
        kind: CryptoErrorKind::NotInitialized,
        message: "crypto engine has not been initialized".to_string(),
    });
}
