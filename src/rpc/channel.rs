//! Request/response correlation over the crypto engine's message channels.
//!
//! Every request carries a fresh id and gets its own timeout. A background pump
//! routes responses to the pending entry with the matching id. When the engine
//! goes away, every pending caller is rejected rather than left hanging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::cipher::EncryptedPayload;
use crate::error::CacheError;
use crate::rpc::protocol::{WorkerRequest, WorkerResponse};

/// Cache side of the engine link.
pub struct WorkerLink {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub responses: mpsc::UnboundedReceiver<WorkerResponse>,
}

/// Engine side of the engine link.
pub struct WorkerEnd {
    pub requests: mpsc::UnboundedReceiver<WorkerRequest>,
    pub responses: mpsc::UnboundedSender<WorkerResponse>,
}

/// Create a connected pair of link ends.
pub fn link() -> (WorkerLink, WorkerEnd) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    (
        WorkerLink {
            requests: req_tx,
            responses: resp_rx,
        },
        WorkerEnd {
            requests: req_rx,
            responses: resp_tx,
        },
    )
}

/// Handshake parameters.
pub struct InitParams {
    pub secret: Zeroizing<Vec<u8>>,
    pub generation_tag: String,
    pub iterations: u32,
}

enum Reply {
    Encrypted(EncryptedPayload),
    Decrypted(Bytes),
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Reply, CacheError>>,
    timer: JoinHandle<()>,
}

/// In-flight requests plus the reason the link closed, if it has.
///
/// Both live under one lock so a request is either registered before the
/// link closes (and then rejected with it) or refused outright.
#[derive(Default)]
struct Pending {
    requests: HashMap<Uuid, PendingRequest>,
    closed: Option<CacheError>,
}

type PendingTable = Arc<Mutex<Pending>>;

/// Close the table with `err` and reject everything registered so far.
/// The first close wins; later calls only drain.
fn reject_all(pending: &PendingTable, err: &CacheError) -> usize {
    let drained: Vec<PendingRequest> = {
        let mut table = pending.lock();
        if table.closed.is_none() {
            table.closed = Some(err.clone());
        }
        table.requests.drain().map(|(_, p)| p).collect()
    };
    let count = drained.len();
    for entry in drained {
        entry.timer.abort();
        let _ = entry.reply.send(Err(err.clone()));
    }
    count
}

/// Correlating client for the crypto engine.
pub struct WorkerChannel {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    pending: PendingTable,
    request_timeout: Duration,
    pump: JoinHandle<()>,
}

impl WorkerChannel {
    /// Perform the handshake, then start routing responses.
    ///
    /// Fails with `WorkerInitializationFailed` if the engine reports an error,
    /// goes away, or does not answer within `init_timeout`.
    pub async fn connect(
        link: WorkerLink,
        params: InitParams,
        init_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, CacheError> {
        let WorkerLink {
            requests,
            mut responses,
        } = link;

        requests
            .send(WorkerRequest::Initialize {
                secret: params.secret,
                generation_tag: params.generation_tag,
                iterations: params.iterations,
            })
            .map_err(|_| {
                CacheError::WorkerInitializationFailed("crypto engine is not running".to_string())
            })?;

        match tokio::time::timeout(init_timeout, responses.recv()).await {
            Ok(Some(WorkerResponse::Ready)) => {}
            Ok(Some(WorkerResponse::InitError { kind, message })) => {
                return Err(CacheError::WorkerInitializationFailed(format!(
                    "{kind:?}: {message}"
                )));
            }
            Ok(Some(other)) => {
                return Err(CacheError::WorkerInitializationFailed(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
            Ok(None) => {
                return Err(CacheError::WorkerInitializationFailed(
                    "crypto engine exited during handshake".to_string(),
                ));
            }
            Err(_) => {
                let _ = requests.send(WorkerRequest::Destroy);
                return Err(CacheError::WorkerInitializationFailed(format!(
                    "handshake timed out after {init_timeout:?}"
                )));
            }
        }

        let pending: PendingTable = Arc::new(Mutex::new(Pending::default()));

        let pump = tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(response) = responses.recv().await {
                    route(&pending, response);
                }
                let rejected = reject_all(
                    &pending,
                    &CacheError::Transport("crypto engine channel closed".to_string()),
                );
                warn!(rejected, "Crypto engine channel closed");
            }
        });

        info!("Crypto engine ready");

        Ok(Self {
            requests,
            pending,
            request_timeout,
            pump,
        })
    }

    /// Whether the engine link is still up.
    pub fn is_connected(&self) -> bool {
        self.pending.lock().closed.is_none()
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().requests.len()
    }

    pub async fn encrypt(&self, plaintext: Bytes) -> Result<EncryptedPayload, CacheError> {
        let request_id = Uuid::new_v4();
        let reply = self
            .call(request_id, WorkerRequest::Encrypt {
                request_id,
                plaintext,
            })
            .await?;
        match reply {
            Reply::Encrypted(payload) => Ok(payload),
            Reply::Decrypted(_) => Err(CacheError::Transport(
                "decrypt result received for encrypt request".to_string(),
            )),
        }
    }

    pub async fn decrypt(&self, iv: Bytes, ciphertext: Bytes) -> Result<Bytes, CacheError> {
        let request_id = Uuid::new_v4();
        let reply = self
            .call(request_id, WorkerRequest::Decrypt {
                request_id,
                iv,
                ciphertext,
            })
            .await?;
        match reply {
            Reply::Decrypted(plaintext) => Ok(plaintext),
            Reply::Encrypted(_) => Err(CacheError::Transport(
                "encrypt result received for decrypt request".to_string(),
            )),
        }
    }

    async fn call(&self, request_id: Uuid, request: WorkerRequest) -> Result<Reply, CacheError> {
        let (tx, rx) = oneshot::channel();
        let timeout = self.request_timeout;
        {
            let mut table = self.pending.lock();
            if let Some(err) = &table.closed {
                return Err(err.clone());
            }
            let timer = tokio::spawn({
                let pending = self.pending.clone();
                async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(entry) = pending.lock().requests.remove(&request_id) {
                        debug!(%request_id, "Crypto request timed out");
                        let _ = entry.reply.send(Err(CacheError::RequestTimedOut(timeout)));
                    }
                }
            });
            table
                .requests
                .insert(request_id, PendingRequest { reply: tx, timer });
        }

        if self.requests.send(request).is_err() {
            if let Some(entry) = self.pending.lock().requests.remove(&request_id) {
                entry.timer.abort();
            }
            return Err(CacheError::Transport(
                "crypto engine channel closed".to_string(),
            ));
        }

        rx.await.unwrap_or_else(|_| {
            Err(CacheError::Transport(
                "crypto request dropped without a reply".to_string(),
            ))
        })
    }

    /// Reject everything in flight with `Destroyed` and tell the engine to stop.
    ///
    /// Requests issued after this point fail with `Destroyed` immediately.
    pub fn shutdown(&self) {
        let rejected = reject_all(&self.pending, &CacheError::Destroyed);
        if rejected > 0 {
            debug!(rejected, "Rejected in-flight crypto requests on shutdown");
        }
        let _ = self.requests.send(WorkerRequest::Destroy);
        self.pump.abort();
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn route(pending: &PendingTable, response: WorkerResponse) {
    let Some(request_id) = response.request_id() else {
        debug!(?response, "Ignoring unsolicited crypto engine message");
        return;
    };
    let Some(entry) = pending.lock().requests.remove(&request_id) else {
        // Timed out or rejected already.
        debug!(%request_id, "Late crypto response ignored");
        return;
    };
    entry.timer.abort();

    let outcome = match response {
        WorkerResponse::EncryptResult { payload, .. } => Ok(Reply::Encrypted(payload)),
        WorkerResponse::DecryptResult { plaintext, .. } => Ok(Reply::Decrypted(plaintext)),
        WorkerResponse::Error { kind, message, .. } => Err(kind.into_cache_error(message)),
        WorkerResponse::Ready | WorkerResponse::InitError { .. } => return,
    };
    let _ = entry.reply.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::engine::run_engine;

    fn params() -> InitParams {
        InitParams {
            secret: Zeroizing::new(b"secret".to_vec()),
            generation_tag: "v1".to_string(),
            iterations: 1_000,
        }
    }

    async fn connected(near: WorkerLink, request_timeout: Duration) -> WorkerChannel {
        WorkerChannel::connect(near, params(), Duration::from_secs(30), request_timeout)
            .await
            .unwrap()
    }

    /// Engine stand-in that completes the handshake and then never replies.
    fn silent_engine(mut end: WorkerEnd) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut responses = Some(end.responses);
            while let Some(request) = end.requests.recv().await {
                match request {
                    WorkerRequest::Initialize { .. } => {
                        if let Some(tx) = &responses {
                            let _ = tx.send(WorkerResponse::Ready);
                        }
                    }
                    WorkerRequest::Destroy => {
                        responses.take();
                        break;
                    }
                    _ => {}
                }
            }
        })
    }

    #[tokio::test]
    async fn test_round_trip_through_engine() {
        let (near, far) = link();
        tokio::spawn(run_engine(far));
        let channel = connected(near, Duration::from_secs(30)).await;

        let sealed = channel.encrypt(Bytes::from_static(b"hello")).await.unwrap();
        let opened = channel.decrypt(sealed.iv, sealed.ciphertext).await.unwrap();
        assert_eq!(opened.as_ref(), b"hello");
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_decrypt_failure_maps_to_error() {
        let (near, far) = link();
        tokio::spawn(run_engine(far));
        let channel = connected(near, Duration::from_secs(30)).await;

        let err = channel
            .decrypt(Bytes::from_static(&[0u8; 12]), Bytes::from_static(&[1u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::DecryptionFailed(_)));
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let (near, far) = link();
        silent_engine(far);
        let channel = connected(near, Duration::from_millis(50)).await;

        let err = channel.encrypt(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err, CacheError::RequestTimedOut(Duration::from_millis(50)));
        assert!(err.is_unknown_outcome());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_in_flight() {
        let (near, far) = link();
        silent_engine(far);
        let channel = Arc::new(connected(near, Duration::from_secs(60)).await);

        let in_flight = tokio::spawn({
            let channel = channel.clone();
            async move { channel.encrypt(Bytes::from_static(b"x")).await }
        });
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        channel.shutdown();
        let err = in_flight.await.unwrap().unwrap_err();
        assert_eq!(err, CacheError::Destroyed);
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_request_after_shutdown_is_destroyed() {
        let (near, far) = link();
        silent_engine(far);
        let channel = connected(near, Duration::from_secs(60)).await;

        channel.shutdown();
        let err = channel.encrypt(Bytes::from_static(b"x")).await.unwrap_err();
        assert_eq!(err, CacheError::Destroyed);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_racing_new_requests() {
        let (near, far) = link();
        silent_engine(far);
        let channel = Arc::new(connected(near, Duration::from_secs(60)).await);

        let callers: Vec<_> = (0..64)
            .map(|_| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.encrypt(Bytes::from_static(b"x")).await })
            })
            .collect();
        tokio::task::yield_now().await;
        channel.shutdown();

        // Every caller settles with Destroyed long before the request timeout.
        for caller in callers {
            let outcome = tokio::time::timeout(Duration::from_secs(5), caller)
                .await
                .expect("caller left waiting after shutdown")
                .unwrap();
            assert_eq!(outcome.unwrap_err(), CacheError::Destroyed);
        }
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_exit_rejects_pending() {
        let (near, mut far) = link();
        let engine = tokio::spawn(async move {
            let _ = far.requests.recv().await;
            let _ = far.responses.send(WorkerResponse::Ready);
            // Wait for the first real request, then vanish.
            let _ = far.requests.recv().await;
        });
        let channel = connected(near, Duration::from_secs(60)).await;

        let err = channel.encrypt(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, CacheError::Transport(_)));
        engine.await.unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (near, _far) = link();
        let timeout = Duration::from_millis(20);
        let err = WorkerChannel::connect(near, params(), timeout, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::WorkerInitializationFailed(_)));
    }

    #[tokio::test]
    async fn test_handshake_engine_gone() {
        let (near, far) = link();
        drop(far);
        let timeout = Duration::from_secs(1);
        let err = WorkerChannel::connect(near, params(), timeout, timeout)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::WorkerInitializationFailed(_)));
    }
}
