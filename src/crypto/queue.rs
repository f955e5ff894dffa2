//! Adaptive-concurrency work queue for crypto jobs.
//!
//! Jobs start in FIFO order. Parallelism begins at one and moves by one step
//! after every completed job: up when the job was fast, down when it was slow.
//! The limit is a semaphore's permit count; shrinking forgets the finishing
//! job's permit instead of returning it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lower bound on parallelism.
pub const MIN_PARALLELISM: usize = 1;
/// Upper bound on parallelism.
pub const MAX_PARALLELISM: usize = 10;
/// Jobs faster than this raise the limit.
pub const INCREASE_THRESHOLD: Duration = Duration::from_millis(40);
/// Jobs slower than this lower the limit.
pub const DECREASE_THRESHOLD: Duration = Duration::from_millis(80);

/// A unit of blocking work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Next parallelism limit after a job that took `elapsed`.
pub fn next_limit(current: usize, elapsed: Duration) -> usize {
    if elapsed < INCREASE_THRESHOLD && current < MAX_PARALLELISM {
        current + 1
    } else if elapsed > DECREASE_THRESHOLD && current > MIN_PARALLELISM {
        current - 1
    } else {
        current
    }
}

#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_panicked: u64,
    pub limit_increases: u64,
    pub limit_decreases: u64,
}

struct Shared {
    permits: Arc<Semaphore>,
    limit: Mutex<usize>,
    stats: Mutex<QueueStats>,
}

impl Shared {
    fn finish(&self, permit: OwnedSemaphorePermit, elapsed: Duration) {
        let mut limit = self.limit.lock();
        let next = next_limit(*limit, elapsed);
        let mut stats = self.stats.lock();
        if next > *limit {
            self.permits.add_permits(1);
            stats.limit_increases += 1;
            drop(permit);
        } else if next < *limit {
            permit.forget();
            stats.limit_decreases += 1;
        } else {
            drop(permit);
        }
        if next != *limit {
            debug!(
                from = *limit,
                to = next,
                elapsed_ms = elapsed.as_millis() as u64,
                "Adjusted crypto parallelism"
            );
        }
        *limit = next;
    }
}

/// FIFO queue dispatching jobs onto the blocking pool under an adaptive limit.
pub struct AdaptiveQueue {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl AdaptiveQueue {
    /// Start the dispatcher on the current runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let shared = Arc::new(Shared {
            permits: Arc::new(Semaphore::new(MIN_PARALLELISM)),
            limit: Mutex::new(MIN_PARALLELISM),
            stats: Mutex::new(QueueStats::default()),
        });

        let dispatcher = tokio::spawn({
            let shared = shared.clone();
            async move {
                while let Some(job) = rx.recv().await {
                    let Ok(permit) = shared.permits.clone().acquire_owned().await else {
                        break;
                    };
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let outcome = tokio::task::spawn_blocking(job).await;
                        let elapsed = started.elapsed();
                        {
                            let mut stats = shared.stats.lock();
                            stats.total_completed += 1;
                            if outcome.is_err() {
                                stats.total_panicked += 1;
                            }
                        }
                        if let Err(e) = outcome {
                            warn!(error = %e, "Crypto job failed");
                        }
                        shared.finish(permit, elapsed);
                    });
                }
            }
        });

        Self {
            tx,
            shared,
            dispatcher,
        }
    }

    /// Enqueue a job. Returns false once the queue has been closed.
    pub fn submit(&self, job: Job) -> bool {
        if self.tx.send(job).is_err() {
            return false;
        }
        self.shared.stats.lock().total_submitted += 1;
        true
    }

    /// Current parallelism limit.
    pub fn limit(&self) -> usize {
        *self.shared.limit.lock()
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.stats.lock().clone()
    }

    /// Stop dispatching. Jobs already running finish on their own.
    pub fn close(&self) {
        self.dispatcher.abort();
        self.shared.permits.close();
    }
}

impl Drop for AdaptiveQueue {
    fn drop(&mut self) {
        self.close();
    }
}
