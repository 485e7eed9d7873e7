//! Request deduplication, rate limiting, and batching.
//!
//! Everything the engine sends to the persistence collaborator passes
//! through a [`RequestCoordinator`]: identical concurrent requests collapse
//! to one underlying call, bursts are throttled, and batchable calls are
//! accumulated and fanned back out. The coordinator is constructor-injected
//! so several facades can share one instance while tests keep isolated
//! ones; there is no hidden global state.

use crate::config::{BatchConfig, RateLimitConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use chatsync_model::RequestKey;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{sleep, timeout, Instant};

use crate::config::RetryConfig;

/// Per-request options for [`RequestCoordinator::deduplicate`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Retry policy across attempts.
    pub retry: RetryConfig,
}

impl RequestOptions {
    /// Creates request options.
    pub fn new(timeout: Duration, retry: RetryConfig) -> Self {
        Self { timeout, retry }
    }

    /// Options for primary operations that must never auto-retry.
    pub fn no_retry(timeout: Duration) -> Self {
        Self {
            timeout,
            retry: RetryConfig::no_retry(),
        }
    }
}

impl From<&SyncConfig> for RequestOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            timeout: config.request_timeout,
            retry: config.request_retry.clone(),
        }
    }
}

type PendingResult = Result<Value, SyncError>;
type BatchFuture = Pin<Box<dyn Future<Output = SyncResult<Vec<PendingResult>>> + Send>>;
type BatchFn = Box<dyn FnOnce(Vec<Value>) -> BatchFuture + Send>;

struct RateWindow {
    started: Instant,
    count: u32,
}

struct PendingBatch {
    id: u64,
    params: Vec<Value>,
    waiters: Vec<oneshot::Sender<PendingResult>>,
    run: BatchFn,
}

enum Role {
    Owner(broadcast::Sender<PendingResult>),
    Joiner(broadcast::Receiver<PendingResult>),
}

/// Coordinates all traffic to the persistence collaborator.
pub struct RequestCoordinator {
    pending: Mutex<HashMap<RequestKey, broadcast::Sender<PendingResult>>>,
    rate: Mutex<HashMap<RequestKey, RateWindow>>,
    batches: Mutex<HashMap<String, PendingBatch>>,
    next_batch_id: Mutex<u64>,
    rate_limit: RateLimitConfig,
    batch: BatchConfig,
}

impl RequestCoordinator {
    /// Creates a coordinator with the given policies.
    pub fn new(rate_limit: RateLimitConfig, batch: BatchConfig) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
            next_batch_id: Mutex::new(0),
            rate_limit,
            batch,
        }
    }

    /// Creates a coordinator from the engine configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.rate_limit.clone(), config.batch.clone())
    }

    /// Number of requests currently in flight.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of batches currently accumulating.
    pub fn open_batches(&self) -> usize {
        self.batches.lock().len()
    }

    /// Issues `make_request` unless an identical request is already in
    /// flight, in which case the caller awaits the in-flight result.
    ///
    /// The owning call races each attempt against `options.timeout` and
    /// retries transient failures with exponential backoff. The pending
    /// entry is removed on completion, timeouts included, so a stuck
    /// request never blocks later calls with the same key.
    pub async fn deduplicate<F, Fut>(
        &self,
        key: RequestKey,
        mut make_request: F,
        options: RequestOptions,
    ) -> SyncResult<Value>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<Value>>,
    {
        let role = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some(in_flight) => Role::Joiner(in_flight.subscribe()),
                None => {
                    let (result_tx, _) = broadcast::channel(1);
                    pending.insert(key.clone(), result_tx.clone());
                    Role::Owner(result_tx)
                }
            }
        };

        match role {
            Role::Joiner(mut result_rx) => result_rx
                .recv()
                .await
                .unwrap_or(Err(SyncError::ChannelClosed)),
            Role::Owner(result_tx) => {
                self.throttle(&key).await;
                let result = run_with_retry(&mut make_request, &options).await;
                self.pending.lock().remove(&key);
                let _ = result_tx.send(result.clone());
                result
            }
        }
    }

    /// Queues a call under `batch_key`.
    ///
    /// The first caller's `batch_fn` executes the whole accumulated batch
    /// once the window elapses or the batch reaches its size cap; each
    /// caller then receives its own settled sub-result. A whole-batch
    /// failure rejects every caller with the same error; nobody ever
    /// observes partial results.
    pub async fn add_to_batch<F, Fut>(
        self: &Arc<Self>,
        batch_key: &str,
        params: Value,
        batch_fn: F,
    ) -> SyncResult<Value>
    where
        F: FnOnce(Vec<Value>) -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<Vec<PendingResult>>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let flush_now = {
            let mut batches = self.batches.lock();
            match batches.get_mut(batch_key) {
                Some(batch) => {
                    batch.params.push(params);
                    batch.waiters.push(result_tx);
                    batch.params.len() >= self.batch.max_size
                }
                None => {
                    let id = {
                        let mut next = self.next_batch_id.lock();
                        *next += 1;
                        *next
                    };
                    batches.insert(
                        batch_key.to_owned(),
                        PendingBatch {
                            id,
                            params: vec![params],
                            waiters: vec![result_tx],
                            run: Box::new(move |params| Box::pin(batch_fn(params))),
                        },
                    );

                    // First caller arms the flush timer.
                    let coordinator = Arc::clone(self);
                    let key = batch_key.to_owned();
                    let window = self.batch.window;
                    tokio::spawn(async move {
                        sleep(window).await;
                        coordinator.flush_batch(&key, Some(id)).await;
                    });
                    false
                }
            }
        };

        if flush_now {
            self.flush_batch(batch_key, None).await;
        }

        result_rx.await.unwrap_or(Err(SyncError::ChannelClosed))
    }

    /// Executes and settles a batch.
    ///
    /// `expected_id` guards the timer path: a stale timer whose batch was
    /// already flushed by the size cap must not flush a newer batch that
    /// reused the key.
    async fn flush_batch(&self, batch_key: &str, expected_id: Option<u64>) {
        let batch = {
            let mut batches = self.batches.lock();
            match batches.get(batch_key) {
                Some(batch) if expected_id.is_none_or(|id| id == batch.id) => {
                    batches.remove(batch_key)
                }
                _ => None,
            }
        };
        let Some(PendingBatch {
            params,
            waiters,
            run,
            ..
        }) = batch
        else {
            return;
        };

        let expected = waiters.len();
        match run(params).await {
            Ok(results) if results.len() == expected => {
                for (waiter, result) in waiters.into_iter().zip(results) {
                    let _ = waiter.send(result);
                }
            }
            Ok(results) => {
                let error = SyncError::Store(format!(
                    "batch returned {} results for {expected} calls",
                    results.len()
                ));
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
            Err(error) => {
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
        }
    }

    /// Counts calls per key within the window and inserts an artificial
    /// delay once a burst crosses the threshold.
    async fn throttle(&self, key: &RequestKey) {
        let throttled = {
            let mut rate = self.rate.lock();
            if rate.len() > 256 {
                let window = self.rate_limit.window;
                let now = Instant::now();
                rate.retain(|_, w| now.duration_since(w.started) <= window);
            }

            let now = Instant::now();
            let window = rate.entry(key.clone()).or_insert(RateWindow {
                started: now,
                count: 0,
            });
            if now.duration_since(window.started) > self.rate_limit.window {
                window.started = now;
                window.count = 0;
            }
            window.count += 1;
            window.count > self.rate_limit.threshold
        };

        if throttled {
            tracing::debug!(key = %key, "rate limit exceeded, delaying request");
            sleep(self.rate_limit.delay).await;
        }
    }
}

/// Races one attempt against the timeout; retries transient failures with
/// backoff until the attempt budget runs out.
async fn run_with_retry<F, Fut>(make_request: &mut F, options: &RequestOptions) -> PendingResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<Value>>,
{
    let attempts = options.retry.max_attempts.max(1);
    let mut last = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            sleep(options.retry.delay_for_attempt(attempt)).await;
        }

        let outcome = match timeout(options.timeout, make_request()).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(options.timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                tracing::debug!(%error, attempt, "request attempt failed");
                last = Some(error);
            }
        }
    }

    let last = last.unwrap_or(SyncError::ChannelClosed);
    if attempts == 1 {
        Err(last)
    } else {
        Err(SyncError::RetriesExhausted {
            attempts,
            last: last.to_string(),
        })
    }
}
