//! Admission controller for the serialized generation backend.
//!
//! Tracks in-flight work against a concurrency budget, serializes access to
//! the backend behind a single lock, and drains the overflow queue as slots
//! free up. Bookkeeping (submit / promote / queue operations) runs on the
//! cooperative scheduler; the blocking engine call runs on the blocking
//! thread pool, bounded in practice by `max_concurrent` tracked tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::engine::{Engine, EngineError};
use crate::error::InferenceError;
use crate::queue::OverflowQueue;
use crate::request::{InferenceRequest, TokenStats};

/// How long the promotion path waits for a queued request before giving up.
const PROMOTE_WAIT: Duration = Duration::from_millis(100);

/// Interval of the background starvation-safety tick.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// An execution slot was free; the request is already running.
    Immediate,
    /// All slots were busy; the request waits in the overflow queue.
    Queued,
}

/// Service that manages inference requests with slot tracking and queue
/// fallback.
///
/// Requests are processed immediately while slots are available; otherwise
/// they are queued and promoted as slots free up, in FIFO order. The
/// backend itself permits no concurrent calls, so every execution task
/// funnels through one serialization lock regardless of `max_concurrent`.
pub struct InferenceService {
    engine: Arc<dyn Engine>,
    queue: OverflowQueue,
    max_concurrent: usize,
    /// Tracked in-flight requests. This lock is the controller-wide
    /// critical section: admission and promotion decisions both take it,
    /// so a promote cannot race a concurrent submit into an oversubscribed
    /// slot count.
    active: Mutex<usize>,
    /// Serializes actual engine calls; held by at most one execution task.
    engine_lock: Arc<Mutex<()>>,
    running: AtomicBool,
    tick: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InferenceService {
    /// Create a stopped service; call [`start`](Self::start) to enable the
    /// background queue worker.
    pub fn new(engine: Arc<dyn Engine>, config: &ServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            queue: OverflowQueue::new(config.max_queue_size),
            max_concurrent: config.max_concurrent,
            active: Mutex::new(0),
            engine_lock: Arc::new(Mutex::new(())),
            running: AtomicBool::new(true),
            tick: std::sync::Mutex::new(None),
        })
    }

    /// Number of currently tracked in-flight requests.
    pub async fn active_count(&self) -> usize {
        *self.active.lock().await
    }

    /// Whether a slot is free for immediate processing.
    pub async fn has_capacity(&self) -> bool {
        self.active_count().await < self.max_concurrent
    }

    /// Number of requests waiting in the overflow queue. Upstream
    /// load-shedding policy reads this to lower token budgets under load.
    pub async fn queue_size(&self) -> usize {
        self.queue.size().await
    }

    /// Configured concurrency budget.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// The engine this service fronts.
    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.engine)
    }

    /// The lock serializing backend access. The benchmark runner takes the
    /// same lock so its measurements reflect real contention.
    pub fn engine_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.engine_lock)
    }

    /// Start the background queue worker.
    ///
    /// The worker is purely a starvation safety net: promotion normally
    /// happens on the completion path, and both paths share the controller
    /// lock, so at most one promotion occurs per freed slot.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tracing::info!("queue worker started");
            loop {
                tokio::time::sleep(TICK_INTERVAL).await;
                let Some(service) = weak.upgrade() else { break };
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
                if service.queue.size().await > 0 {
                    service.promote_queued().await;
                }
            }
            tracing::info!("queue worker stopped");
        });

        if let Ok(mut tick) = self.tick.lock() {
            if let Some(old) = tick.replace(handle) {
                old.abort();
            }
        }
    }

    /// Submit a request for processing.
    ///
    /// Runs it immediately when a slot is free, otherwise queues it. Fails
    /// with [`InferenceError::QueueFull`] when the overflow queue is at
    /// capacity; the request never silently disappears.
    pub async fn submit(
        self: &Arc<Self>,
        request: InferenceRequest,
    ) -> Result<Admission, InferenceError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(InferenceError::Shutdown);
        }

        let mut active = self.active.lock().await;
        if *active < self.max_concurrent {
            *active += 1;
            tracing::info!(
                id = %request.id,
                active = *active,
                max = self.max_concurrent,
                "request processing immediately"
            );
            tokio::spawn(Arc::clone(self).process_with_tracking(request));
            Ok(Admission::Immediate)
        } else {
            let id = request.id.clone();
            self.queue.put(request).await?;
            tracing::info!(
                id = %id,
                queue = self.queue.size().await,
                active = *active,
                "request queued"
            );
            Ok(Admission::Queued)
        }
    }

    /// Stop the service: no further queue draining, background worker
    /// cancelled. In-flight engine calls are not waited for.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(mut tick) = self.tick.lock() {
            if let Some(handle) = tick.take() {
                handle.abort();
            }
        }
        tracing::info!("inference service stopped");
    }

    /// Run a request to its terminal state, free the slot, and promote the
    /// next queued request if capacity allows.
    fn process_with_tracking(
        self: Arc<Self>,
        request: InferenceRequest,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.process_request(request).await;
            {
                let mut active = self.active.lock().await;
                *active = active.saturating_sub(1);
            }
            self.promote_queued().await;
        })
    }

    /// Promote one queued request if a slot is free.
    ///
    /// The dequeue wait is bounded: if another path drained the queue
    /// within the window, this is a no-op and the slot stays free for the
    /// next submit.
    async fn promote_queued(self: &Arc<Self>) {
        let mut active = self.active.lock().await;
        if !self.running.load(Ordering::SeqCst) || *active >= self.max_concurrent {
            return;
        }
        if self.queue.size().await == 0 {
            return;
        }

        match tokio::time::timeout(PROMOTE_WAIT, self.queue.get()).await {
            Ok(request) => {
                *active += 1;
                tracing::info!(
                    id = %request.id,
                    active = *active,
                    max = self.max_concurrent,
                    "request dequeued for processing"
                );
                tokio::spawn(Arc::clone(self).process_with_tracking(request));
            }
            Err(_) => {
                tracing::debug!("promotion window elapsed with empty queue");
            }
        }
    }

    /// Run a single request to a terminal state. Never returns an error:
    /// every failure ends up in the request's terminal slot.
    async fn process_request(&self, request: InferenceRequest) {
        if !self.engine.is_loaded() {
            tracing::warn!(id = %request.id, "backend not loaded, failing request");
            request.fail(InferenceError::BackendUnavailable);
            return;
        }

        if request.stream {
            self.process_streaming(request).await;
        } else {
            self.process_sync(request).await;
        }
    }

    /// Streaming execution: the worker thread forwards each increment into
    /// the request's channel as it arrives.
    async fn process_streaming(&self, request: InferenceRequest) {
        let engine = Arc::clone(&self.engine);
        let params = request.params.clone();
        let sender = request.token_sender();

        // The backend is not safe for concurrent calls: this is the point
        // where concurrency collapses to one generation process-wide.
        let serial = self.engine_lock.lock().await;
        let joined = tokio::task::spawn_blocking(move || -> Result<u32, EngineError> {
            let mut emitted = 0u32;
            for token in engine.generate_stream(&params)? {
                let token = token?;
                emitted += 1;
                let _ = sender.send(token);
            }
            Ok(emitted)
        })
        .await;
        drop(serial);

        match joined {
            Ok(Ok(completion_tokens)) => {
                let prompt_tokens = self.engine.token_count(&request.params.prompt);
                tracing::info!(id = %request.id, completion_tokens, "request completed");
                request.complete(TokenStats::new(prompt_tokens, completion_tokens));
            }
            Ok(Err(e)) => {
                tracing::error!(id = %request.id, error = %e, "inference error");
                request.fail(e.into());
            }
            Err(e) => {
                tracing::error!(id = %request.id, error = %e, "inference worker failed");
                request.fail(InferenceError::Engine(EngineError::Generation(e.to_string())));
            }
        }
    }

    /// Synchronous execution: the full text is delivered as one increment.
    async fn process_sync(&self, request: InferenceRequest) {
        let engine = Arc::clone(&self.engine);
        let params = request.params.clone();

        let serial = self.engine_lock.lock().await;
        let joined = tokio::task::spawn_blocking(move || engine.generate(&params)).await;
        drop(serial);

        match joined {
            Ok(Ok(output)) => {
                let stats = TokenStats::new(output.prompt_tokens, output.completion_tokens);
                tracing::info!(
                    id = %request.id,
                    completion_tokens = stats.completion_tokens,
                    "request completed"
                );
                request.put_token(output.text);
                request.complete(stats);
            }
            Ok(Err(e)) => {
                tracing::error!(id = %request.id, error = %e, "inference error");
                request.fail(e.into());
            }
            Err(e) => {
                tracing::error!(id = %request.id, error = %e, "inference worker failed");
                request.fail(InferenceError::Engine(EngineError::Generation(e.to_string())));
            }
        }
    }
}
