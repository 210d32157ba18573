//! Bounded FIFO overflow queue for requests awaiting an execution slot.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::error::InferenceError;
use crate::request::InferenceRequest;

/// Fixed-capacity FIFO of pending requests.
///
/// `put` never blocks: it fails fast with [`InferenceError::QueueFull`] at
/// capacity so overload is surfaced to the submitter instead of stalling it.
pub struct OverflowQueue {
    inner: Mutex<VecDeque<InferenceRequest>>,
    capacity: usize,
    available: Notify,
}

impl OverflowQueue {
    /// Create a queue holding at most `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests currently waiting.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether the queue is at capacity.
    pub async fn is_full(&self) -> bool {
        self.size().await >= self.capacity
    }

    /// Enqueue a request, or fail fast when at capacity.
    pub async fn put(&self, request: InferenceRequest) -> Result<(), InferenceError> {
        let mut queue = self.inner.lock().await;
        if queue.len() >= self.capacity {
            tracing::warn!(id = %request.id, max = self.capacity, "queue full, rejecting request");
            return Err(InferenceError::QueueFull { max: self.capacity });
        }

        tracing::debug!(id = %request.id, depth = queue.len() + 1, "request queued");
        queue.push_back(request);
        drop(queue);

        self.available.notify_one();
        Ok(())
    }

    /// Dequeue the next request in FIFO order, waiting until one arrives.
    pub async fn get(&self) -> InferenceRequest {
        loop {
            // Register interest before checking so a concurrent `put`
            // cannot slip between the check and the wait.
            let notified = self.available.notified();

            if let Some(request) = self.inner.lock().await.pop_front() {
                tracing::debug!(id = %request.id, "request dequeued");
                return request;
            }

            notified.await;
        }
    }
}
