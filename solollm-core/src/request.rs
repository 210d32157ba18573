//! Request lifecycle object.
//!
//! A request is split at construction into a producer half
//! ([`InferenceRequest`], owned by the execution task) and a consumer half
//! ([`ResponseHandle`], kept by the caller). Tokens flow through an
//! unbounded channel in production order; a watch channel carries the
//! one-shot completion signal; the terminal result lives in a write-once
//! slot that is unreadable before the signal fires.
//!
//! `complete` and `fail` consume the producer, so a request reaches exactly
//! one terminal state exactly once by construction.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::engine::{EngineError, GenerationParams};
use crate::error::InferenceError;

/// Token accounting for a completed request.
///
/// Fixed-shape record; `total_tokens` is derived at construction so the
/// `total == prompt + completion` invariant cannot be violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenStats {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Terminal result slot shared between the two halves.
struct Terminal {
    result: OnceLock<Result<TokenStats, InferenceError>>,
}

/// Producer half of a request: sampling parameters plus the channels the
/// execution task writes into. Owned exclusively by one execution task
/// after submission.
pub struct InferenceRequest {
    /// Sampling parameters for the generation call.
    pub params: GenerationParams,

    /// Whether the backend should be driven in streaming mode.
    pub stream: bool,

    /// Short unique id, used for log correlation.
    pub id: String,

    /// Monotonic creation timestamp.
    pub created_at: Instant,

    tokens: mpsc::UnboundedSender<String>,
    done: watch::Sender<bool>,
    terminal: Arc<Terminal>,
}

impl std::fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("id", &self.id)
            .field("stream", &self.stream)
            .field("max_tokens", &self.params.max_tokens)
            .finish()
    }
}

impl InferenceRequest {
    /// Create a request and its paired consumer handle.
    pub fn new(params: GenerationParams, stream: bool) -> (Self, ResponseHandle) {
        let (token_tx, token_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let terminal = Arc::new(Terminal {
            result: OnceLock::new(),
        });
        let id = Uuid::new_v4().to_string()[..8].to_string();

        let request = Self {
            params,
            stream,
            id: id.clone(),
            created_at: Instant::now(),
            tokens: token_tx,
            done: done_tx,
            terminal: Arc::clone(&terminal),
        };
        let handle = ResponseHandle {
            id,
            tokens: token_rx,
            done: done_rx,
            terminal,
            error_emitted: false,
        };
        (request, handle)
    }

    /// Append one text increment to the stream.
    ///
    /// A send into a dropped consumer is discarded: an abandoned request
    /// still runs to completion because the producer has no way to know it
    /// is unobserved.
    pub fn put_token(&self, token: impl Into<String>) {
        let _ = self.tokens.send(token.into());
    }

    /// Sender the worker thread forwards increments through.
    pub(crate) fn token_sender(&self) -> mpsc::UnboundedSender<String> {
        self.tokens.clone()
    }

    /// Terminal success: store stats, close the stream, fire the signal.
    pub fn complete(self, stats: TokenStats) {
        self.finish(Ok(stats));
    }

    /// Terminal failure: store the error, close the stream, fire the signal.
    pub fn fail(self, error: InferenceError) {
        self.finish(Err(error));
    }

    fn finish(self, result: Result<TokenStats, InferenceError>) {
        // Result must be visible before the channel closes so the consumer
        // never observes end-of-stream with an empty slot.
        let _ = self.terminal.result.set(result);
        let _ = self.done.send(true);
        // Dropping `self.tokens` here closes the stream: the channel end
        // is the end-of-stream marker.
    }
}

/// Consumer half of a request: a finite, non-restartable token stream and
/// the terminal stats, for exactly one consumer.
pub struct ResponseHandle {
    id: String,
    tokens: mpsc::UnboundedReceiver<String>,
    done: watch::Receiver<bool>,
    terminal: Arc<Terminal>,
    error_emitted: bool,
}

impl ResponseHandle {
    /// Id of the paired request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next text increment, in production order.
    ///
    /// Yields `Ok(token)` per increment. At end of stream a failed request
    /// yields its stored error exactly once; afterwards, and for completed
    /// requests, returns `None`.
    pub async fn next_token(&mut self) -> Option<Result<String, InferenceError>> {
        match self.tokens.recv().await {
            Some(token) => Some(Ok(token)),
            None => {
                if self.error_emitted {
                    return None;
                }
                match self.terminal.result.get() {
                    Some(Err(e)) => {
                        self.error_emitted = true;
                        Some(Err(e.clone()))
                    }
                    _ => None,
                }
            }
        }
    }

    /// Suspend until the terminal signal fires, then return the stats or
    /// the stored error.
    pub async fn stats(&mut self) -> Result<TokenStats, InferenceError> {
        self.done.wait_for(|done| *done).await.map_err(|_| {
            // Producer dropped without a terminal transition. Should not
            // happen: execution tasks always finish their request.
            InferenceError::Engine(EngineError::Generation(
                "request dropped before completion".into(),
            ))
        })?;

        match self.terminal.result.get() {
            Some(Ok(stats)) => Ok(*stats),
            Some(Err(e)) => Err(e.clone()),
            None => Err(InferenceError::Engine(EngineError::Generation(
                "completion signal fired without a result".into(),
            ))),
        }
    }
}
