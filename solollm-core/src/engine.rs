//! The seam between the admission controller and the text-generation backend.
//!
//! The backend is opaque, blocking, and assumed NOT safe to call
//! concurrently. Every method here must be safe to call from a worker
//! thread; the controller serializes actual generation calls behind a
//! single lock and never invokes them on the async runtime directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a backend implementation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The backend is not connected or the model is not loaded.
    #[error("engine not loaded")]
    NotLoaded,

    /// The generation call itself failed.
    #[error("generation failed: {0}")]
    Generation(String),

    /// Transport-level failure talking to the backend.
    #[error("backend request failed: {0}")]
    Transport(String),
}

/// Parameters for a single generation call.
///
/// Context and thread overrides are optional; when absent the engine uses
/// its configured defaults. The benchmark runner uses the overrides to
/// probe candidate context sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub stop: Vec<String>,
    pub context_size: Option<u32>,
    pub thread_count: Option<u32>,
}

/// Result of a non-streaming generation call.
///
/// Timing fields are backend-reported and optional; Ollama exposes them,
/// other backends may not. Durations are in nanoseconds as reported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_duration_ns: Option<u64>,
    pub load_duration_ns: Option<u64>,
    pub prompt_eval_duration_ns: Option<u64>,
    pub eval_duration_ns: Option<u64>,
}

/// A blocking text-generation backend.
///
/// Implementations must be callable from a worker thread and may assume the
/// caller never issues two generation calls at once.
pub trait Engine: Send + Sync {
    /// Whether the backend is connected and ready to generate.
    fn is_loaded(&self) -> bool;

    /// Name of the served model.
    fn model_name(&self) -> String;

    /// Context window size used when a request carries no override.
    fn default_context_size(&self) -> u32;

    /// Thread count used when a request carries no override.
    fn default_thread_count(&self) -> u32;

    /// Run a generation call to completion and return the full output.
    fn generate(&self, params: &GenerationParams) -> Result<GenerationOutput, EngineError>;

    /// Run a streaming generation call, yielding text increments in
    /// production order. The iterator is finite and single-use.
    fn generate_stream<'a>(
        &'a self,
        params: &GenerationParams,
    ) -> Result<Box<dyn Iterator<Item = Result<String, EngineError>> + Send + 'a>, EngineError>;

    /// Estimate the number of tokens in `text`.
    fn token_count(&self, text: &str) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        assert_eq!(EngineError::NotLoaded.to_string(), "engine not loaded");
        assert_eq!(
            EngineError::Transport("connection refused".into()).to_string(),
            "backend request failed: connection refused"
        );
    }

    #[test]
    fn test_output_serialization() {
        let output = GenerationOutput {
            text: "hello".into(),
            prompt_tokens: 4,
            completion_tokens: 1,
            eval_duration_ns: Some(1_000_000),
            ..Default::default()
        };

        let json = serde_json::to_string(&output).unwrap();
        let back: GenerationOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text, "hello");
        assert_eq!(back.eval_duration_ns, Some(1_000_000));
        assert_eq!(back.load_duration_ns, None);
    }
}
