//! Error types for the solollm core library.

use thiserror::Error;

use crate::engine::EngineError;

/// Errors surfaced by the admission controller and request lifecycle.
///
/// `Clone` is required because a terminal error is stored once in the
/// request's result slot and may be observed through either the token
/// stream or the stats path.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    /// The backend was not ready when the request reached execution.
    #[error("model not loaded")]
    BackendUnavailable,

    /// The overflow queue was at capacity at submission time.
    #[error("server busy: queue is full (max: {max})")]
    QueueFull { max: usize },

    /// An engine call failed. Always local to the owning request.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The service is shutting down and no longer accepts work.
    #[error("service shutting down")]
    Shutdown,
}

impl InferenceError {
    /// True when the error means the caller should back off and retry later.
    pub fn is_overload(&self) -> bool {
        matches!(self, InferenceError::QueueFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InferenceError::BackendUnavailable;
        assert_eq!(err.to_string(), "model not loaded");

        let err = InferenceError::QueueFull { max: 100 };
        assert_eq!(err.to_string(), "server busy: queue is full (max: 100)");

        let err = InferenceError::Engine(EngineError::Generation("boom".into()));
        assert_eq!(err.to_string(), "generation failed: boom");
    }

    #[test]
    fn test_is_overload() {
        assert!(InferenceError::QueueFull { max: 1 }.is_overload());
        assert!(!InferenceError::BackendUnavailable.is_overload());
    }

    #[test]
    fn test_error_equality() {
        let err1 = InferenceError::QueueFull { max: 10 };
        let err2 = InferenceError::QueueFull { max: 10 };
        let err3 = InferenceError::QueueFull { max: 20 };

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
