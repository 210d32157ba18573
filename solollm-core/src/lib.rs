// solollm Core Library
//
// Admission control, overflow queueing, and request lifecycle management
// for a single non-reentrant text-generation backend.

pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod request;
pub mod service;

pub use config::ServiceConfig;
pub use engine::{Engine, EngineError, GenerationOutput, GenerationParams};
pub use error::InferenceError;
pub use queue::OverflowQueue;
pub use request::{InferenceRequest, ResponseHandle, TokenStats};
pub use service::{Admission, InferenceService};
