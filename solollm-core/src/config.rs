//! Service configuration.

use crate::engine::GenerationParams;

/// Configuration for the inference service and its collaborators.
///
/// Concurrency defaults match a small single-backend deployment: the
/// backend itself permits no concurrent calls, so `max_concurrent` bounds
/// tracked in-flight work, not parallel generations.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum tracked concurrent requests.
    pub max_concurrent: usize,

    /// Maximum pending requests in the overflow queue.
    pub max_queue_size: usize,

    /// Default token budget per response.
    pub max_tokens: u32,

    /// Default sampling temperature.
    pub temperature: f32,

    /// Default nucleus sampling parameter.
    pub top_p: f32,

    /// Default top-k sampling parameter.
    pub top_k: u32,

    /// Context window size handed to the backend.
    pub context_size: u32,

    /// CPU threads the backend should use.
    pub thread_count: u32,

    /// How long the backend should keep the model warm after last use.
    pub keep_alive: String,

    /// Calibration runs per candidate context size.
    pub bench_runs: u32,

    /// Default candidate context sizes for the benchmark runner.
    pub bench_context_sizes: Vec<u32>,

    /// Smallest candidate context size the benchmark accepts.
    pub bench_min_context: u32,

    /// Largest candidate context size the benchmark accepts.
    pub bench_max_context: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_size: 100,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            context_size: 2048,
            thread_count: 4,
            keep_alive: "5m".to_string(),
            bench_runs: 3,
            bench_context_sizes: vec![1024, 2048, 4096],
            bench_min_context: 256,
            bench_max_context: 32768,
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SOLOLLM_MAX_CONCURRENT") {
            if let Ok(n) = val.parse() {
                config.max_concurrent = n;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_MAX_QUEUE") {
            if let Ok(n) = val.parse() {
                config.max_queue_size = n;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_MAX_TOKENS") {
            if let Ok(n) = val.parse() {
                config.max_tokens = n;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_NUM_CTX") {
            if let Ok(n) = val.parse() {
                config.context_size = n;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_NUM_THREAD") {
            if let Ok(n) = val.parse() {
                config.thread_count = n;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_KEEP_ALIVE") {
            config.keep_alive = val;
        }

        if let Ok(val) = std::env::var("SOLOLLM_BENCH_RUNS") {
            if let Ok(n) = val.parse() {
                config.bench_runs = n;
            }
        }

        config
    }

    /// Build generation parameters from the configured defaults.
    pub fn generation_params(
        &self,
        prompt: impl Into<String>,
        system: Option<String>,
    ) -> GenerationParams {
        GenerationParams {
            prompt: prompt.into(),
            system,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            stop: vec![],
            context_size: None,
            thread_count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.bench_context_sizes, vec![1024, 2048, 4096]);
    }

    #[test]
    fn test_generation_params_from_defaults() {
        let config = ServiceConfig::default();
        let params = config.generation_params("hello", Some("be brief".into()));

        assert_eq!(params.prompt, "hello");
        assert_eq!(params.system.as_deref(), Some("be brief"));
        assert_eq!(params.max_tokens, config.max_tokens);
        assert_eq!(params.context_size, None);
    }
}
