// solollm Benchmarking Library
//
// Calibration benchmarks for the serialized generation path, plus tuning
// recommendations derived from the measurements.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use solollm_core::engine::{Engine, EngineError, GenerationParams};
use solollm_core::error::InferenceError;
use solollm_core::{InferenceService, ServiceConfig};

/// One benchmark invocation: what to generate and which context sizes to try.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    /// Calibration runs per candidate context size.
    pub runs: u32,
    /// Candidate context sizes. Invalid or duplicate entries are dropped;
    /// an empty list after validation falls back to the engine default.
    pub context_sizes: Vec<u32>,
}

impl BenchmarkConfig {
    /// Build a benchmark config from the service defaults.
    pub fn from_service_config(config: &ServiceConfig, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            runs: config.bench_runs,
            context_sizes: config.bench_context_sizes.clone(),
        }
    }
}

/// Measurements from a single calibration run.
#[derive(Debug, Clone, Copy)]
struct RunSample {
    latency_ms: f64,
    ttft_ms: Option<f64>,
    completion_tokens: u32,
    tokens_per_second: f64,
}

/// Aggregated measurements for one context-size configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextProfile {
    pub context_size: u32,
    pub runs: u32,
    pub avg_latency_ms: f64,
    /// Mean time-to-first-token across the runs that reported one; `None`
    /// when no run did.
    pub avg_ttft_ms: Option<f64>,
    pub avg_completion_tokens: f64,
    pub avg_tokens_per_second: f64,
}

/// Tuning recommendation derived from the winning profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub context_size: u32,
    pub max_tokens: u32,
    pub reason: String,
}

/// Full benchmark output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub model: String,
    pub profiles: Vec<ContextProfile>,
    pub recommendation: Recommendation,
    pub timestamp: String,
}

/// Runs calibration generations through the same serialization lock live
/// traffic uses, so measurements reflect real contention.
pub struct BenchmarkRunner {
    engine: Arc<dyn Engine>,
    engine_lock: Arc<Mutex<()>>,
    min_context: u32,
    max_context: u32,
}

impl BenchmarkRunner {
    pub fn new(engine: Arc<dyn Engine>, engine_lock: Arc<Mutex<()>>) -> Self {
        let defaults = ServiceConfig::default();
        Self {
            engine,
            engine_lock,
            min_context: defaults.bench_min_context,
            max_context: defaults.bench_max_context,
        }
    }

    /// Attach to a live service: same engine, same serialization lock.
    pub fn for_service(service: &InferenceService, config: &ServiceConfig) -> Self {
        Self::new(service.engine(), service.engine_lock())
            .with_context_bounds(config.bench_min_context, config.bench_max_context)
    }

    /// Override the accepted candidate context-size bounds.
    pub fn with_context_bounds(mut self, min: u32, max: u32) -> Self {
        self.min_context = min;
        self.max_context = max;
        self
    }

    /// Run the full benchmark: every valid candidate context size, `runs`
    /// calibration calls each, aggregated into profiles plus a
    /// recommendation.
    pub async fn run(&self, config: &BenchmarkConfig) -> Result<BenchmarkReport, InferenceError> {
        if !self.engine.is_loaded() {
            return Err(InferenceError::BackendUnavailable);
        }

        let sizes =
            self.validate_context_sizes(&config.context_sizes, self.engine.default_context_size());
        let runs = config.runs.max(1);

        let mut profiles = Vec::with_capacity(sizes.len());
        for context_size in sizes {
            tracing::info!(context_size, runs, "benchmarking context size");

            let mut samples = Vec::with_capacity(runs as usize);
            for run in 0..runs {
                let params = GenerationParams {
                    prompt: config.prompt.clone(),
                    system: config.system.clone(),
                    max_tokens: config.max_tokens,
                    temperature: config.temperature,
                    top_p: config.top_p,
                    top_k: config.top_k,
                    stop: vec![],
                    context_size: Some(context_size),
                    thread_count: None,
                };

                let sample = self.measure_once(&params).await?;
                tracing::debug!(
                    run = run + 1,
                    latency_ms = sample.latency_ms,
                    tokens_per_second = sample.tokens_per_second,
                    "calibration run finished"
                );
                samples.push(sample);
            }

            profiles.push(aggregate(context_size, &samples));
        }

        let recommendation = recommend(&profiles, config.max_tokens).ok_or_else(|| {
            InferenceError::Engine(EngineError::Generation(
                "benchmark produced no profiles".into(),
            ))
        })?;

        Ok(BenchmarkReport {
            model: self.engine.model_name(),
            profiles,
            recommendation,
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    /// Drop out-of-bounds candidates, de-duplicate preserving input order,
    /// and fall back to the engine default when nothing survives.
    fn validate_context_sizes(&self, candidates: &[u32], fallback: u32) -> Vec<u32> {
        let mut valid = Vec::new();
        for &candidate in candidates {
            if candidate < self.min_context || candidate > self.max_context {
                tracing::warn!(candidate, "dropping out-of-bounds context size");
                continue;
            }
            if !valid.contains(&candidate) {
                valid.push(candidate);
            }
        }

        if valid.is_empty() {
            tracing::warn!(fallback, "no valid context sizes, using engine default");
            valid.push(fallback);
        }
        valid
    }

    /// One calibration call under the live serialization lock.
    async fn measure_once(&self, params: &GenerationParams) -> Result<RunSample, InferenceError> {
        let engine = Arc::clone(&self.engine);
        let params = params.clone();

        let serial = self.engine_lock.lock().await;
        let start = Instant::now();
        let joined = tokio::task::spawn_blocking(move || engine.generate(&params)).await;
        let latency = start.elapsed();
        drop(serial);

        let output = joined
            .map_err(|e| InferenceError::Engine(EngineError::Generation(e.to_string())))??;

        let latency_ms = latency.as_secs_f64() * 1000.0;

        // Approximate TTFT from backend-reported load + prompt evaluation
        // timing; null when the backend does not expose it.
        let ttft_ms = match (output.load_duration_ns, output.prompt_eval_duration_ns) {
            (Some(load), Some(prompt_eval)) => Some((load + prompt_eval) as f64 / 1_000_000.0),
            (None, Some(prompt_eval)) => Some(prompt_eval as f64 / 1_000_000.0),
            _ => None,
        };

        let tokens_per_second = match output.eval_duration_ns {
            Some(eval_ns) if eval_ns > 0 => {
                output.completion_tokens as f64 / (eval_ns as f64 / 1_000_000_000.0)
            }
            // Wall-clock fallback when the backend reports no generation
            // duration.
            _ if latency_ms > 0.0 => output.completion_tokens as f64 / (latency_ms / 1000.0),
            _ => 0.0,
        };

        Ok(RunSample {
            latency_ms,
            ttft_ms,
            completion_tokens: output.completion_tokens,
            tokens_per_second,
        })
    }
}

/// Mean of each metric across runs; TTFT averaged only over reporting runs.
fn aggregate(context_size: u32, samples: &[RunSample]) -> ContextProfile {
    let n = samples.len().max(1) as f64;

    let ttfts: Vec<f64> = samples.iter().filter_map(|s| s.ttft_ms).collect();
    let avg_ttft_ms = if ttfts.is_empty() {
        None
    } else {
        Some(ttfts.iter().sum::<f64>() / ttfts.len() as f64)
    };

    ContextProfile {
        context_size,
        runs: samples.len() as u32,
        avg_latency_ms: samples.iter().map(|s| s.latency_ms).sum::<f64>() / n,
        avg_ttft_ms,
        avg_completion_tokens: samples.iter().map(|s| s.completion_tokens as f64).sum::<f64>() / n,
        avg_tokens_per_second: samples.iter().map(|s| s.tokens_per_second).sum::<f64>() / n,
    }
}

/// Pick the winning profile (highest throughput, then lower latency) and
/// derive a recommended token budget from it.
pub fn recommend(profiles: &[ContextProfile], requested_max_tokens: u32) -> Option<Recommendation> {
    let best = profiles.iter().reduce(|best, candidate| {
        if candidate.avg_tokens_per_second > best.avg_tokens_per_second
            || (candidate.avg_tokens_per_second == best.avg_tokens_per_second
                && candidate.avg_latency_ms < best.avg_latency_ms)
        {
            candidate
        } else {
            best
        }
    })?;

    Some(Recommendation {
        context_size: best.context_size,
        max_tokens: suggested_token_budget(best.avg_tokens_per_second, requested_max_tokens),
        reason: format!(
            "context size {} delivered the highest measured throughput ({:.1} tok/s)",
            best.context_size, best.avg_tokens_per_second
        ),
    })
}

/// Throughput-to-budget table: slower backends get smaller budgets so
/// responses stay interactive. Floored at 32, capped by the requested
/// budget.
fn suggested_token_budget(tokens_per_second: f64, requested: u32) -> u32 {
    let base = if tokens_per_second < 4.0 {
        64
    } else if tokens_per_second < 8.0 {
        96
    } else if tokens_per_second < 12.0 {
        128
    } else {
        160
    };

    base.min(requested).max(32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solollm_core::engine::GenerationOutput;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Deterministic backend: sleeps a fixed wall time and reports fixed
    /// timing fields.
    struct TimedStub {
        latency: Duration,
        completion_tokens: u32,
        eval_duration_ns: Option<u64>,
        load_duration_ns: Option<u64>,
        prompt_eval_duration_ns: Option<u64>,
        calls: AtomicU32,
    }

    impl TimedStub {
        fn new(latency: Duration, completion_tokens: u32, eval_duration_ns: Option<u64>) -> Self {
            Self {
                latency,
                completion_tokens,
                eval_duration_ns,
                load_duration_ns: None,
                prompt_eval_duration_ns: None,
                calls: AtomicU32::new(0),
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Engine for TimedStub {
        fn is_loaded(&self) -> bool {
            true
        }

        fn model_name(&self) -> String {
            "timed-stub".into()
        }

        fn default_context_size(&self) -> u32 {
            2048
        }

        fn default_thread_count(&self) -> u32 {
            4
        }

        fn generate(&self, _params: &GenerationParams) -> Result<GenerationOutput, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.latency);
            Ok(GenerationOutput {
                text: "benchmark output".into(),
                prompt_tokens: 5,
                completion_tokens: self.completion_tokens,
                eval_duration_ns: self.eval_duration_ns,
                load_duration_ns: self.load_duration_ns,
                prompt_eval_duration_ns: self.prompt_eval_duration_ns,
                total_duration_ns: None,
            })
        }

        fn generate_stream<'a>(
            &'a self,
            _params: &GenerationParams,
        ) -> Result<Box<dyn Iterator<Item = Result<String, EngineError>> + Send + 'a>, EngineError>
        {
            Err(EngineError::Generation("benchmark stub is sync-only".into()))
        }

        fn token_count(&self, text: &str) -> u32 {
            text.split_whitespace().count() as u32
        }
    }

    struct UnloadedStub;

    impl Engine for UnloadedStub {
        fn is_loaded(&self) -> bool {
            false
        }
        fn model_name(&self) -> String {
            "unloaded".into()
        }
        fn default_context_size(&self) -> u32 {
            2048
        }
        fn default_thread_count(&self) -> u32 {
            4
        }
        fn generate(&self, _params: &GenerationParams) -> Result<GenerationOutput, EngineError> {
            Err(EngineError::NotLoaded)
        }
        fn generate_stream<'a>(
            &'a self,
            _params: &GenerationParams,
        ) -> Result<Box<dyn Iterator<Item = Result<String, EngineError>> + Send + 'a>, EngineError>
        {
            Err(EngineError::NotLoaded)
        }
        fn token_count(&self, _text: &str) -> u32 {
            0
        }
    }

    fn runner_for(engine: Arc<dyn Engine>) -> BenchmarkRunner {
        BenchmarkRunner::new(engine, Arc::new(Mutex::new(())))
    }

    fn bench_config(runs: u32, context_sizes: Vec<u32>) -> BenchmarkConfig {
        BenchmarkConfig {
            prompt: "calibration prompt".into(),
            system: None,
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            runs,
            context_sizes,
        }
    }

    fn profile(context_size: u32, tokens_per_second: f64, latency_ms: f64) -> ContextProfile {
        ContextProfile {
            context_size,
            runs: 2,
            avg_latency_ms: latency_ms,
            avg_ttft_ms: None,
            avg_completion_tokens: 10.0,
            avg_tokens_per_second: tokens_per_second,
        }
    }

    #[tokio::test]
    async fn test_aggregation_over_identical_runs() {
        // 3 tokens over a reported 300 ms generation = 10 tok/s.
        let stub = TimedStub::new(Duration::from_millis(300), 3, Some(300_000_000));
        let runner = runner_for(Arc::new(stub));

        let report = runner.run(&bench_config(2, vec![512])).await.unwrap();

        assert_eq!(report.profiles.len(), 1);
        let profile = &report.profiles[0];
        assert_eq!(profile.context_size, 512);
        assert_eq!(profile.runs, 2);
        assert!((profile.avg_tokens_per_second - 10.0).abs() < 0.001);
        assert!(
            profile.avg_latency_ms >= 300.0 && profile.avg_latency_ms < 400.0,
            "avg latency {} outside expected window",
            profile.avg_latency_ms
        );
        assert_eq!(profile.avg_ttft_ms, None);
        assert!((profile.avg_completion_tokens - 3.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_ttft_from_backend_timing() {
        let mut stub = TimedStub::new(Duration::from_millis(5), 4, Some(100_000_000));
        stub.load_duration_ns = Some(40_000_000);
        stub.prompt_eval_duration_ns = Some(60_000_000);
        let runner = runner_for(Arc::new(stub));

        let report = runner.run(&bench_config(1, vec![1024])).await.unwrap();
        let ttft = report.profiles[0].avg_ttft_ms.expect("ttft should be reported");
        assert!((ttft - 100.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_wall_clock_throughput_fallback() {
        // No eval duration reported: tok/s falls back to tokens / wall time.
        let stub = TimedStub::new(Duration::from_millis(100), 5, None);
        let runner = runner_for(Arc::new(stub));

        let report = runner.run(&bench_config(1, vec![512])).await.unwrap();
        let tps = report.profiles[0].avg_tokens_per_second;
        // ~5 tokens in ~100 ms => ~50 tok/s, with scheduling slack.
        assert!(tps > 25.0 && tps <= 50.5, "unexpected fallback tok/s: {tps}");
    }

    #[tokio::test]
    async fn test_candidate_validation() {
        let stub = Arc::new(TimedStub::new(Duration::ZERO, 1, Some(1_000_000)));
        let runner = runner_for(Arc::clone(&stub) as Arc<dyn Engine>);

        // Out-of-bounds and duplicate candidates are dropped, order kept.
        let report = runner
            .run(&bench_config(1, vec![64, 2048, 2048, 999_999, 1024]))
            .await
            .unwrap();
        let sizes: Vec<u32> = report.profiles.iter().map(|p| p.context_size).collect();
        assert_eq!(sizes, vec![2048, 1024]);

        // One run per surviving candidate, none for the dropped ones.
        assert_eq!(stub.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_candidates_fall_back_to_engine_default() {
        let stub = TimedStub::new(Duration::ZERO, 1, Some(1_000_000));
        let runner = runner_for(Arc::new(stub));

        let report = runner.run(&bench_config(1, vec![8, 16])).await.unwrap();
        assert_eq!(report.profiles.len(), 1);
        assert_eq!(report.profiles[0].context_size, 2048);
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails() {
        let runner = runner_for(Arc::new(UnloadedStub));
        let result = runner.run(&bench_config(1, vec![2048])).await;
        assert_eq!(result.unwrap_err(), InferenceError::BackendUnavailable);
    }

    #[test]
    fn test_recommendation_prefers_throughput_over_latency() {
        let profiles = vec![profile(512, 10.0, 300.0), profile(2048, 15.0, 500.0)];
        let rec = recommend(&profiles, 512).unwrap();
        assert_eq!(rec.context_size, 2048);
    }

    #[test]
    fn test_recommendation_tie_breaks_on_latency() {
        let profiles = vec![profile(4096, 12.0, 700.0), profile(1024, 12.0, 250.0)];
        let rec = recommend(&profiles, 512).unwrap();
        assert_eq!(rec.context_size, 1024);
    }

    #[test]
    fn test_token_budget_table() {
        assert_eq!(suggested_token_budget(3.0, 512), 64);
        assert_eq!(suggested_token_budget(7.0, 512), 96);
        assert_eq!(suggested_token_budget(11.0, 512), 128);
        assert_eq!(suggested_token_budget(20.0, 512), 160);

        // Capped by the requested budget, floored at 32.
        assert_eq!(suggested_token_budget(20.0, 100), 100);
        assert_eq!(suggested_token_budget(3.0, 16), 32);
    }

    #[test]
    fn test_report_serialization() {
        let report = BenchmarkReport {
            model: "gemma:2b".into(),
            profiles: vec![profile(2048, 9.5, 410.0)],
            recommendation: recommend(&[profile(2048, 9.5, 410.0)], 512).unwrap(),
            timestamp: Utc::now().to_rfc3339(),
        };

        let json = serde_json::to_string_pretty(&report).unwrap();
        let back: BenchmarkReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.recommendation.context_size, 2048);
        assert_eq!(back.recommendation.max_tokens, 128);
    }
}
