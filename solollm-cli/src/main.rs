//! solollm CLI - drive the admission-controlled generation path or the
//! calibration benchmark against a local Ollama server.
//!
//! ```bash
//! # Stream a generation through the admission controller
//! solollm --model gemma:2b generate "Why is the sky blue?"
//!
//! # Benchmark candidate context sizes and get a tuning recommendation
//! solollm benchmark --context-sizes 1024,2048,4096 --runs 3 -o report.json
//! ```

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use solollm_adapters_ollama::OllamaEngine;
use solollm_benchmarks::{BenchmarkConfig, BenchmarkRunner};
use solollm_core::{InferenceRequest, InferenceService, ServiceConfig};

#[derive(Parser)]
#[command(name = "solollm")]
#[command(version)]
#[command(about = "Admission-controlled serving for a single LLM backend", long_about = None)]
struct Cli {
    /// Ollama server URL
    #[arg(long, global = true, default_value = "http://localhost:11434")]
    url: String,

    /// Model to serve
    #[arg(long, global = true, default_value = "gemma:2b")]
    model: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text through the admission-controlled path
    Generate {
        /// The prompt to complete
        prompt: String,

        /// Optional system prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Token budget for the response
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Wait for the full response instead of streaming tokens
        #[arg(long)]
        sync: bool,
    },

    /// Benchmark candidate context sizes and print a tuning recommendation
    Benchmark {
        /// Calibration prompt
        #[arg(
            long,
            default_value = "Explain the difference between concurrency and parallelism."
        )]
        prompt: String,

        /// Calibration runs per context size
        #[arg(long)]
        runs: Option<u32>,

        /// Candidate context sizes (comma separated)
        #[arg(long, value_delimiter = ',')]
        context_sizes: Vec<u32>,

        /// Output file for the JSON report
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("solollm=info,solollm_core=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    let engine = Arc::new(OllamaEngine::new(&cli.url, &cli.model, &config));
    {
        // The adapter uses a blocking HTTP client; keep it off the runtime.
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || engine.connect())
            .await?
            .with_context(|| format!("failed to connect to ollama at {}", cli.url))?;
    }

    match cli.command {
        Commands::Generate {
            prompt,
            system,
            max_tokens,
            sync,
        } => {
            let service = InferenceService::new(engine, &config);
            service.start();

            let mut params = config.generation_params(prompt, system);
            if let Some(n) = max_tokens {
                params.max_tokens = n;
            }

            let (request, mut handle) = InferenceRequest::new(params, !sync);
            let admission = service.submit(request).await?;
            tracing::debug!(?admission, "request submitted");

            while let Some(token) = handle.next_token().await {
                print!("{}", token?);
                std::io::stdout().flush().ok();
            }
            println!();

            let stats = handle.stats().await?;
            println!(
                "[{} prompt + {} completion = {} tokens]",
                stats.prompt_tokens, stats.completion_tokens, stats.total_tokens
            );

            service.stop();
        }

        Commands::Benchmark {
            prompt,
            runs,
            context_sizes,
            output,
        } => {
            let service = InferenceService::new(engine, &config);
            let runner = BenchmarkRunner::for_service(&service, &config);

            let mut bench = BenchmarkConfig::from_service_config(&config, prompt);
            if let Some(runs) = runs {
                bench.runs = runs;
            }
            if !context_sizes.is_empty() {
                bench.context_sizes = context_sizes;
            }

            println!(
                "🚀 solollm calibration: {} runs per context size, candidates {:?}\n",
                bench.runs, bench.context_sizes
            );

            let report = runner.run(&bench).await?;

            println!("Model: {}\n", report.model);
            println!(
                "{:>8} {:>10} {:>12} {:>10} {:>8}",
                "ctx", "tok/s", "latency ms", "ttft ms", "tokens"
            );
            for profile in &report.profiles {
                let ttft = profile
                    .avg_ttft_ms
                    .map(|v| format!("{v:.0}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>8} {:>10.1} {:>12.0} {:>10} {:>8.0}",
                    profile.context_size,
                    profile.avg_tokens_per_second,
                    profile.avg_latency_ms,
                    ttft,
                    profile.avg_completion_tokens
                );
            }

            let rec = &report.recommendation;
            println!(
                "\n📊 Recommendation: num_ctx={} max_tokens={}",
                rec.context_size, rec.max_tokens
            );
            println!("   {}", rec.reason);

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("failed to write {path}"))?;
                println!("\nResults saved to {path}");
            }
        }
    }

    Ok(())
}
