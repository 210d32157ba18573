//! Ollama backend for the solollm engine seam.
//!
//! Talks to a local Ollama server over its HTTP API with a blocking client.
//! The controller and benchmark runner only ever call this from a worker
//! thread and never concurrently, matching the [`Engine`] contract; do not
//! call generation methods on the async runtime directly.

use std::io::{BufRead, BufReader, Lines};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use solollm_core::engine::{Engine, EngineError, GenerationOutput, GenerationParams};
use solollm_core::ServiceConfig;

/// Sampling options for `/api/generate`.
#[derive(Debug, Serialize)]
struct OllamaOptions<'a> {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    stop: &'a [String],
    num_ctx: u32,
    num_thread: u32,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    keep_alive: &'a str,
    options: OllamaOptions<'a>,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Debug, Deserialize)]
struct OllamaModelTag {
    #[serde(default)]
    name: String,
}

/// Blocking engine backed by an Ollama server.
pub struct OllamaEngine {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    keep_alive: String,
    default_context_size: u32,
    default_thread_count: u32,
    loaded: AtomicBool,
}

impl OllamaEngine {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            keep_alive: config.keep_alive.clone(),
            default_context_size: config.context_size,
            default_thread_count: config.thread_count,
            loaded: AtomicBool::new(false),
        }
    }

    /// Verify the server is reachable and flip the loaded flag.
    ///
    /// A missing model is logged but not fatal here: generation against an
    /// absent model fails with a backend error at call time.
    pub fn connect(&self) -> Result<(), EngineError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "ollama returned {} for {}",
                response.status(),
                url
            )));
        }

        let tags: OllamaTagsResponse = response
            .json()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !tags.models.iter().any(|m| m.name == self.model) {
            tracing::warn!(
                model = %self.model,
                "model not found on server; pull it with `ollama pull` before generating"
            );
        }

        self.loaded.store(true, Ordering::SeqCst);
        tracing::info!(model = %self.model, url = %self.base_url, "ollama backend ready");
        Ok(())
    }

    fn request_body<'a>(
        &'a self,
        params: &'a GenerationParams,
        stream: bool,
    ) -> OllamaGenerateRequest<'a> {
        OllamaGenerateRequest {
            model: &self.model,
            prompt: &params.prompt,
            system: params.system.as_deref(),
            stream,
            keep_alive: &self.keep_alive,
            options: OllamaOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                stop: &params.stop,
                num_ctx: params.context_size.unwrap_or(self.default_context_size),
                num_thread: params.thread_count.unwrap_or(self.default_thread_count),
            },
        }
    }

    fn post_generate(
        &self,
        params: &GenerationParams,
        stream: bool,
    ) -> Result<reqwest::blocking::Response, EngineError> {
        if !self.is_loaded() {
            return Err(EngineError::NotLoaded);
        }

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&self.request_body(params, stream))
            .send()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(EngineError::Generation(format!(
                "ollama error ({status}): {body}"
            )));
        }
        Ok(response)
    }

    fn estimate_tokens(text: &str) -> u32 {
        // Rough estimate, ~1.3 tokens per word on average.
        (text.split_whitespace().count() as f32 * 1.3) as u32
    }
}

impl Engine for OllamaEngine {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }

    fn default_context_size(&self) -> u32 {
        self.default_context_size
    }

    fn default_thread_count(&self) -> u32 {
        self.default_thread_count
    }

    fn generate(&self, params: &GenerationParams) -> Result<GenerationOutput, EngineError> {
        let response = self.post_generate(params, false)?;
        let body: OllamaGenerateResponse = response
            .json()
            .map_err(|e| EngineError::Generation(e.to_string()))?;

        Ok(GenerationOutput {
            prompt_tokens: body
                .prompt_eval_count
                .unwrap_or_else(|| Self::estimate_tokens(&params.prompt)),
            completion_tokens: body
                .eval_count
                .unwrap_or_else(|| Self::estimate_tokens(&body.response)),
            total_duration_ns: body.total_duration,
            load_duration_ns: body.load_duration,
            prompt_eval_duration_ns: body.prompt_eval_duration,
            eval_duration_ns: body.eval_duration,
            text: body.response,
        })
    }

    fn generate_stream<'a>(
        &'a self,
        params: &GenerationParams,
    ) -> Result<Box<dyn Iterator<Item = Result<String, EngineError>> + Send + 'a>, EngineError>
    {
        let response = self.post_generate(params, true)?;
        Ok(Box::new(OllamaStream {
            lines: BufReader::new(response).lines(),
            done: false,
        }))
    }

    fn token_count(&self, text: &str) -> u32 {
        Self::estimate_tokens(text)
    }
}

/// NDJSON token stream from `/api/generate`.
///
/// Each line is one chunk; empty increments are skipped; the iterator ends
/// at the chunk marked `done` or at end of input.
struct OllamaStream {
    lines: Lines<BufReader<reqwest::blocking::Response>>,
    done: bool,
}

impl Iterator for OllamaStream {
    type Item = Result<String, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(EngineError::Transport(e.to_string())));
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let chunk: OllamaGenerateResponse = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.done = true;
                    return Some(Err(EngineError::Generation(format!(
                        "bad stream chunk: {e}"
                    ))));
                }
            };

            if chunk.done {
                self.done = true;
            }
            if !chunk.response.is_empty() {
                return Some(Ok(chunk.response));
            }
        }
        None
    }
}
