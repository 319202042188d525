//! Generation provider implementations.
//!
//! Concrete backends for [`Generator`]:
//! - **[`DisabledGenerator`]**: returns errors; classification then abstains.
//! - **[`OpenAIGenerator`]**: `POST /v1/chat/completions` with JSON output mode.
//! - **[`OllamaGenerator`]**: `POST /api/chat` on a local Ollama instance.
//! - **[`StubGenerator`]**: deterministic offline answers built from the prompt.
//!
//! Every request carries `max_tokens` and is bounded by the client timeout;
//! the engine applies `CompletionRequest::timeout` on top. Prompts are
//! never logged.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

pub use hts_harness_core::generation::{Completion, CompletionRequest, Generator};
use hts_harness_core::validate::DISCLAIMER;

use crate::config::GenerationConfig;
use crate::http;
use crate::prompt::{estimate_tokens, PASSAGE_ID_MARKER};

/// Instantiate the generator named by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "stub" => Ok(Arc::new(StubGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

fn log_call(model: &str, started: Instant, completion: &Completion) {
    tracing::info!(
        model,
        tokens_in = completion.tokens_in,
        tokens_out = completion.tokens_out,
        latency_ms = started.elapsed().as_millis() as u64,
        "generation call"
    );
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion> {
        bail!("Generation provider is disabled")
    }
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            url: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let started = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "max_tokens": request.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
        });
        // No retries: the caller's timeout must cover the whole call.
        let json = http::post_json(&self.client, &self.url, Some(&self.api_key), &body, 0, "OpenAI").await?;
        let completion = parse_openai_chat(&json)?;
        log_call(&self.model, started, &completion);
        Ok(completion)
    }
}

fn parse_openai_chat(json: &serde_json::Value) -> Result<Completion> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))?;
    Ok(Completion {
        text: text.to_string(),
        tokens_in: json
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        tokens_out: json
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    })
}

// ============ Ollama ============

pub struct OllamaGenerator {
    model: String,
    url: String,
    temperature: f32,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            url: format!("{}/api/chat", base.trim_end_matches('/')),
            temperature: config.temperature,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let started = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "stream": false,
            "format": "json",
            "options": {
                "num_predict": request.max_tokens,
                "temperature": self.temperature,
            },
        });
        let json = http::post_json(&self.client, &self.url, None, &body, 0, "Ollama").await?;
        let completion = parse_ollama_chat(&json)?;
        log_call(&self.model, started, &completion);
        Ok(completion)
    }
}

fn parse_ollama_chat(json: &serde_json::Value) -> Result<Completion> {
    let text = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))?;
    Ok(Completion {
        text: text.to_string(),
        tokens_in: json.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
        tokens_out: json.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

// ============ Stub ============

/// Answers from the first passage in the prompt: cites its id and reports
/// the first tariff number found in its text. Returns an empty `codes`
/// list when the prompt has no passage or the passage has no number.
pub struct StubGenerator;

impl StubGenerator {
    fn answer(prompt: &str) -> String {
        static CODE: OnceLock<Regex> = OnceLock::new();
        let code_re = CODE.get_or_init(|| {
            Regex::new(r"\b\d{4}\.\d{2}(?:\.\d{2}){0,2}\b").expect("static regex")
        });

        let mut lines = prompt.lines();
        let header = lines.by_ref().find(|l| l.starts_with('[') && l.contains(PASSAGE_ID_MARKER));
        let first = header.and_then(|h| {
            let id = h
                .split(PASSAGE_ID_MARKER)
                .nth(1)?
                .split_whitespace()
                .next()?
                .to_string();
            let body: Vec<&str> = lines.take_while(|l| !l.trim().is_empty()).collect();
            let body = body.join(" ");
            let code = code_re.find(&body)?.as_str().to_string();
            Some((id, code, body))
        });

        let codes = match first {
            Some((id, code, body)) => {
                let description: String = body.chars().take(80).collect();
                serde_json::json!([{
                    "code": code,
                    "description": description,
                    "duty_rate": null,
                    "rationale": format!("The cited passage describes heading {}.", code),
                    "confidence": 0.6,
                    "citations": [id],
                }])
            }
            None => serde_json::json!([]),
        };
        serde_json::json!({ "codes": codes, "disclaimer": DISCLAIMER }).to_string()
    }
}

#[async_trait]
impl Generator for StubGenerator {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let started = Instant::now();
        let text = Self::answer(&request.prompt);
        let completion = Completion {
            tokens_in: estimate_tokens(&request.system) + estimate_tokens(&request.prompt),
            tokens_out: estimate_tokens(&text).min(u64::from(request.max_tokens)),
            text,
        };
        log_call("stub", started, &completion);
        Ok(completion)
    }
}
