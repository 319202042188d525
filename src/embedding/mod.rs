//! Embedding provider implementations.
//!
//! Concrete backends for [`EmbeddingProvider`]:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`StubProvider`]**: deterministic feature-hashed vectors, no network.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to instantiate the appropriate provider based
//! on the configuration:
//!
//! ```rust,no_run
//! # use hts_harness::config::EmbeddingConfig;
//! # use hts_harness::embedding::{create_provider, EmbeddingProvider};
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;

pub use hts_harness_core::embedding::EmbeddingProvider;
use hts_harness_core::embedding::check_vectors;
use hts_harness_core::lexical::tokenize;

use crate::config::EmbeddingConfig;
use crate::http;

/// Embed one query text and check the vector's shape.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let vectors = provider.embed(&[text.to_string()]).await?;
    check_vectors(&vectors, 1, provider.dims())?;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

/// Instantiate the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "stub" => Ok(Arc::new(StubProvider::new(config.dims.unwrap_or(64)))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Disabled Provider ============

/// Always fails; queries then run lexical-only.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Calls `POST /v1/embeddings`. Reads `OPENAI_API_KEY` once, at construction.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            dims,
            url: format!("{}/v1/embeddings", base.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let started = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = http::post_json(
            &self.client,
            &self.url,
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        let vectors = parse_openai_response(&json)?;
        check_vectors(&vectors, texts.len(), self.dims)?;
        tracing::debug!(
            model = %self.model,
            inputs = texts.len(),
            tokens = json.pointer("/usage/total_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            latency_ms = started.elapsed().as_millis() as u64,
            "embedded batch"
        );
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, parse_vector(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| anyhow!("Invalid embedding component: {}", v))
        })
        .collect()
}

// ============ Ollama Provider ============

/// Calls `POST /api/embed` on the configured Ollama URL (default:
/// `http://localhost:11434`).
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama provider"))?;
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            max_retries: config.max_retries,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let started = Instant::now();
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json =
            http::post_json(&self.client, &self.url, None, &body, self.max_retries, "Ollama").await?;
        let vectors = parse_ollama_response(&json)?;
        check_vectors(&vectors, texts.len(), self.dims)?;
        tracing::debug!(
            model = %self.model,
            inputs = texts.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "embedded batch"
        );
        Ok(vectors)
    }
}

/// Extract the `embeddings` array of arrays.
fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|item| {
            let values = item
                .as_array()
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))?;
            parse_vector(values)
        })
        .collect()
}

// ============ Stub Provider ============

/// Deterministic bag-of-words vectors via signed feature hashing.
///
/// Each lowercased word token is hashed with SHA-256; the first four bytes
/// pick a dimension and the fifth byte a sign. The sum is L2-normalized.
/// Texts sharing vocabulary get positive cosine similarity, which is enough
/// for offline runs and tests.
pub struct StubProvider {
    dims: usize,
}

impl StubProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dims;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
    fn model_name(&self) -> &str {
        "stub-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hts_harness_core::embedding::cosine_similarity;

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_response_rejects_garbage() {
        assert!(parse_openai_response(&serde_json::json!({"error": "x"})).is_err());
        let bad = serde_json::json!({"data": [{"embedding": ["a"]}]});
        assert!(parse_openai_response(&bad).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5], [1.0, 0.0]]});
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_stub_is_deterministic_and_normalized() {
        let stub = StubProvider::new(64);
        let texts = vec!["reciprocating piston engines".to_string()];
        let a = stub.embed(&texts).await.unwrap();
        let b = stub.embed(&texts).await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_stub_similarity_tracks_vocabulary() {
        let stub = StubProvider::new(1024);
        let q = embed_query(&stub, "piston engines").await.unwrap();
        let near = embed_query(&stub, "reciprocating piston engines").await.unwrap();
        let self_sim = cosine_similarity(&q, &q).unwrap();
        let near_sim = cosine_similarity(&q, &near).unwrap();
        assert!((self_sim - 1.0).abs() < 1e-6);
        assert!(near_sim > 0.5, "{}", near_sim);
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let provider = create_provider(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
        assert!(embed_query(provider.as_ref(), "x").await.is_err());
    }
}
