//! Configuration parsing and validation.
//!
//! HTS Harness is configured by one TOML file, passed with `--config`
//! (default `./config/hts.toml`). It is read and validated once at startup;
//! every component receives the parts it needs explicitly.
//!
//! # Sections
//!
//! | Section | Required | Purpose |
//! |---------|----------|---------|
//! | `[db]` | yes | SQLite database path |
//! | `[chunking]` | no | Window and overlap, in words |
//! | `[retrieval]` | no | Alpha, BM25 parameters, K, candidate pools |
//! | `[guardrail]` | no | Evidence thresholds, broadening, code confidence floor |
//! | `[embedding]` | no | Embedding provider |
//! | `[generation]` | no | Generation provider, token cap, timeout |
//! | `[budget]` | no | Per-query and monthly token caps |
//! | `[metrics]` | no | JSONL metrics log path |
//! | `[ingest]` | no | Conflict policy for changed text |
//! | `[server]` | no | HTTP bind address |
//! | `[logging]` | no | Default log level (`RUST_LOG` overrides) |
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/hts.sqlite"
//!
//! [retrieval]
//! alpha = 0.75
//! top_k = 6
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use anyhow::{bail, Context, Result};
use hts_harness_core::chunk::ChunkingPolicy;
use hts_harness_core::fusion::FusionParams;
use hts_harness_core::guardrail::{BroadenPolicy, Thresholds};
use hts_harness_core::ingest::ConflictPolicy;
use hts_harness_core::lexical::Bm25Params;
use hts_harness_core::search::SearchParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub guardrail: GuardrailConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Window and overlap are counted in whitespace-delimited words.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_window_size() -> usize {
    180
}
fn default_overlap() -> usize {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Semantic weight: `fused = α × semantic + (1 − α) × lexical`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Upper bound for `top_k`, including request overrides and broadening.
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_lexical: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_semantic: usize,
    #[serde(default)]
    pub semantic_floor: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            candidate_k_lexical: default_candidate_k(),
            candidate_k_semantic: default_candidate_k(),
            semantic_floor: 0.0,
        }
    }
}

fn default_alpha() -> f64 {
    0.75
}
fn default_bm25_k1() -> f64 {
    1.4
}
fn default_bm25_b() -> f64 {
    0.8
}
fn default_top_k() -> usize {
    6
}
fn default_max_top_k() -> usize {
    20
}
fn default_candidate_k() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailConfig {
    #[serde(default = "default_min_evidence")]
    pub min_evidence: f64,
    #[serde(default = "default_maybe_floor")]
    pub maybe_floor: f64,
    #[serde(default = "default_broaden_factor")]
    pub broaden_factor: usize,
    /// Alpha for the broadened attempt; unset keeps the first attempt's.
    #[serde(default)]
    pub retry_alpha: Option<f64>,
    /// Validated codes below this confidence are dropped.
    #[serde(default = "default_min_code_confidence")]
    pub min_code_confidence: f64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            min_evidence: default_min_evidence(),
            maybe_floor: default_maybe_floor(),
            broaden_factor: default_broaden_factor(),
            retry_alpha: None,
            min_code_confidence: default_min_code_confidence(),
        }
    }
}

fn default_min_evidence() -> f64 {
    0.40
}
fn default_maybe_floor() -> f64 {
    0.20
}
fn default_broaden_factor() -> usize {
    2
}
fn default_min_code_confidence() -> f64 {
    0.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, `ollama`, or `stub`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (e.g. `http://localhost:11434` for Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `disabled`, `openai`, `ollama`, or `stub`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_gen_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_gen_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_tokens: default_gen_max_tokens(),
            timeout_secs: default_gen_timeout_secs(),
            temperature: 0.0,
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_gen_max_tokens() -> u32 {
    320
}
fn default_gen_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    /// Estimated prompt plus completion tokens allowed per logical query.
    #[serde(default = "default_max_tokens_per_query")]
    pub max_tokens_per_query: u64,
    /// Monthly cap across all queries; unset means unlimited.
    #[serde(default)]
    pub max_monthly_tokens: Option<u64>,
    /// JSON file holding the month's usage; defaults next to the database.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_query: default_max_tokens_per_query(),
            max_monthly_tokens: None,
            state_path: None,
        }
    }
}

fn default_max_tokens_per_query() -> u64 {
    6000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// JSONL file receiving one record per attempt; unset disables metrics.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IngestConfig {
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn chunking_policy(&self) -> Result<ChunkingPolicy> {
        Ok(ChunkingPolicy::new(
            self.chunking.window_size,
            self.chunking.overlap,
        )?)
    }

    pub fn bm25_params(&self) -> Result<Bm25Params> {
        Ok(Bm25Params::new(
            self.retrieval.bm25_k1,
            self.retrieval.bm25_b,
        )?)
    }

    /// First-attempt retrieval parameters, with optional per-query
    /// overrides. An overridden K is capped at `max_top_k`.
    pub fn search_params(&self, top_k: Option<usize>, alpha: Option<f64>) -> Result<SearchParams> {
        let top_k = top_k
            .unwrap_or(self.retrieval.top_k)
            .min(self.retrieval.max_top_k);
        let fusion = FusionParams::new(alpha.unwrap_or(self.retrieval.alpha), top_k)?;
        Ok(SearchParams::new(
            fusion,
            self.retrieval.candidate_k_lexical,
            self.retrieval.candidate_k_semantic,
            self.retrieval.semantic_floor,
        )?)
    }

    pub fn thresholds(&self) -> Result<Thresholds> {
        Ok(Thresholds::new(
            self.guardrail.min_evidence,
            self.guardrail.maybe_floor,
        )?)
    }

    pub fn broaden_policy(&self) -> Result<BroadenPolicy> {
        Ok(BroadenPolicy::new(
            self.guardrail.broaden_factor,
            self.retrieval.max_top_k,
            self.guardrail.retry_alpha,
        )?)
    }

    /// Where the monthly token usage is persisted.
    pub fn budget_state_path(&self) -> PathBuf {
        match &self.budget.state_path {
            Some(p) => p.clone(),
            None => self.db.path.with_extension("budget.json"),
        }
    }
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    config.chunking_policy()?;
    config.bm25_params()?;
    config.thresholds()?;
    config.broaden_policy()?;

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.top_k > config.retrieval.max_top_k {
        bail!(
            "retrieval.top_k ({}) must not exceed retrieval.max_top_k ({})",
            config.retrieval.top_k,
            config.retrieval.max_top_k
        );
    }
    config.search_params(None, None)?;

    if !(0.0..=1.0).contains(&config.guardrail.min_code_confidence) {
        bail!("guardrail.min_code_confidence must be in [0.0, 1.0]");
    }

    let embedding = &config.embedding;
    match embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "stub" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or stub.",
            other
        ),
    }
    if embedding.is_enabled() {
        if embedding.dims.is_none() || embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.model.is_none() && embedding.provider != "stub" {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                embedding.provider
            );
        }
        if embedding.batch_size == 0 {
            bail!("embedding.batch_size must be >= 1");
        }
        if embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be >= 1");
        }
    }

    let generation = &config.generation;
    match generation.provider.as_str() {
        "disabled" | "openai" | "ollama" | "stub" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, ollama, or stub.",
            other
        ),
    }
    if generation.is_enabled() {
        if generation.model.is_none() && generation.provider != "stub" {
            bail!(
                "generation.model must be specified when provider is '{}'",
                generation.provider
            );
        }
        if generation.max_tokens == 0 {
            bail!("generation.max_tokens must be >= 1");
        }
        if generation.timeout_secs == 0 {
            bail!("generation.timeout_secs must be >= 1");
        }
        if !(0.0..=2.0).contains(&generation.temperature) {
            bail!("generation.temperature must be in [0.0, 2.0]");
        }
    }

    if config.budget.max_tokens_per_query < u64::from(generation.max_tokens) {
        bail!(
            "budget.max_tokens_per_query ({}) must be at least generation.max_tokens ({})",
            config.budget.max_tokens_per_query,
            generation.max_tokens
        );
    }

    Ok(())
}
