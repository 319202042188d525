//! Query engine: retrieval, guardrail, generation and validation for one
//! logical query.
//!
//! # Pipeline
//!
//! ```text
//! query ──┬── lexical scoring (blocking pool) ──┐
//!         └── query embedding (with timeout) ───┴─► fuse ─► decide
//!                                                         │
//!          RETRY (once, broadened) ◄──────────────────────┤
//!          ABSTAIN ◄──────────────────────────────────────┤
//!          ANSWER ─► generate ─► validate (+1 repair) ─► drop weak codes
//! ```
//!
//! Every attempt writes one [`MetricsRecord`]. Generation timeouts and
//! budget exhaustion become ABSTAIN decisions, never errors; only
//! configuration and storage failures propagate to the caller.
//!
//! The engine reads from an [`IndexSnapshot`] held in a [`SnapshotCell`].
//! A query keeps the snapshot it started with even if an ingestion
//! publishes a new one meanwhile. Before each query the engine compares the
//! store's [`data_version`](Store::data_version) with the version the
//! snapshot was built from and rebuilds when they differ, so writes made by
//! another process (`hts ingest`, `hts embed`) reach a running server.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use hts_harness_core::embedding::EmbeddingProvider;
use hts_harness_core::error::Error as CoreError;
use hts_harness_core::fusion::ChunkCandidate;
use hts_harness_core::generation::{Completion, CompletionRequest, Generator};
use hts_harness_core::guardrail::{
    self, Attempt, BroadenPolicy, Decision, DecisionKind, ReasonCode, Thresholds,
};
use hts_harness_core::index::{IndexSnapshot, SnapshotCell};
use hts_harness_core::ingest::{self, IngestOutcome};
use hts_harness_core::lexical::Bm25Params;
use hts_harness_core::metrics::{MetricsRecord, MetricsSink};
use hts_harness_core::models::DocumentInput;
use hts_harness_core::search::{self, Retrieval, RetrievalMode, SearchParams, SearchResultItem};
use hts_harness_core::store::Store;
use hts_harness_core::validate::{
    validate_and_maybe_repair, CodeCandidate, GeneratedAnswer, ValidationReport,
    ValidatorOutcome, DISCLAIMER, NO_CONFIDENT_CLASSIFICATION,
};

use crate::budget::{BudgetExceeded, QueryBudget, TokenBudget};
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::generation;
use crate::metrics;
use crate::prompt::{estimate_tokens, repair_prompt, system_rules, user_prompt, Passage};
use crate::sqlite_store::SqliteStore;

/// Snippet length for search results.
const SNIPPET_CHARS: usize = 240;

/// `POST /classify` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifyRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub alpha: Option<f64>,
}

/// Answer or safe abstain. Both carry the disclaimer.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyResponse {
    pub query_id: String,
    pub decision: DecisionKind,
    pub reason: ReasonCode,
    /// Top validated code, or [`NO_CONFIDENT_CLASSIFICATION`].
    pub answer: String,
    pub codes: Vec<CodeCandidate>,
    pub citations: Vec<String>,
    /// Confidence of the top code; 0 on abstain.
    pub confidence: f64,
    /// Evidence strength of the deciding attempt.
    pub evidence_strength: Option<f64>,
    pub mode: RetrievalMode,
    pub attempts: u32,
    pub disclaimer: String,
}

impl ClassifyResponse {
    fn abstain(query_id: String, decision: &Decision, mode: RetrievalMode, attempts: u32) -> Self {
        Self {
            query_id,
            decision: DecisionKind::Abstain,
            reason: decision.reason,
            answer: NO_CONFIDENT_CLASSIFICATION.to_string(),
            codes: Vec::new(),
            citations: Vec::new(),
            confidence: 0.0,
            evidence_strength: decision.strength,
            mode,
            attempts,
            disclaimer: DISCLAIMER.to_string(),
        }
    }

    fn answer(
        query_id: String,
        decision: &Decision,
        answer: GeneratedAnswer,
        mode: RetrievalMode,
        attempts: u32,
    ) -> Self {
        let citations = answer.citations();
        let top = answer.codes.first();
        Self {
            query_id,
            decision: DecisionKind::Answer,
            reason: decision.reason,
            answer: top
                .map(|c| c.code.clone())
                .unwrap_or_else(|| NO_CONFIDENT_CLASSIFICATION.to_string()),
            confidence: top.map(|c| c.confidence).unwrap_or(0.0),
            codes: answer.codes,
            citations,
            evidence_strength: decision.strength,
            mode,
            attempts,
            disclaimer: DISCLAIMER.to_string(),
        }
    }

    pub fn is_answer(&self) -> bool {
        self.decision == DecisionKind::Answer
    }
}

/// `POST /search` body.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub alpha: Option<f64>,
    #[serde(default)]
    pub explain: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub mode: RetrievalMode,
    pub alpha: f64,
    pub semantic_degraded: bool,
    pub results: Vec<SearchResultItem>,
}

/// What generation and validation produced for an ANSWER attempt.
struct GenerationOutcome {
    decision: Decision,
    answer: Option<GeneratedAnswer>,
    validator: ValidatorOutcome,
    tokens_in: u64,
    tokens_out: u64,
    repair_attempted: bool,
}

pub struct Engine {
    config: Config,
    store: Arc<dyn Store>,
    snapshot: SnapshotCell,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Arc<dyn Generator>,
    budget: TokenBudget,
    sink: Arc<dyn MetricsSink>,
    bm25: Bm25Params,
    thresholds: Thresholds,
    broaden: BroadenPolicy,
    /// Store version the current snapshot was built from.
    loaded_version: AtomicU64,
    reload_lock: tokio::sync::Mutex<()>,
}

/// Nothing loaded yet.
const NO_VERSION: u64 = u64::MAX;

impl Engine {
    /// Assemble an engine from its collaborators. `embedder` is `None` in
    /// lexical-only deployments. Call [`reload`](Engine::reload) before
    /// serving queries.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        generator: Arc<dyn Generator>,
        budget: TokenBudget,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let bm25 = config.bm25_params()?;
        let thresholds = config.thresholds()?;
        let broaden = config.broaden_policy()?;
        Ok(Self {
            snapshot: SnapshotCell::new(IndexSnapshot::empty(bm25)),
            config,
            store,
            embedder,
            generator,
            budget,
            sink,
            bm25,
            thresholds,
            broaden,
            loaded_version: AtomicU64::new(NO_VERSION),
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Build the production engine for `config`: SQLite store, configured
    /// providers, persisted budget, JSONL metrics. The snapshot is loaded.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let embedder = if config.embedding.is_enabled() {
            Some(embedding::create_provider(&config.embedding)?)
        } else {
            None
        };
        let generator = generation::create_generator(&config.generation)?;
        let budget = TokenBudget::from_config(&config)?;
        let sink = metrics::create_sink(&config.metrics)?;

        let engine = Self::new(config, store, embedder, generator, budget, sink)?;
        engine.reload().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// The snapshot new queries will read.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot.load()
    }

    /// Rebuild the index snapshot from the store and publish it.
    pub async fn reload(&self) -> Result<Arc<IndexSnapshot>> {
        // Read the version first: a write racing the load then only causes
        // one extra rebuild later.
        let version = self.store.data_version().await?;
        let chunks = self.store.load_chunks().await?;
        let snap = self.snapshot.publish(chunks, self.bm25);
        self.loaded_version.store(version, Ordering::SeqCst);
        tracing::info!(
            generation = snap.generation(),
            chunks = snap.len(),
            embedded = snap.embedded_count(),
            version,
            "index snapshot published"
        );
        Ok(snap)
    }

    /// Reload if the store changed since the snapshot was built. Returns
    /// whether a new snapshot was published.
    pub async fn refresh(&self) -> Result<bool> {
        let current = self.store.data_version().await?;
        if self.loaded_version.load(Ordering::SeqCst) == current {
            return Ok(false);
        }
        let _guard = self.reload_lock.lock().await;
        // A concurrent caller may have reloaded while this one waited.
        if self.loaded_version.load(Ordering::SeqCst) == self.store.data_version().await? {
            return Ok(false);
        }
        self.reload().await?;
        Ok(true)
    }

    /// Snapshot for a new query, refreshed if the store moved on. A failed
    /// refresh keeps serving the previous snapshot.
    pub async fn current_snapshot(&self) -> Arc<IndexSnapshot> {
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "index refresh failed; serving the previous snapshot");
        }
        self.snapshot.load()
    }

    /// Ingest one document and, if anything changed, publish a snapshot
    /// that includes it.
    pub async fn ingest(&self, input: &DocumentInput) -> Result<IngestOutcome> {
        let policy = self.config.chunking_policy()?;
        let outcome = ingest::ingest(
            self.store.as_ref(),
            input,
            &policy,
            self.config.ingest.on_conflict,
        )
        .await?;
        if outcome.changed() {
            let _guard = self.reload_lock.lock().await;
            self.reload().await?;
        }
        Ok(outcome)
    }

    /// Hybrid search without the guardrail or generation.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            bail!("query must not be empty");
        }
        let params = self.config.search_params(request.top_k, request.alpha)?;
        let snap = self.current_snapshot().await;

        let (lexical, (embedding, degraded)) = tokio::join!(
            lexical_stream(Arc::clone(&snap), query, params.candidate_k_lexical),
            self.embed_query(&snap, query)
        );
        let retrieval = fuse_streams(&snap, query, lexical?, embedding.as_deref(), &params);

        Ok(SearchResponse {
            mode: retrieval.mode,
            alpha: retrieval.alpha,
            semantic_degraded: degraded,
            results: search::to_result_items(&snap, &retrieval, request.explain, SNIPPET_CHARS),
        })
    }

    /// Run one logical query to an ANSWER or ABSTAIN.
    pub async fn classify(&self, request: &ClassifyRequest) -> Result<ClassifyResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            bail!("query must not be empty");
        }
        let query_id = Uuid::new_v4().to_string();
        let mut params = self.config.search_params(request.top_k, request.alpha)?;
        let snap = self.current_snapshot().await;
        let query_budget = self.budget.query();
        tracing::debug!(query_id = %query_id, generation = snap.generation(), "classify");

        let mut attempt_started = Instant::now();
        let (lexical, (embedding, degraded)) = tokio::join!(
            lexical_stream(Arc::clone(&snap), query, params.candidate_k_lexical),
            self.embed_query(&snap, query)
        );
        let mut lexical = lexical?;
        let mut attempt = Attempt::First;

        loop {
            let retrieval = fuse_streams(
                &snap,
                query,
                std::mem::take(&mut lexical),
                embedding.as_deref(),
                &params,
            );
            let decision = guardrail::decide(retrieval.evidence, attempt, &self.thresholds);
            let mut record = attempt_record(
                &query_id,
                attempt,
                &retrieval,
                degraded,
                &params,
                &decision,
            );

            if decision.kind == DecisionKind::Retry && attempt == Attempt::First {
                record.latency_ms = attempt_started.elapsed().as_millis() as u64;
                self.emit(&record);
                tracing::info!(
                    query_id = %query_id,
                    strength = ?decision.strength,
                    "weak evidence; retrying with broadened retrieval"
                );

                attempt = Attempt::Retry;
                attempt_started = Instant::now();
                params = self.broaden.broaden(&params)?;
                lexical = lexical_stream(Arc::clone(&snap), query, params.candidate_k_lexical).await?;
                continue;
            }
            // The retry bound holds even if the guardrail asked again.
            let decision = if decision.kind == DecisionKind::Retry {
                Decision::abstain(ReasonCode::RetryExhausted, decision.strength)
            } else {
                decision
            };

            if !decision.is_answer() {
                record.decision = decision.kind;
                record.reason = decision.reason;
                record.latency_ms = attempt_started.elapsed().as_millis() as u64;
                self.emit(&record);
                tracing::info!(query_id = %query_id, reason = %decision.reason, "abstain");
                return Ok(ClassifyResponse::abstain(
                    query_id,
                    &decision,
                    retrieval.mode,
                    attempt.number(),
                ));
            }

            let outcome = self
                .generate_answer(&query_budget, query, &snap, &retrieval, &decision)
                .await;
            record.decision = outcome.decision.kind;
            record.reason = outcome.decision.reason;
            record.validator_outcome = outcome.validator;
            record.tokens_in = outcome.tokens_in;
            record.tokens_out = outcome.tokens_out;
            record.repair_attempted = outcome.repair_attempted;
            record.latency_ms = attempt_started.elapsed().as_millis() as u64;
            self.emit(&record);
            tracing::info!(
                query_id = %query_id,
                decision = outcome.decision.kind.as_str(),
                reason = %outcome.decision.reason,
                validator = outcome.validator.as_str(),
                "classified"
            );

            return Ok(match outcome.answer {
                Some(answer) if outcome.decision.is_answer() => ClassifyResponse::answer(
                    query_id,
                    &outcome.decision,
                    answer,
                    retrieval.mode,
                    attempt.number(),
                ),
                _ => ClassifyResponse::abstain(
                    query_id,
                    &outcome.decision,
                    retrieval.mode,
                    attempt.number(),
                ),
            });
        }
    }

    /// Embed the query, or explain why there is no query vector.
    ///
    /// Returns `(vector, degraded)`. No provider or an index without
    /// embeddings is plain lexical-only; a failed or timed-out call is
    /// lexical-only *and* degraded.
    async fn embed_query(&self, snap: &IndexSnapshot, query: &str) -> (Option<Vec<f32>>, bool) {
        let Some(provider) = &self.embedder else {
            return (None, false);
        };
        if snap.embedded_count() == 0 {
            return (None, false);
        }
        let timeout = Duration::from_secs(self.config.embedding.timeout_secs);
        match tokio::time::timeout(timeout, embedding::embed_query(provider.as_ref(), query)).await {
            Ok(Ok(vector)) => (Some(vector), false),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "query embedding failed; falling back to lexical-only");
                (None, true)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "query embedding timed out; falling back to lexical-only"
                );
                (None, true)
            }
        }
    }

    async fn generate_answer(
        &self,
        query_budget: &QueryBudget<'_>,
        query: &str,
        snap: &IndexSnapshot,
        retrieval: &Retrieval,
        decision: &Decision,
    ) -> GenerationOutcome {
        let passages: Vec<Passage<'_>> = retrieval
            .candidates
            .iter()
            .filter_map(|c| {
                snap.get(&c.chunk_id).map(|chunk| Passage {
                    chunk_id: &chunk.chunk_id,
                    text: &chunk.text,
                    score: c.fused_score,
                })
            })
            .collect();
        let candidate_ids: BTreeSet<String> =
            passages.iter().map(|p| p.chunk_id.to_string()).collect();
        let system = system_rules();

        let tokens_in = AtomicU64::new(0);
        let tokens_out = AtomicU64::new(0);
        let charge = |c: &Completion| {
            tokens_in.fetch_add(c.tokens_in, Ordering::SeqCst);
            tokens_out.fetch_add(c.tokens_out, Ordering::SeqCst);
        };
        let abstain = |reason: ReasonCode| Decision::abstain(reason, decision.strength);

        let first = match self
            .complete(query_budget, &system, user_prompt(query, &passages))
            .await
        {
            Ok(c) => {
                charge(&c);
                c
            }
            Err(e) => {
                let reason = upstream_reason(&e, ReasonCode::Timeout);
                tracing::warn!(error = %e, reason = %reason, "generation failed");
                return GenerationOutcome {
                    decision: abstain(reason),
                    answer: None,
                    validator: ValidatorOutcome::Skipped,
                    tokens_in: tokens_in.load(Ordering::SeqCst),
                    tokens_out: tokens_out.load(Ordering::SeqCst),
                    repair_attempted: false,
                };
            }
        };

        let repair_attempted = AtomicBool::new(false);
        let report = validate_and_maybe_repair(&first.text, &candidate_ids, |violations| {
            repair_attempted.store(true, Ordering::SeqCst);
            let prompt = repair_prompt(query, &passages, &first.text, &violations);
            let system = &system;
            let charge = &charge;
            async move {
                let repaired = self.complete(query_budget, system, prompt).await?;
                charge(&repaired);
                Ok::<String, anyhow::Error>(repaired.text)
            }
        })
        .await;

        let validator = report.outcome();
        let (decision, answer) = match report {
            ValidationReport::Valid { answer, .. } => {
                let answer = answer.retain_confident(self.config.guardrail.min_code_confidence);
                if answer.codes.is_empty() {
                    tracing::info!("no code above the confidence floor");
                    (abstain(ReasonCode::BelowThreshold), None)
                } else {
                    (*decision, Some(answer))
                }
            }
            ValidationReport::Failed {
                violations,
                upstream,
            } => {
                let reason = match &upstream {
                    Some(e) => upstream_reason(e, ReasonCode::SchemaInvalid),
                    None => ReasonCode::SchemaInvalid,
                };
                tracing::warn!(violations = violations.len(), reason = %reason, "response rejected");
                (abstain(reason), None)
            }
        };

        GenerationOutcome {
            decision,
            answer,
            validator,
            tokens_in: tokens_in.load(Ordering::SeqCst),
            tokens_out: tokens_out.load(Ordering::SeqCst),
            repair_attempted: repair_attempted.load(Ordering::SeqCst),
        }
    }

    /// One bounded generation call, reserved against and charged to the
    /// budget.
    async fn complete(&self, query_budget: &QueryBudget<'_>, system: &str, prompt: String) -> Result<Completion> {
        let max_tokens = self.config.generation.max_tokens;
        let estimate = estimate_tokens(system) + estimate_tokens(&prompt) + u64::from(max_tokens);
        let reservation = query_budget.reserve(estimate)?;

        let timeout = Duration::from_secs(self.config.generation.timeout_secs);
        let request = CompletionRequest {
            system: system.to_string(),
            prompt,
            max_tokens,
            timeout,
        };
        let completion = tokio::time::timeout(timeout, self.generator.complete(&request))
            .await
            .map_err(|_| CoreError::UpstreamTimeout {
                capability: "generation",
                timeout_ms: timeout.as_millis() as u64,
            })??;

        let reported = completion.total_tokens();
        match reservation.settle(reported) {
            Ok(charged) if reported == 0 => {
                tracing::debug!(charged, "provider reported no usage; charged the estimate");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to persist token usage"),
        }
        Ok(completion)
    }

    fn emit(&self, record: &MetricsRecord) {
        if let Err(e) = self.sink.record(record) {
            tracing::warn!(error = %e, "failed to write metrics record");
        }
    }
}

async fn lexical_stream(snap: Arc<IndexSnapshot>, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
    let query = query.to_string();
    tokio::task::spawn_blocking(move || search::lexical_candidates(&snap, &query, limit))
        .await
        .context("lexical scoring task failed")
}

fn fuse_streams(
    snap: &IndexSnapshot,
    query: &str,
    lexical: Vec<ChunkCandidate>,
    embedding: Option<&[f32]>,
    params: &SearchParams,
) -> Retrieval {
    let semantic = embedding.map(|qv| {
        search::semantic_candidates(snap, qv, params.candidate_k_semantic, params.semantic_floor)
    });
    search::retrieve(snap, query, lexical, semantic, params)
}

/// Reason for a failed generation call. Anything not recognized as a
/// timeout or budget overrun gets `fallback`.
fn upstream_reason(err: &anyhow::Error, fallback: ReasonCode) -> ReasonCode {
    if err.downcast_ref::<BudgetExceeded>().is_some() {
        return ReasonCode::BudgetExceeded;
    }
    if matches!(err.downcast_ref::<CoreError>(), Some(CoreError::UpstreamTimeout { .. })) {
        return ReasonCode::Timeout;
    }
    if err
        .downcast_ref::<reqwest::Error>()
        .is_some_and(|e| e.is_timeout())
    {
        return ReasonCode::Timeout;
    }
    fallback
}

fn attempt_record(
    query_id: &str,
    attempt: Attempt,
    retrieval: &Retrieval,
    degraded: bool,
    params: &SearchParams,
    decision: &Decision,
) -> MetricsRecord {
    MetricsRecord {
        ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        query_id: query_id.to_string(),
        attempt: attempt.number(),
        retry_count: attempt.number() - 1,
        fused_top_score: retrieval.top_score(),
        evidence_strength: decision.strength,
        decision: decision.kind,
        reason: decision.reason,
        latency_ms: 0,
        validator_outcome: ValidatorOutcome::Skipped,
        mode: retrieval.mode.as_str().to_string(),
        semantic_degraded: degraded,
        top_k: params.fusion.top_k(),
        alpha: retrieval.alpha,
        lexical_candidates: retrieval.lexical_count,
        semantic_candidates: retrieval.semantic_count,
        tokens_in: 0,
        tokens_out: 0,
        repair_attempted: false,
    }
}
