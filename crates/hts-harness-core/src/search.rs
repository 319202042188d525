//! Candidate retrieval over an [`IndexSnapshot`] and hybrid fusion.
//!
//! The two scorers are independent and can run concurrently: the caller
//! produces the lexical stream with [`lexical_candidates`] and, when a query
//! embedding is available, the semantic stream with
//! [`semantic_candidates`], then merges them with [`retrieve`].
//!
//! # Candidate pools
//!
//! | Stream | Admitted | Order | Cap |
//! |--------|----------|-------|-----|
//! | lexical | BM25 > 0 | score desc, `chunk_id` asc | `candidate_k_lexical` |
//! | semantic | cosine > `semantic_floor`, embedding known | score desc, `chunk_id` asc | `candidate_k_semantic` |
//!
//! A query runs lexical-only when there is no query embedding or no chunk
//! carries an embedding. In that mode alpha is forced to 0.
//!
//! # Evidence strength
//!
//! Fused scores are min-max normalized per query, so the rank-1 candidate
//! always sits near the top of the scale however poorly it matches. The
//! guardrail therefore reads [`Retrieval::evidence`] instead: the best
//! absolute support among the returned candidates,
//!
//! ```text
//! support = α × max(0, cosine) + (1 − α) × coverage
//! ```
//!
//! where `coverage` is [`LexicalIndex::coverage`](crate::lexical::LexicalIndex::coverage)
//! and `α` is the alpha actually applied. Neither term depends on the other
//! candidates, and a broadened retry can raise it by returning more of them.

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::fusion::{fuse, ChunkCandidate, FusionParams, ScoredCandidate};
use crate::index::IndexSnapshot;
use crate::lexical::query_terms;
use crate::semantic;

/// Retrieval tuning parameters for one attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub fusion: FusionParams,
    /// Number of lexical candidates to keep before fusion.
    pub candidate_k_lexical: usize,
    /// Number of semantic candidates to keep before fusion.
    pub candidate_k_semantic: usize,
    /// Semantic candidates must score strictly above this.
    pub semantic_floor: f64,
}

impl SearchParams {
    pub fn new(
        fusion: FusionParams,
        candidate_k_lexical: usize,
        candidate_k_semantic: usize,
        semantic_floor: f64,
    ) -> Result<Self> {
        if candidate_k_lexical == 0 || candidate_k_semantic == 0 {
            return Err(Error::config("candidate pool sizes must be >= 1"));
        }
        if !(-1.0..=1.0).contains(&semantic_floor) {
            return Err(Error::config(format!(
                "semantic_floor must be in [-1.0, 1.0], got {}",
                semantic_floor
            )));
        }
        Ok(Self {
            fusion,
            candidate_k_lexical,
            candidate_k_semantic,
            semantic_floor,
        })
    }
}

/// Which streams contributed to a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Hybrid,
    LexicalOnly,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Hybrid => "hybrid",
            RetrievalMode::LexicalOnly => "lexical_only",
        }
    }
}

/// Fused ranking for one attempt, plus what went into it.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub mode: RetrievalMode,
    /// Alpha actually applied.
    pub alpha: f64,
    pub candidates: Vec<ScoredCandidate>,
    pub lexical_count: usize,
    pub semantic_count: usize,
    /// Best absolute support among `candidates`; `None` when empty.
    pub evidence: Option<f64>,
}

impl Retrieval {
    /// Top fused score, if any candidate survived. Ranking only.
    pub fn top_score(&self) -> Option<f64> {
        self.candidates.first().map(|c| c.fused_score)
    }
}

/// BM25 stream for `query`.
pub fn lexical_candidates(snapshot: &IndexSnapshot, query: &str, limit: usize) -> Vec<ChunkCandidate> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return Vec::new();
    }
    let scored = snapshot
        .lexical()
        .score_all(&terms)
        .into_iter()
        .filter_map(|(pos, score)| snapshot.chunk(pos).map(|c| ChunkCandidate::new(&c.chunk_id, score)))
        .collect();
    top_n(scored, limit)
}

/// Cosine stream for a query embedding. Chunks whose similarity is unknown
/// never enter the stream.
pub fn semantic_candidates(
    snapshot: &IndexSnapshot,
    query_embedding: &[f32],
    limit: usize,
    floor: f64,
) -> Vec<ChunkCandidate> {
    let scored = snapshot
        .chunks()
        .iter()
        .filter_map(|c| {
            let sim = semantic::score(query_embedding, c.embedding.as_deref())?;
            (sim > floor).then(|| ChunkCandidate::new(&c.chunk_id, sim))
        })
        .collect();
    top_n(scored, limit)
}

/// Fuse the two streams. `semantic` is `None` when the query could not be
/// embedded; an empty semantic stream over an index with no embeddings is
/// treated the same way.
pub fn retrieve(
    snapshot: &IndexSnapshot,
    query: &str,
    lexical: Vec<ChunkCandidate>,
    semantic: Option<Vec<ChunkCandidate>>,
    params: &SearchParams,
) -> Retrieval {
    let (mode, semantic, fusion) = match semantic {
        Some(sem) if snapshot.embedded_count() > 0 => (RetrievalMode::Hybrid, sem, params.fusion),
        _ => (
            RetrievalMode::LexicalOnly,
            Vec::new(),
            FusionParams::new(0.0, params.fusion.top_k()).unwrap_or(params.fusion),
        ),
    };

    let candidates = fuse(&lexical, &semantic, &fusion);
    let evidence = evidence_strength(snapshot, &query_terms(query), &candidates, fusion.alpha());
    tracing::debug!(
        mode = mode.as_str(),
        lexical = lexical.len(),
        semantic = semantic.len(),
        fused = candidates.len(),
        evidence = ?evidence,
        "fused candidates"
    );

    Retrieval {
        mode,
        alpha: fusion.alpha(),
        candidates,
        lexical_count: lexical.len(),
        semantic_count: semantic.len(),
        evidence,
    }
}

/// Best `alpha × max(0, cosine) + (1 − alpha) × coverage` over `candidates`.
pub fn evidence_strength(
    snapshot: &IndexSnapshot,
    terms: &[String],
    candidates: &[ScoredCandidate],
    alpha: f64,
) -> Option<f64> {
    candidates
        .iter()
        .map(|c| {
            let coverage = snapshot
                .position(&c.chunk_id)
                .map(|pos| snapshot.lexical().coverage(terms, pos))
                .unwrap_or(0.0);
            let cosine = c.semantic_raw.unwrap_or(0.0).max(0.0);
            alpha * cosine + (1.0 - alpha) * coverage
        })
        .reduce(f64::max)
}

/// Synchronous convenience wrapper running both scorers in sequence.
pub fn search(
    snapshot: &IndexSnapshot,
    query: &str,
    query_embedding: Option<&[f32]>,
    params: &SearchParams,
) -> Retrieval {
    let lexical = lexical_candidates(snapshot, query, params.candidate_k_lexical);
    let semantic = query_embedding.map(|qv| {
        semantic_candidates(snapshot, qv, params.candidate_k_semantic, params.semantic_floor)
    });
    retrieve(snapshot, query, lexical, semantic, params)
}

/// A ranked passage with enough context to display it.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub rank: usize,
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f64,
    pub snippet: String,
    /// Scoring breakdown (populated when `explain` is true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ScoreExplanation>,
}

/// Scoring breakdown for a search result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreExplanation {
    pub lexical_raw: Option<f64>,
    pub semantic_raw: Option<f64>,
    /// Normalized lexical score (0.0 if absent from lexical candidates).
    pub lexical_score: f64,
    /// Normalized semantic score, absent when unknown.
    pub semantic_score: Option<f64>,
    pub alpha: f64,
    pub mode: RetrievalMode,
    pub lexical_candidates: usize,
    pub semantic_candidates: usize,
}

/// Attach chunk text to a retrieval for display.
pub fn to_result_items(
    snapshot: &IndexSnapshot,
    retrieval: &Retrieval,
    explain: bool,
    snippet_chars: usize,
) -> Vec<SearchResultItem> {
    retrieval
        .candidates
        .iter()
        .filter_map(|c| {
            let chunk = snapshot.get(&c.chunk_id)?;
            Some(SearchResultItem {
                rank: c.rank,
                chunk_id: c.chunk_id.clone(),
                doc_id: chunk.doc_id.clone(),
                score: c.fused_score,
                snippet: snippet(&chunk.text, snippet_chars),
                explain: explain.then(|| ScoreExplanation {
                    lexical_raw: c.lexical_raw,
                    semantic_raw: c.semantic_raw,
                    lexical_score: c.lexical_score,
                    semantic_score: c.semantic_score,
                    alpha: retrieval.alpha,
                    mode: retrieval.mode,
                    lexical_candidates: retrieval.lexical_count,
                    semantic_candidates: retrieval.semantic_count,
                }),
            })
        })
        .collect()
}

/// Truncate on a char boundary, appending `…` when shortened.
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Format a Unix timestamp as ISO 8601 (`YYYY-MM-DDTHH:MM:SSZ`).
pub fn format_ts_iso(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn top_n(mut scored: Vec<ChunkCandidate>, limit: usize) -> Vec<ChunkCandidate> {
    scored.sort_by(|a, b| {
        b.raw_score
            .total_cmp(&a.raw_score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    scored.truncate(limit);
    scored
}
