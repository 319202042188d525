//! Fusion of lexical and semantic candidate streams into one ranking.
//!
//! # Algorithm
//!
//! 1. Min-max normalize each stream independently to `[0, 1]`. A stream
//!    whose values are all equal normalizes to `1.0`.
//! 2. Union the two streams by `chunk_id`. A chunk missing from a stream
//!    contributes `0.0` for that side; the gap is applied after
//!    normalization, so it never shifts the other candidates' values.
//! 3. `fused = α × semantic + (1 − α) × lexical`.
//! 4. Sort by fused score (desc), then semantic score (desc, absent lowest),
//!    then `chunk_id` (asc). This is a total order.
//! 5. Assign 1-based ranks and truncate to `top_k`.
//!
//! Min-max is a monotone affine map per stream, so raising one candidate's
//! raw semantic score never lowers its position.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::error::{Error, Result};

/// One entry of a raw score stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    /// BM25 score or cosine similarity.
    pub raw_score: f64,
}

impl ChunkCandidate {
    pub fn new(chunk_id: impl Into<String>, raw_score: f64) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            raw_score,
        }
    }
}

/// Validated weighting and truncation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    alpha: f64,
    top_k: usize,
}

impl FusionParams {
    /// Requires `alpha` in `[0, 1]` and `top_k >= 1`.
    pub fn new(alpha: f64, top_k: usize) -> Result<Self> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::config(format!(
                "alpha must be in [0.0, 1.0], got {}",
                alpha
            )));
        }
        if top_k == 0 {
            return Err(Error::config("top_k must be >= 1"));
        }
        Ok(Self { alpha, top_k })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn with_alpha(self, alpha: f64) -> Result<Self> {
        Self::new(alpha, self.top_k)
    }

    pub fn with_top_k(self, top_k: usize) -> Result<Self> {
        Self::new(self.alpha, top_k)
    }
}

/// A fused, ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub chunk_id: String,
    /// Normalized lexical score; `0.0` when absent from the lexical stream.
    pub lexical_score: f64,
    /// Normalized semantic score; `None` when absent or unknown.
    pub semantic_score: Option<f64>,
    pub lexical_raw: Option<f64>,
    pub semantic_raw: Option<f64>,
    pub fused_score: f64,
    /// 1-based.
    pub rank: usize,
}

/// Min-max normalize raw scores to `[0.0, 1.0]`, keyed by chunk id.
///
/// If all scores are equal, they are normalized to `1.0`. Duplicate ids
/// keep their highest raw score.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> HashMap<&str, (f64, f64)> {
    let mut best: HashMap<&str, f64> = HashMap::new();
    for c in candidates {
        let entry = best.entry(c.chunk_id.as_str()).or_insert(c.raw_score);
        if c.raw_score > *entry {
            *entry = c.raw_score;
        }
    }
    if best.is_empty() {
        return HashMap::new();
    }

    let s_min = best.values().copied().fold(f64::INFINITY, f64::min);
    let s_max = best.values().copied().fold(f64::NEG_INFINITY, f64::max);

    best.into_iter()
        .map(|(id, raw)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (raw - s_min) / (s_max - s_min)
            };
            (id, (raw, norm))
        })
        .collect()
}

/// Merge two raw streams into a ranked list of at most `top_k` candidates.
pub fn fuse(
    lexical: &[ChunkCandidate],
    semantic: &[ChunkCandidate],
    params: &FusionParams,
) -> Vec<ScoredCandidate> {
    let lex = normalize_scores(lexical);
    let sem = normalize_scores(semantic);
    let alpha = params.alpha;

    let mut ids: Vec<&str> = lex.keys().chain(sem.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut fused: Vec<ScoredCandidate> = ids
        .into_iter()
        .map(|id| {
            let l = lex.get(id).copied();
            let s = sem.get(id).copied();
            let lexical_score = l.map(|(_, n)| n).unwrap_or(0.0);
            let semantic_score = s.map(|(_, n)| n);
            ScoredCandidate {
                chunk_id: id.to_string(),
                lexical_score,
                semantic_score,
                lexical_raw: l.map(|(r, _)| r),
                semantic_raw: s.map(|(r, _)| r),
                fused_score: alpha * semantic_score.unwrap_or(0.0) + (1.0 - alpha) * lexical_score,
                rank: 0,
            }
        })
        .collect();

    fused.sort_by(compare_ranked);
    fused.truncate(params.top_k);
    for (i, c) in fused.iter_mut().enumerate() {
        c.rank = i + 1;
    }
    fused
}

fn compare_ranked(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| match (a.semantic_score, b.semantic_score) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate::new(id, score)
    }

    fn params(alpha: f64, k: usize) -> FusionParams {
        FusionParams::new(alpha, k).unwrap()
    }

    fn order(ranked: &[ScoredCandidate]) -> Vec<&str> {
        ranked.iter().map(|c| c.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_params_validation() {
        assert!(FusionParams::new(-0.1, 5).is_err());
        assert!(FusionParams::new(1.1, 5).is_err());
        assert!(FusionParams::new(f64::NAN, 5).is_err());
        assert!(FusionParams::new(0.5, 0).is_err());
        assert!(FusionParams::new(0.0, 1).is_ok());
        assert!(FusionParams::new(1.0, 1).is_ok());
    }

    #[test]
    fn test_normalize_range_and_all_equal() {
        let spread = [c("a", 10.0), c("b", 5.0), c("c", 0.0)];
        let n = normalize_scores(&spread);
        assert!((n["a"].1 - 1.0).abs() < 1e-9);
        assert!((n["b"].1 - 0.5).abs() < 1e-9);
        assert!(n["c"].1.abs() < 1e-9);

        let equal = [c("a", 3.0), c("b", 3.0)];
        let n = normalize_scores(&equal);
        assert!(n.values().all(|(_, s)| (*s - 1.0).abs() < 1e-9));
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_reciprocating_engine_scenario() {
        let lexical = [
            c("htsus:84:8407.10#s2-o0", 8.1),
            c("htsus:85:8501.10#s1-o0", 2.0),
        ];
        let semantic = [
            c("htsus:84:8407.10#s2-o0", 0.77),
            c("htsus:85:8501.10#s1-o0", 0.31),
        ];
        let ranked = fuse(&lexical, &semantic, &params(0.75, 1));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk_id, "htsus:84:8407.10#s2-o0");
        assert_eq!(ranked[0].rank, 1);
        assert!(ranked[0].fused_score >= 0.40);
    }

    #[test]
    fn test_single_stream_candidates_retained() {
        let lexical = [c("lex-only", 9.0), c("both", 1.0)];
        let semantic = [c("both", 0.9), c("sem-only", 0.1)];
        let ranked = fuse(&lexical, &semantic, &params(0.5, 10));
        assert_eq!(ranked.len(), 3);

        let lex_only = ranked.iter().find(|r| r.chunk_id == "lex-only").unwrap();
        assert_eq!(lex_only.semantic_score, None);
        assert!((lex_only.fused_score - 0.5).abs() < 1e-9);

        let sem_only = ranked.iter().find(|r| r.chunk_id == "sem-only").unwrap();
        assert_eq!(sem_only.lexical_raw, None);
        assert_eq!(sem_only.lexical_score, 0.0);
    }

    #[test]
    fn test_strong_lexical_only_chunk_surfaces() {
        let lexical = [c("statute", 12.0), c("other", 1.0)];
        let semantic = [c("other", 0.4)];
        let ranked = fuse(&lexical, &semantic, &params(0.3, 1));
        assert_eq!(order(&ranked), vec!["statute"]);
    }

    #[test]
    fn test_tie_break_semantic_then_chunk_id() {
        // alpha = 0 makes fused depend on lexical alone, forcing ties.
        let lexical = [c("b", 5.0), c("a", 5.0), c("c", 5.0)];
        let semantic = [c("c", 0.9), c("b", 0.2), c("z", 0.1)];
        let ranked = fuse(&lexical, &semantic, &params(0.0, 10));
        assert_eq!(order(&ranked), vec!["c", "b", "a", "z"]);
    }

    #[test]
    fn test_alpha_extremes() {
        let lexical = [c("k1", 10.0), c("k2", 5.0), c("k3", 1.0)];
        let semantic = [c("k1", 0.1), c("k2", 0.9), c("k3", 0.5)];
        assert_eq!(order(&fuse(&lexical, &semantic, &params(0.0, 3))), vec!["k1", "k2", "k3"]);
        assert_eq!(order(&fuse(&lexical, &semantic, &params(1.0, 3))), vec!["k2", "k3", "k1"]);
    }

    #[test]
    fn test_fused_scores_in_unit_interval() {
        let lexical = [c("a", -5.0), c("b", 100.0), c("c", 42.0)];
        let semantic = [c("a", -0.9), c("c", 0.3)];
        for r in fuse(&lexical, &semantic, &params(0.6, 10)) {
            assert!((0.0..=1.0).contains(&r.fused_score), "{}", r.fused_score);
        }
    }

    #[test]
    fn test_raising_semantic_score_never_lowers_rank() {
        let lexical = [c("a", 6.0), c("b", 4.0), c("c", 3.0), c("d", 1.0), c("t", 2.5)];
        let others = [c("a", 0.62), c("b", 0.55), c("c", 0.70), c("d", 0.20)];

        for alpha in [0.25, 0.5, 0.75, 1.0] {
            let mut last_rank = usize::MAX;
            for step in 0..=40 {
                let raw = -0.2 + step as f64 * 0.03;
                let mut semantic = others.to_vec();
                semantic.push(c("t", raw));
                let ranked = fuse(&lexical, &semantic, &params(alpha, 10));
                let rank = ranked.iter().find(|r| r.chunk_id == "t").unwrap().rank;
                assert!(
                    rank <= last_rank,
                    "alpha={} raw={} rank {} after {}",
                    alpha,
                    raw,
                    rank,
                    last_rank
                );
                last_rank = rank;
            }
        }
    }

    #[test]
    fn test_empty_streams() {
        assert!(fuse(&[], &[], &params(0.5, 3)).is_empty());
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let a = fuse(&[c("x", 1.0), c("y", 2.0)], &[c("y", 0.2), c("x", 0.4)], &params(0.5, 5));
        let b = fuse(&[c("y", 2.0), c("x", 1.0)], &[c("x", 0.4), c("y", 0.2)], &params(0.5, 5));
        assert_eq!(a, b);
    }
}
