//! Evidence-strength guardrail: answer, retry once with broadened
//! retrieval, or abstain.
//!
//! # State machine
//!
//! ```text
//!             strength ≥ min_evidence                       ┌──────────┐
//!   SCORED ───────────────────────────────────────────────▶ │  ANSWER  │
//!     │                                                     └──────────┘
//!     │  maybe_floor ≤ strength < min_evidence, first try   ┌──────────┐
//!     ├───────────────────────────────────────────────────▶ │  RETRY   │ ─▶ SCORED (broadened)
//!     │                                                     └──────────┘
//!     │  no candidates / below floor / retry exhausted      ┌──────────┐
//!     └───────────────────────────────────────────────────▶ │ ABSTAIN  │
//!                                                           └──────────┘
//! ```
//!
//! Evidence strength is [`Retrieval::evidence`](crate::search::Retrieval::evidence),
//! an absolute measure of how well the returned passages support the query.
//! The per-query normalized fused score only orders candidates. An empty
//! candidate set always abstains with `no_candidates`: broadening cannot
//! create evidence that scored zero everywhere.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::search::SearchParams;

/// Outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    Answer,
    Retry,
    Abstain,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Answer => "ANSWER",
            DecisionKind::Retry => "RETRY",
            DecisionKind::Abstain => "ABSTAIN",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    SufficientEvidence,
    BelowThreshold,
    BelowFloor,
    NoCandidates,
    RetryExhausted,
    Timeout,
    SchemaInvalid,
    BudgetExceeded,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::SufficientEvidence => "sufficient_evidence",
            ReasonCode::BelowThreshold => "below_threshold",
            ReasonCode::BelowFloor => "below_floor",
            ReasonCode::NoCandidates => "no_candidates",
            ReasonCode::RetryExhausted => "retry_exhausted",
            ReasonCode::Timeout => "timeout",
            ReasonCode::SchemaInvalid => "schema_invalid",
            ReasonCode::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which attempt of a logical query is being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Retry,
}

impl Attempt {
    /// 1-based attempt number.
    pub fn number(&self) -> u32 {
        match self {
            Attempt::First => 1,
            Attempt::Retry => 2,
        }
    }
}

/// A guardrail verdict with its evidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub reason: ReasonCode,
    /// Evidence strength; `None` when there were no candidates.
    pub strength: Option<f64>,
}

impl Decision {
    pub fn answer(strength: f64) -> Self {
        Self {
            kind: DecisionKind::Answer,
            reason: ReasonCode::SufficientEvidence,
            strength: Some(strength),
        }
    }

    pub fn abstain(reason: ReasonCode, strength: Option<f64>) -> Self {
        Self {
            kind: DecisionKind::Abstain,
            reason,
            strength,
        }
    }

    pub fn is_answer(&self) -> bool {
        self.kind == DecisionKind::Answer
    }
}

/// Validated thresholds, `0 ≤ maybe_floor ≤ min_evidence ≤ 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    min_evidence: f64,
    maybe_floor: f64,
}

impl Thresholds {
    pub fn new(min_evidence: f64, maybe_floor: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&min_evidence) {
            return Err(Error::config(format!(
                "guardrail.min_evidence must be in [0.0, 1.0], got {}",
                min_evidence
            )));
        }
        if !(0.0..=min_evidence).contains(&maybe_floor) {
            return Err(Error::config(format!(
                "guardrail.maybe_floor must be in [0.0, min_evidence={}], got {}",
                min_evidence, maybe_floor
            )));
        }
        Ok(Self {
            min_evidence,
            maybe_floor,
        })
    }

    pub fn min_evidence(&self) -> f64 {
        self.min_evidence
    }

    pub fn maybe_floor(&self) -> f64 {
        self.maybe_floor
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_evidence: 0.40,
            maybe_floor: 0.20,
        }
    }
}

/// Judge one attempt. `strength` is `None` when retrieval returned nothing.
pub fn decide(strength: Option<f64>, attempt: Attempt, thresholds: &Thresholds) -> Decision {
    let strength = match strength {
        Some(s) => s,
        None => return Decision::abstain(ReasonCode::NoCandidates, None),
    };

    if strength >= thresholds.min_evidence {
        return Decision::answer(strength);
    }
    if strength < thresholds.maybe_floor {
        return Decision::abstain(ReasonCode::BelowFloor, Some(strength));
    }
    match attempt {
        Attempt::First => Decision {
            kind: DecisionKind::Retry,
            reason: ReasonCode::BelowThreshold,
            strength: Some(strength),
        },
        Attempt::Retry => Decision::abstain(ReasonCode::RetryExhausted, Some(strength)),
    }
}

/// How a RETRY broadens retrieval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BroadenPolicy {
    factor: usize,
    max_top_k: usize,
    retry_alpha: Option<f64>,
}

impl BroadenPolicy {
    pub fn new(factor: usize, max_top_k: usize, retry_alpha: Option<f64>) -> Result<Self> {
        if factor < 2 {
            return Err(Error::config(format!(
                "guardrail.broaden_factor must be >= 2, got {}",
                factor
            )));
        }
        if max_top_k == 0 {
            return Err(Error::config("retrieval.max_top_k must be >= 1"));
        }
        if let Some(alpha) = retry_alpha {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(Error::config(format!(
                    "guardrail.retry_alpha must be in [0.0, 1.0], got {}",
                    alpha
                )));
            }
        }
        Ok(Self {
            factor,
            max_top_k,
            retry_alpha,
        })
    }

    /// Parameters for the second attempt: K and both candidate pools
    /// multiplied by the factor, K capped, alpha optionally replaced.
    pub fn broaden(&self, params: &SearchParams) -> Result<SearchParams> {
        let top_k = params
            .fusion
            .top_k()
            .saturating_mul(self.factor)
            .min(self.max_top_k.max(params.fusion.top_k()));
        let mut fusion = params.fusion.with_top_k(top_k)?;
        if let Some(alpha) = self.retry_alpha {
            fusion = fusion.with_alpha(alpha)?;
        }
        SearchParams::new(
            fusion,
            params.candidate_k_lexical.saturating_mul(self.factor),
            params.candidate_k_semantic.saturating_mul(self.factor),
            params.semantic_floor,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{build_chunks, ChunkingPolicy};
    use crate::fusion::FusionParams;
    use crate::index::IndexSnapshot;
    use crate::lexical::Bm25Params;
    use crate::search::search;

    #[test]
    fn test_threshold_validation() {
        assert!(Thresholds::new(1.2, 0.1).is_err());
        assert!(Thresholds::new(0.4, 0.5).is_err());
        assert!(Thresholds::new(0.4, -0.1).is_err());
        assert!(Thresholds::new(0.4, 0.4).is_ok());
    }

    #[test]
    fn test_exactly_at_threshold_answers() {
        let t = Thresholds::new(0.40, 0.20).unwrap();
        let d = decide(Some(0.40), Attempt::First, &t);
        assert_eq!(d.kind, DecisionKind::Answer);
        assert_eq!(d.reason, ReasonCode::SufficientEvidence);
        assert_eq!(d.strength, Some(0.40));
    }

    #[test]
    fn test_just_below_threshold_retries_then_abstains() {
        let t = Thresholds::new(0.40, 0.20).unwrap();
        let below = 0.40 - 1e-9;
        let first = decide(Some(below), Attempt::First, &t);
        assert_eq!(first.kind, DecisionKind::Retry);
        assert_eq!(first.reason, ReasonCode::BelowThreshold);

        let second = decide(Some(below), Attempt::Retry, &t);
        assert_eq!(second.kind, DecisionKind::Abstain);
        assert_eq!(second.reason, ReasonCode::RetryExhausted);
    }

    #[test]
    fn test_below_floor_abstains_without_retry() {
        let t = Thresholds::default();
        let d = decide(Some(0.1), Attempt::First, &t);
        assert_eq!(d.kind, DecisionKind::Abstain);
        assert_eq!(d.reason, ReasonCode::BelowFloor);
    }

    #[test]
    fn test_no_candidates_never_retries() {
        let t = Thresholds::default();
        for attempt in [Attempt::First, Attempt::Retry] {
            let d = decide(None, attempt, &t);
            assert_eq!(d.kind, DecisionKind::Abstain);
            assert_eq!(d.reason, ReasonCode::NoCandidates);
            assert_eq!(d.strength, None);
        }
    }

    fn motors_corpus() -> IndexSnapshot {
        let policy = ChunkingPolicy::new(60, 10).unwrap();
        let mut chunks = Vec::new();
        for (doc_id, text) in [
            ("htsus:84:8407.10@2025-01-01", "Spark-ignition reciprocating piston engines and engine parts."),
            ("htsus:85:8501.10@2025-01-01", "Electric motors of an output not exceeding 37.5 W."),
            ("ruling:HQ-H1", "Ruling on parts of electric motors and generators."),
        ] {
            chunks.extend(build_chunks(doc_id, text, &policy));
        }
        chunks[0].embedding = Some(vec![0.9, 0.1, 0.0]);
        chunks[1].embedding = Some(vec![0.1, 0.9, 0.0]);
        IndexSnapshot::build(chunks, Bm25Params::default(), 1)
    }

    #[test]
    fn test_stray_word_overlap_does_not_answer() {
        let snap = motors_corpus();
        let params = SearchParams::new(FusionParams::new(0.75, 6).unwrap(), 30, 30, 0.0).unwrap();
        let t = Thresholds::default();
        let orthogonal = [0.0f32, 0.0, 1.0];

        for embedding in [None, Some(&orthogonal[..])] {
            let r = search(&snap, "output of a zeppelin gondola", embedding, &params);
            assert!(!r.candidates.is_empty());
            let d = decide(r.evidence, Attempt::First, &t);
            assert_ne!(d.kind, DecisionKind::Answer, "{:?}", d);
        }

        let r = search(&snap, "electric motors output", None, &params);
        assert!(decide(r.evidence, Attempt::First, &t).is_answer());
    }

    #[test]
    fn test_broaden_multiplies_and_caps() {
        let params = SearchParams::new(FusionParams::new(0.75, 6).unwrap(), 30, 30, 0.0).unwrap();
        let policy = BroadenPolicy::new(2, 10, Some(0.5)).unwrap();
        let wider = policy.broaden(&params).unwrap();
        assert_eq!(wider.fusion.top_k(), 10);
        assert_eq!(wider.fusion.alpha(), 0.5);
        assert_eq!(wider.candidate_k_lexical, 60);
        assert_eq!(wider.candidate_k_semantic, 60);

        let keep_alpha = BroadenPolicy::new(2, 50, None).unwrap().broaden(&params).unwrap();
        assert_eq!(keep_alpha.fusion.top_k(), 12);
        assert_eq!(keep_alpha.fusion.alpha(), 0.75);
    }

    #[test]
    fn test_broaden_policy_validation() {
        assert!(BroadenPolicy::new(1, 10, None).is_err());
        assert!(BroadenPolicy::new(2, 0, None).is_err());
        assert!(BroadenPolicy::new(2, 10, Some(1.5)).is_err());
    }

    #[test]
    fn test_reason_codes_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&ReasonCode::NoCandidates).unwrap(),
            "\"no_candidates\""
        );
        assert_eq!(serde_json::to_string(&DecisionKind::Abstain).unwrap(), "\"ABSTAIN\"");
    }
}
