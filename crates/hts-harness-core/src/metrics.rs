//! Per-attempt metrics records and the append-only sink they go to.
//!
//! One [`MetricsRecord`] is emitted for every retrieval attempt of a
//! logical query, including attempts that end in RETRY. The engine never
//! reads a sink back.

use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::guardrail::{DecisionKind, ReasonCode};
use crate::validate::ValidatorOutcome;

/// One line of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    pub query_id: String,
    /// 1-based.
    pub attempt: u32,
    /// Retrieval retries performed before this attempt.
    pub retry_count: u32,
    pub fused_top_score: Option<f64>,
    /// Strength the guardrail judged.
    #[serde(default)]
    pub evidence_strength: Option<f64>,
    pub decision: DecisionKind,
    pub reason: ReasonCode,
    pub latency_ms: u64,
    pub validator_outcome: ValidatorOutcome,
    /// `hybrid` or `lexical_only`.
    pub mode: String,
    /// The query embedding failed or timed out.
    pub semantic_degraded: bool,
    pub top_k: usize,
    pub alpha: f64,
    pub lexical_candidates: usize,
    pub semantic_candidates: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// A repair was attempted on this attempt's generation output.
    pub repair_attempted: bool,
}

/// Append-only destination for [`MetricsRecord`]s.
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: &MetricsRecord) -> Result<()>;
}

/// Sink that drops everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&self, _record: &MetricsRecord) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MetricsRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn records(&self) -> Vec<MetricsRecord> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, record: &MetricsRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("metrics buffer lock poisoned"))?;
        records.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricsRecord {
        MetricsRecord {
            ts: "2025-01-01T00:00:00Z".into(),
            query_id: "q-1".into(),
            attempt: 1,
            retry_count: 0,
            fused_top_score: Some(0.5),
            evidence_strength: Some(0.62),
            decision: DecisionKind::Answer,
            reason: ReasonCode::SufficientEvidence,
            latency_ms: 12,
            validator_outcome: ValidatorOutcome::Valid,
            mode: "hybrid".into(),
            semantic_degraded: false,
            top_k: 6,
            alpha: 0.75,
            lexical_candidates: 10,
            semantic_candidates: 8,
            tokens_in: 400,
            tokens_out: 90,
            repair_attempted: false,
        }
    }

    #[test]
    fn test_memory_sink_appends() {
        let sink = MemorySink::new();
        sink.record(&sample()).unwrap();
        sink.record(&sample()).unwrap();
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn test_record_serializes_codes_as_strings() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["decision"], "ANSWER");
        assert_eq!(json["reason"], "sufficient_evidence");
        assert_eq!(json["validator_outcome"], "valid");
    }
}
