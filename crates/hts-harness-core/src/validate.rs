//! Strict response contract for generated classifications, with one
//! bounded repair attempt.
//!
//! Generation output is parsed into [`GeneratedAnswer`] with unknown
//! fields rejected, then checked field by field. Every citation must name a
//! chunk from the candidate set that was handed to generation.
//!
//! [`validate_and_maybe_repair`] takes the repair as an `FnOnce`, so a
//! second repair is impossible by construction.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Attached to every response, answer or abstain.
pub const DISCLAIMER: &str = "Not legal advice. Verify with a licensed customs broker or counsel.";

/// `answer` value on ABSTAIN.
pub const NO_CONFIDENT_CLASSIFICATION: &str = "NO_CONFIDENT_CLASSIFICATION";

pub const MAX_CODES: usize = 3;

/// One candidate tariff code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeCandidate {
    /// `NNNN.NN`, `NNNN.NN.NN` or `NNNN.NN.NN.NN`.
    pub code: String,
    pub description: String,
    #[serde(default)]
    pub duty_rate: Option<String>,
    pub rationale: String,
    pub confidence: f64,
    /// `chunk_id`s from the candidate set.
    pub citations: Vec<String>,
}

/// The whole generated payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratedAnswer {
    pub codes: Vec<CodeCandidate>,
    #[serde(default)]
    pub disclaimer: Option<String>,
}

impl GeneratedAnswer {
    /// Distinct citations across all codes, in first-seen order.
    pub fn citations(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.codes
            .iter()
            .flat_map(|c| c.citations.iter())
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    /// Drop codes below `min_confidence`. Order is preserved.
    pub fn retain_confident(mut self, min_confidence: f64) -> Self {
        self.codes.retain(|c| c.confidence >= min_confidence);
        self
    }
}

/// JSON schema text restated to the model in prompts.
pub const RESPONSE_SCHEMA: &str = r#"{
  "type": "object",
  "additionalProperties": false,
  "required": ["codes"],
  "properties": {
    "codes": {
      "type": "array", "minItems": 1, "maxItems": 3,
      "items": {
        "type": "object",
        "additionalProperties": false,
        "required": ["code", "description", "rationale", "confidence", "citations"],
        "properties": {
          "code": {"type": "string", "pattern": "^\\d{4}\\.\\d{2}(\\.\\d{2}){0,2}$"},
          "description": {"type": "string", "minLength": 1},
          "duty_rate": {"type": ["string", "null"]},
          "rationale": {"type": "string", "minLength": 1},
          "confidence": {"type": "number", "minimum": 0, "maximum": 1},
          "citations": {"type": "array", "minItems": 1, "items": {"type": "string"}}
        }
      }
    },
    "disclaimer": {"type": ["string", "null"]}
  }
}"#;

/// How validation ended, as recorded in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorOutcome {
    /// First output passed.
    Valid,
    /// Repair output passed.
    Repaired,
    /// Both outputs failed, or the repair call itself failed.
    Failed,
    /// Generation was never reached.
    Skipped,
}

impl ValidatorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorOutcome::Valid => "valid",
            ValidatorOutcome::Repaired => "repaired",
            ValidatorOutcome::Failed => "failed",
            ValidatorOutcome::Skipped => "skipped",
        }
    }
}

/// Result of [`validate_and_maybe_repair`].
#[derive(Debug)]
pub enum ValidationReport {
    Valid {
        answer: GeneratedAnswer,
        repaired: bool,
    },
    Failed {
        /// Violations of the last output that was checked.
        violations: Vec<String>,
        /// Set when the repair call errored instead of returning text.
        upstream: Option<anyhow::Error>,
    },
}

impl ValidationReport {
    pub fn outcome(&self) -> ValidatorOutcome {
        match self {
            ValidationReport::Valid { repaired: false, .. } => ValidatorOutcome::Valid,
            ValidationReport::Valid { repaired: true, .. } => ValidatorOutcome::Repaired,
            ValidationReport::Failed { .. } => ValidatorOutcome::Failed,
        }
    }
}

/// Strip one surrounding markdown code fence, if present.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = inner.strip_suffix("```") else {
        return trimmed;
    };
    // Drop an info string such as `json` on the opening line.
    match inner.split_once('\n') {
        Some((info, body)) if !info.trim_start().starts_with('{') => body.trim(),
        _ => inner.trim(),
    }
}

/// Parse and check one output against the contract.
///
/// Returns every violation found, not just the first.
pub fn validate(raw: &str, candidate_ids: &BTreeSet<String>) -> Result<GeneratedAnswer, Vec<String>> {
    let answer: GeneratedAnswer = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| vec![format!("output is not a valid response object: {}", e)])?;

    let mut violations = Vec::new();
    if answer.codes.is_empty() {
        violations.push("codes: at least one code is required".to_string());
    }
    if answer.codes.len() > MAX_CODES {
        violations.push(format!(
            "codes: at most {} codes allowed, got {}",
            MAX_CODES,
            answer.codes.len()
        ));
    }

    for (i, c) in answer.codes.iter().enumerate() {
        if !code_pattern().is_match(&c.code) {
            violations.push(format!("codes[{}].code: '{}' is not NNNN.NN[.NN[.NN]]", i, c.code));
        }
        if c.description.trim().is_empty() {
            violations.push(format!("codes[{}].description: must not be empty", i));
        }
        if c.rationale.trim().is_empty() {
            violations.push(format!("codes[{}].rationale: must not be empty", i));
        }
        if !(c.confidence.is_finite() && (0.0..=1.0).contains(&c.confidence)) {
            violations.push(format!(
                "codes[{}].confidence: {} is outside [0, 1]",
                i, c.confidence
            ));
        }
        if c.citations.is_empty() {
            violations.push(format!("codes[{}].citations: at least one citation is required", i));
        }
        for cite in &c.citations {
            if !candidate_ids.contains(cite) {
                violations.push(format!(
                    "codes[{}].citations: '{}' is not one of the provided passages",
                    i, cite
                ));
            }
        }
    }

    if violations.is_empty() {
        Ok(answer)
    } else {
        Err(violations)
    }
}

/// Validate `raw`; on failure call `repair` once with the violations and
/// validate its output. Never calls `repair` on a valid first output.
pub async fn validate_and_maybe_repair<F, Fut>(
    raw: &str,
    candidate_ids: &BTreeSet<String>,
    repair: F,
) -> ValidationReport
where
    F: FnOnce(Vec<String>) -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    let violations = match validate(raw, candidate_ids) {
        Ok(answer) => {
            return ValidationReport::Valid {
                answer,
                repaired: false,
            }
        }
        Err(v) => v,
    };
    tracing::warn!(count = violations.len(), "generated output failed validation; repairing");

    let repaired = match repair(violations.clone()).await {
        Ok(text) => text,
        Err(e) => {
            return ValidationReport::Failed {
                violations,
                upstream: Some(e),
            }
        }
    };

    match validate(&repaired, candidate_ids) {
        Ok(answer) => ValidationReport::Valid {
            answer,
            repaired: true,
        },
        Err(violations) => {
            tracing::warn!(count = violations.len(), "repaired output failed validation");
            ValidationReport::Failed {
                violations,
                upstream: None,
            }
        }
    }
}

fn code_pattern() -> &'static Regex {
    static CODE: OnceLock<Regex> = OnceLock::new();
    CODE.get_or_init(|| Regex::new(r"^\d{4}\.\d{2}(\.\d{2}){0,2}$").expect("static regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CITE: &str = "htsus:84:8407.10@2025-01-01#s0-o0";

    fn ids() -> BTreeSet<String> {
        [CITE.to_string(), "ruling:HQ-H1#s0-o0".to_string()].into_iter().collect()
    }

    fn answer_json(code: &str, cite: &str) -> String {
        serde_json::json!({
            "codes": [{
                "code": code,
                "description": "Spark-ignition reciprocating piston engines",
                "duty_rate": "Free",
                "rationale": "The article is a reciprocating piston engine for aircraft.",
                "confidence": 0.82,
                "citations": [cite]
            }],
            "disclaimer": DISCLAIMER
        })
        .to_string()
    }

    #[test]
    fn test_valid_answer() {
        let answer = validate(&answer_json("8407.10", CITE), &ids()).unwrap();
        assert_eq!(answer.codes.len(), 1);
        assert_eq!(answer.citations(), vec![CITE.to_string()]);
    }

    #[test]
    fn test_fenced_output_accepted() {
        let fenced = format!("```json\n{}\n```", answer_json("8407.10.00", CITE));
        assert!(validate(&fenced, &ids()).is_ok());
        let bare_fence = format!("```\n{}\n```", answer_json("8407.10", CITE));
        assert!(validate(&bare_fence, &ids()).is_ok());
    }

    #[test]
    fn test_prose_rejected() {
        let text = format!("Here is the answer: {}", answer_json("8407.10", CITE));
        assert!(validate(&text, &ids()).is_err());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let text = r#"{"codes": [], "notes": "extra"}"#;
        assert!(validate(text, &ids()).is_err());
    }

    #[test]
    fn test_uncited_chunk_is_violation() {
        let errs = validate(&answer_json("8407.10", "htsus:99:9999.99@x#s0-o0"), &ids()).unwrap_err();
        assert!(errs[0].contains("not one of the provided passages"));
    }

    #[test]
    fn test_collects_all_violations() {
        let text = serde_json::json!({
            "codes": [{
                "code": "8407",
                "description": "",
                "rationale": "x",
                "confidence": 1.5,
                "citations": []
            }]
        })
        .to_string();
        let errs = validate(&text, &ids()).unwrap_err();
        assert_eq!(errs.len(), 4, "{:?}", errs);
    }

    #[test]
    fn test_code_count_bounds() {
        let empty = r#"{"codes": []}"#;
        assert!(validate(empty, &ids()).is_err());

        let one: serde_json::Value = serde_json::from_str(&answer_json("8407.10", CITE)).unwrap();
        let code = one["codes"][0].clone();
        let four = serde_json::json!({ "codes": [code.clone(), code.clone(), code.clone(), code] });
        let errs = validate(&four.to_string(), &ids()).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("at most 3")));
    }

    #[test]
    fn test_retain_confident() {
        let mut answer = validate(&answer_json("8407.10", CITE), &ids()).unwrap();
        answer.codes[0].confidence = 0.1;
        assert!(answer.retain_confident(0.15).codes.is_empty());
    }

    #[tokio::test]
    async fn test_valid_output_skips_repair() {
        let calls = AtomicUsize::new(0);
        let report = validate_and_maybe_repair(&answer_json("8407.10", CITE), &ids(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(String::new()) }
        })
        .await;
        assert_eq!(report.outcome(), ValidatorOutcome::Valid);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repair_succeeds_once() {
        let calls = AtomicUsize::new(0);
        let report = validate_and_maybe_repair("not json", &ids(), |violations| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(!violations.is_empty());
            async { Ok(answer_json("8407.10", CITE)) }
        })
        .await;
        assert_eq!(report.outcome(), ValidatorOutcome::Repaired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repair_failure_is_terminal() {
        let calls = AtomicUsize::new(0);
        let report = validate_and_maybe_repair("not json", &ids(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("still not json".to_string()) }
        })
        .await;
        assert_eq!(report.outcome(), ValidatorOutcome::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match report {
            ValidationReport::Failed { upstream, violations } => {
                assert!(upstream.is_none());
                assert!(!violations.is_empty());
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_repair_upstream_error_is_reported() {
        let report = validate_and_maybe_repair("{}", &ids(), |_| async {
            Err(anyhow::anyhow!("connection reset"))
        })
        .await;
        match report {
            ValidationReport::Failed { upstream, .. } => assert!(upstream.is_some()),
            _ => panic!("expected failure"),
        }
    }
}
