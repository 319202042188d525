//! Golden-set evaluation: `hts eval`.
//!
//! A golden set is JSONL, one `{"query": ..., "expected_code": ...}` per
//! line. Each query runs through the full classify pipeline. A case hits
//! when a validated code falls under the expected code: `8409.91` is
//! matched by `8409.91` and by `8409.91.10`, dots ignored.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::Config;
use crate::engine::{ClassifyRequest, ClassifyResponse, Engine};

#[derive(Debug, Clone, Deserialize)]
pub struct GoldenCase {
    pub query: String,
    pub expected_code: String,
}

/// Per-case result.
#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub query: String,
    pub expected_code: String,
    pub decision: String,
    pub reason: String,
    pub codes: Vec<String>,
    pub hit_at_1: bool,
    pub hit_at_k: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvalReport {
    pub total: usize,
    pub hits_at_1: usize,
    pub hits_at_k: usize,
    pub abstained: usize,
    pub cases: Vec<CaseResult>,
}

impl EvalReport {
    pub fn hit_at_1(&self) -> f64 {
        ratio(self.hits_at_1, self.total)
    }

    pub fn hit_at_k(&self) -> f64 {
        ratio(self.hits_at_k, self.total)
    }

    pub fn abstain_rate(&self) -> f64 {
        ratio(self.abstained, self.total)
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Parse a JSONL golden set. Blank lines are skipped.
pub fn parse_golden(content: &str) -> Result<Vec<GoldenCase>> {
    let mut cases = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let case: GoldenCase = serde_json::from_str(line)
            .with_context(|| format!("golden set line {}", i + 1))?;
        if case.query.trim().is_empty() || case.expected_code.trim().is_empty() {
            bail!("golden set line {}: query and expected_code must not be empty", i + 1);
        }
        cases.push(case);
    }
    Ok(cases)
}

pub fn load_golden(path: &Path) -> Result<Vec<GoldenCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read golden set: {}", path.display()))?;
    parse_golden(&content)
}

fn digits(code: &str) -> String {
    code.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Whether `returned` falls under `expected` in the HTS hierarchy.
pub fn code_matches(expected: &str, returned: &str) -> bool {
    let expected = digits(expected);
    !expected.is_empty() && digits(returned).starts_with(&expected)
}

fn score_case(case: &GoldenCase, response: &ClassifyResponse) -> CaseResult {
    let codes: Vec<String> = response.codes.iter().map(|c| c.code.clone()).collect();
    let hit_at_1 = codes
        .first()
        .is_some_and(|c| code_matches(&case.expected_code, c));
    let hit_at_k = codes.iter().any(|c| code_matches(&case.expected_code, c));
    CaseResult {
        query: case.query.clone(),
        expected_code: case.expected_code.clone(),
        decision: response.decision.as_str().to_string(),
        reason: response.reason.to_string(),
        codes,
        hit_at_1,
        hit_at_k,
    }
}

/// Run every case through `engine` in order.
pub async fn evaluate(
    engine: &Engine,
    cases: &[GoldenCase],
    top_k: Option<usize>,
) -> Result<EvalReport> {
    let mut report = EvalReport::default();
    for case in cases {
        let response = engine
            .classify(&ClassifyRequest {
                query: case.query.clone(),
                top_k,
                alpha: None,
            })
            .await?;
        let result = score_case(case, &response);
        tracing::debug!(query = %case.query, hit = result.hit_at_k, decision = %result.decision, "eval case");

        report.total += 1;
        report.hits_at_1 += usize::from(result.hit_at_1);
        report.hits_at_k += usize::from(result.hit_at_k);
        report.abstained += usize::from(!response.is_answer());
        report.cases.push(result);
    }
    Ok(report)
}

pub async fn run_eval(
    config: &Config,
    golden: &Path,
    top_k: Option<usize>,
    json: bool,
) -> Result<()> {
    let cases = load_golden(golden)?;
    if cases.is_empty() {
        bail!("golden set is empty: {}", golden.display());
    }
    let engine = Engine::open(config.clone()).await?;
    let report = evaluate(&engine, &cases, top_k).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for case in &report.cases {
        let mark = if case.hit_at_1 {
            "hit"
        } else if case.hit_at_k {
            "hit@k"
        } else {
            "miss"
        };
        println!(
            "  {:<6} {:<8} expected {:<12} got [{}]  {}",
            mark,
            case.decision,
            case.expected_code,
            case.codes.join(", "),
            case.query
        );
    }
    println!();
    println!("eval: {} cases", report.total);
    println!("  hit@1:        {:.3}", report.hit_at_1());
    println!("  hit@k:        {:.3}", report.hit_at_k());
    println!("  abstain rate: {:.3}", report.abstain_rate());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TokenBudget;
    use crate::config::parse_config;
    use crate::generation::StubGenerator;
    use hts_harness_core::metrics::NullSink;
    use hts_harness_core::models::{DocumentInput, Metadata, SourceKind};
    use hts_harness_core::store::memory::InMemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_code_matches_hierarchy() {
        assert!(code_matches("8409.91", "8409.91"));
        assert!(code_matches("8409.91", "8409.91.10"));
        assert!(code_matches("840991", "8409.91.10.00"));
        assert!(!code_matches("8409.91.10", "8409.91"));
        assert!(!code_matches("8407.10", "8409.91"));
        assert!(!code_matches("", "8409.91"));
    }

    #[test]
    fn test_parse_golden_reports_bad_line() {
        let ok = parse_golden(
            "{\"query\":\"engine parts\",\"expected_code\":\"8409.91\"}\n\n\
             {\"query\":\"horses\",\"expected_code\":\"0101.21\"}\n",
        )
        .unwrap();
        assert_eq!(ok.len(), 2);

        let err = parse_golden("{\"query\":\"x\",\"expected_code\":\"1\"}\nnot json\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
        assert!(parse_golden("{\"query\":\" \",\"expected_code\":\"1\"}").is_err());
    }

    #[tokio::test]
    async fn test_evaluate_with_stub_generator() {
        let config = parse_config("[db]\npath = \"unused.sqlite\"\n").unwrap();
        let engine = Engine::new(
            config,
            Arc::new(InMemoryStore::new()),
            None,
            Arc::new(StubGenerator),
            TokenBudget::in_memory(6000, None),
            Arc::new(NullSink),
        )
        .unwrap();
        for (key, text) in [
            (
                "84:8409.91",
                "8409.91 Parts suitable for use solely or principally with spark-ignition \
                 reciprocating internal combustion piston engine parts.",
            ),
            ("01:0101.21", "0101.21 Live horses: purebred breeding animals."),
        ] {
            engine
                .ingest(&DocumentInput {
                    source: SourceKind::StatuteText,
                    natural_key: key.into(),
                    edition: Some("2025-01-01".into()),
                    title: None,
                    text: text.into(),
                    metadata: Metadata::new(),
                })
                .await
                .unwrap();
        }

        let cases = parse_golden(
            "{\"query\":\"reciprocating engine parts\",\"expected_code\":\"8409.91\"}\n\
             {\"query\":\"submarine periscopes\",\"expected_code\":\"9005.80\"}\n",
        )
        .unwrap();
        let report = evaluate(&engine, &cases, None).await.unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(report.hits_at_1, 1);
        assert_eq!(report.hits_at_k, 1);
        assert_eq!(report.abstained, 1);
        assert_eq!(report.cases[1].decision, "ABSTAIN");
        assert!((report.hit_at_1() - 0.5).abs() < 1e-9);
        assert!((report.abstain_rate() - 0.5).abs() < 1e-9);
    }
}
