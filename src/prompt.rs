//! Prompt rendering for classification and schema repair.
//!
//! Passages are rendered as numbered blocks headed by their `chunk_id`, so
//! the model can cite them verbatim:
//!
//! ```text
//! [1] id=htsus:84:8407.10@2025-01-01#s0-o0 score=0.912
//! Spark-ignition reciprocating or rotary internal combustion piston engines.
//! ```

use hts_harness_core::validate::{DISCLAIMER, RESPONSE_SCHEMA};

/// One passage handed to generation.
#[derive(Debug, Clone)]
pub struct Passage<'a> {
    pub chunk_id: &'a str,
    pub text: &'a str,
    pub score: f64,
}

/// Prefix of a passage header line.
pub const PASSAGE_ID_MARKER: &str = " id=";

pub fn system_rules() -> String {
    format!(
        r#"You are an HTS (Harmonized Tariff Schedule of the United States) classification assistant.

OUTPUT FORMAT (MANDATORY)
- Output only a single JSON object that conforms to the JSON Schema below.
- No preamble or trailing prose. No markdown. No explanations outside JSON.

BEHAVIORAL RULES
- Pick 1 to 3 candidate codes.
- If uncertain, return a single best guess with confidence 0.30 to 0.49.
- Use short, plain-English descriptions.
- Rationale must be specific to the query.
- Every code must cite at least one passage by its exact id from the PASSAGES list. Never cite anything else.
- Never invent HTS codes that do not exist.
- Set "disclaimer" to exactly: "{}"

SCHEMA:
{}"#,
        DISCLAIMER, RESPONSE_SCHEMA
    )
}

/// Render the user message.
pub fn user_prompt(query: &str, passages: &[Passage<'_>]) -> String {
    format!(
        "QUERY:\n{}\n\nPASSAGES:\n{}\n\nReturn ONLY the JSON object (no extra text).",
        query.trim(),
        render_passages(passages)
    )
}

/// Render the single corrective follow-up after a schema failure.
pub fn repair_prompt(query: &str, passages: &[Passage<'_>], bad_output: &str, violations: &[String]) -> String {
    let listed: Vec<String> = violations.iter().map(|v| format!("- {}", v)).collect();
    format!(
        "Your previous output did not match the schema. Return only valid JSON that matches this schema. Do not add prose.\n\n\
         SCHEMA:\n{}\n\nVIOLATIONS:\n{}\n\nBAD_JSON:\n{}\n\nQUERY:\n{}\n\nPASSAGES:\n{}",
        RESPONSE_SCHEMA,
        listed.join("\n"),
        bad_output.trim(),
        query.trim(),
        render_passages(passages)
    )
}

fn render_passages(passages: &[Passage<'_>]) -> String {
    if passages.is_empty() {
        return "(none)".to_string();
    }
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}]{}{} score={:.3}\n{}", i + 1, PASSAGE_ID_MARKER, p.chunk_id, p.score, p.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Rough token estimate: one token per four characters, at least one.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() / 4) as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passages() -> Vec<Passage<'static>> {
        vec![
            Passage {
                chunk_id: "htsus:84:8407.10@2025-01-01#s0-o0",
                text: "8407.10 Aircraft engines",
                score: 0.9,
            },
            Passage {
                chunk_id: "ruling:HQ-H1#s0-o0",
                text: "Ruling text",
                score: 0.31,
            },
        ]
    }

    #[test]
    fn test_user_prompt_lists_citable_ids() {
        let prompt = user_prompt("  aircraft engine ", &passages());
        assert!(prompt.starts_with("QUERY:\naircraft engine\n"));
        assert!(prompt.contains("[1] id=htsus:84:8407.10@2025-01-01#s0-o0 score=0.900"));
        assert!(prompt.contains("[2] id=ruling:HQ-H1#s0-o0"));
    }

    #[test]
    fn test_repair_prompt_restates_schema_and_violations() {
        let p = repair_prompt("q", &passages(), "{bad", &["codes: missing".to_string()]);
        assert!(p.contains("\"additionalProperties\": false"));
        assert!(p.contains("- codes: missing"));
        assert!(p.contains("BAD_JSON:\n{bad"));
    }

    #[test]
    fn test_system_rules_carry_disclaimer() {
        assert!(system_rules().contains(DISCLAIMER));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
