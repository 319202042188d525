//! `hts classify`: one logical query through the full guardrail pipeline.

use anyhow::Result;

use crate::config::Config;
use crate::engine::{ClassifyRequest, ClassifyResponse, Engine};

pub async fn run_classify(
    config: &Config,
    query: &str,
    top_k: Option<usize>,
    alpha: Option<f64>,
    json: bool,
) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let response = engine
        .classify(&ClassifyRequest {
            query: query.to_string(),
            top_k,
            alpha,
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print!("{}", render(&response));
    }
    Ok(())
}

fn render(r: &ClassifyResponse) -> String {
    let mut out = format!("{} ({})\n", r.decision.as_str(), r.reason);
    out.push_str(&format!("answer: {}\n", r.answer));
    if let Some(strength) = r.evidence_strength {
        out.push_str(&format!(
            "evidence: {:.3} ({}, {} attempt{})\n",
            strength,
            r.mode.as_str(),
            r.attempts,
            if r.attempts == 1 { "" } else { "s" }
        ));
    }
    for (i, code) in r.codes.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {} [{:.2}] {}\n",
            i + 1,
            code.code,
            code.confidence,
            code.description
        ));
        if let Some(ref duty) = code.duty_rate {
            out.push_str(&format!("   duty: {}\n", duty));
        }
        out.push_str(&format!("   rationale: {}\n", code.rationale));
        for cite in &code.citations {
            out.push_str(&format!("   cites: {}\n", cite));
        }
    }
    out.push_str(&format!("\n{}\n", r.disclaimer));
    out
}
