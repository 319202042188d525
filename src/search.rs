//! `hts search`: hybrid retrieval without the guardrail or generation.
//!
//! Prints the fused ranking the engine would hand to generation, with an
//! optional per-stream breakdown (`--explain`).

use anyhow::Result;

use hts_harness_core::search::SearchResultItem;

use crate::config::Config;
use crate::engine::{Engine, SearchRequest, SearchResponse};

pub async fn run_search(
    config: &Config,
    query: &str,
    top_k: Option<usize>,
    alpha: Option<f64>,
    explain: bool,
    json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let engine = Engine::open(config.clone()).await?;
    let response = engine
        .search(&SearchRequest {
            query: query.to_string(),
            top_k,
            alpha,
            explain,
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print!("{}", render(&response));
    }
    Ok(())
}

fn render(response: &SearchResponse) -> String {
    if response.results.is_empty() {
        return "No results.\n".to_string();
    }

    let mut out = format!(
        "mode: {} (alpha {:.2}){}\n\n",
        response.mode.as_str(),
        response.alpha,
        if response.semantic_degraded {
            ", query embedding unavailable"
        } else {
            ""
        }
    );
    for item in &response.results {
        out.push_str(&render_item(item));
    }
    out
}

fn render_item(item: &SearchResultItem) -> String {
    let mut out = format!("{}. [{:.3}] {}\n", item.rank, item.score, item.doc_id);
    out.push_str(&format!(
        "    excerpt: \"{}\"\n",
        item.snippet.replace('\n', " ").trim()
    ));
    out.push_str(&format!("    id: {}\n", item.chunk_id));
    if let Some(ref e) = item.explain {
        let fmt_raw = |v: Option<f64>| v.map(|x| format!("{:.4}", x)).unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "    lexical: {:.3} (raw {})  semantic: {} (raw {})\n",
            e.lexical_score,
            fmt_raw(e.lexical_raw),
            e.semantic_score
                .map(|s| format!("{:.3}", s))
                .unwrap_or_else(|| "-".into()),
            fmt_raw(e.semantic_raw)
        ));
    }
    out.push('\n');
    out
}
