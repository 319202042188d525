//! Database statistics and health overview.
//!
//! Provides a quick summary of what's indexed: document counts, chunk counts,
//! embedding coverage, per-source breakdown, and this month's token usage.
//! Used by `hts stats` to confirm that ingestion and embedding worked.

use anyhow::Result;
use hts_harness_core::store::{Store, StoreStats};

use crate::budget::TokenBudget;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let stats = store.stats().await?;
    store.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let budget = TokenBudget::from_config(config)?;

    print!("{}", render(config, &stats, db_size, budget.monthly_used()));
    Ok(())
}

fn render(config: &Config, stats: &StoreStats, db_size: u64, month_tokens: u64) -> String {
    let mut out = String::new();
    out.push_str("HTS Harness: Database Stats\n");
    out.push_str("===========================\n\n");
    out.push_str(&format!("  Database:    {}\n", config.db.path.display()));
    out.push_str(&format!("  Size:        {}\n\n", format_bytes(db_size)));
    out.push_str(&format!("  Documents:   {}\n", stats.documents));
    out.push_str(&format!("  Revisions:   {}\n", stats.revisions));
    out.push_str(&format!("  Chunks:      {}\n", stats.chunks));
    out.push_str(&format!(
        "  Embedded:    {} / {} ({}%)\n",
        stats.embedded_chunks,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded_chunks * 100) / stats.chunks
        } else {
            0
        }
    ));

    let cap = match config.budget.max_monthly_tokens {
        Some(limit) => format!(" / {}", limit),
        None => String::new(),
    };
    out.push_str(&format!("  Tokens (month): {}{}\n", month_tokens, cap));

    if !stats.by_source.is_empty() {
        out.push_str("\n  By source:\n");
        out.push_str(&format!("  {:<16} {:>6}\n", "SOURCE", "DOCS"));
        out.push_str(&format!("  {}\n", "-".repeat(23)));
        for (source, count) in &stats.by_source {
            out.push_str(&format!("  {:<16} {:>6}\n", source, count));
        }
    }
    out.push('\n');
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_render_lists_sources_and_coverage() {
        let config = parse_config("[db]\npath = \"hts.sqlite\"\n[budget]\nmax_monthly_tokens = 100000\n").unwrap();
        let mut stats = StoreStats {
            documents: 3,
            chunks: 8,
            embedded_chunks: 2,
            revisions: 4,
            ..Default::default()
        };
        stats.by_source.insert("ruling".into(), 1);
        stats.by_source.insert("statute-text".into(), 2);

        let out = render(&config, &stats, 4096, 1200);
        assert!(out.contains("Embedded:    2 / 8 (25%)"));
        assert!(out.contains("Tokens (month): 1200 / 100000"));
        assert!(out.contains("statute-text"));
    }
}
