//! Document retrieval and removal by `doc_id`.
//!
//! Used by `hts get`, `hts delete`, and `GET /documents/{doc_id}`.

use anyhow::{bail, Result};
use serde::Serialize;

use hts_harness_core::models::{Metadata, SourceKind};
use hts_harness_core::search::format_ts_iso;
use hts_harness_core::store::{Revision, Store};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// A stored document with its chunks and revision history.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub doc_id: String,
    pub source: SourceKind,
    pub natural_key: String,
    pub edition: Option<String>,
    pub revision: i64,
    pub content_hash: String,
    pub title: Option<String>,
    pub ingested_at: String, // ISO8601
    pub body: String,
    pub metadata: Metadata,
    pub chunks: Vec<ChunkResponse>,
    pub revisions: Vec<Revision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub chunk_id: String,
    pub locator: String,
    pub token_count: usize,
    pub embedded: bool,
    pub text: String,
}

/// Load a document view from any store. `None` when the id is unknown.
pub async fn get_document(store: &dyn Store, doc_id: &str) -> Result<Option<DocumentResponse>> {
    let Some(doc) = store.get_document(doc_id).await? else {
        return Ok(None);
    };
    let chunks = store
        .get_chunks(doc_id)
        .await?
        .into_iter()
        .map(|c| ChunkResponse {
            embedded: c.embedding.is_some(),
            chunk_id: c.chunk_id,
            locator: c.locator.into(),
            token_count: c.token_count,
            text: c.text,
        })
        .collect();
    let revisions = store.revisions(doc_id).await?;

    Ok(Some(DocumentResponse {
        doc_id: doc.doc_id,
        source: doc.source,
        natural_key: doc.natural_key,
        edition: doc.edition,
        revision: doc.revision,
        content_hash: doc.content_hash,
        title: doc.title,
        ingested_at: format_ts_iso(doc.ingested_at),
        body: doc.body,
        metadata: doc.metadata,
        chunks,
        revisions,
    }))
}

/// CLI entry point: print a document, or fail when it does not exist.
pub async fn run_get(config: &Config, doc_id: &str, json: bool) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let doc = get_document(&store, doc_id).await;
    store.close().await;

    let Some(doc) = doc? else {
        bail!("document not found: {}", doc_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("--- Document ---");
    println!("doc_id:       {}", doc.doc_id);
    println!(
        "title:        {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    println!("source:       {}", doc.source);
    println!("natural_key:  {}", doc.natural_key);
    if let Some(ref edition) = doc.edition {
        println!("edition:      {}", edition);
    }
    println!("revision:     {}", doc.revision);
    println!("content_hash: {}", doc.content_hash);
    println!("ingested_at:  {}", doc.ingested_at);
    if !doc.metadata.is_empty() {
        println!("metadata:     {}", serde_json::to_string(&doc.metadata)?);
    }
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!(
            "[{}] {} tokens{}",
            chunk.locator,
            chunk.token_count,
            if chunk.embedded { ", embedded" } else { "" }
        );
        println!("{}", chunk.text);
        println!();
    }

    if doc.revisions.len() > 1 {
        println!("--- Revisions ---");
        for rev in &doc.revisions {
            println!(
                "  r{}  {}  {}",
                rev.revision,
                format_ts_iso(rev.recorded_at),
                rev.content_hash
            );
        }
    }

    Ok(())
}

/// CLI entry point for `hts delete`.
pub async fn run_delete(config: &Config, doc_id: &str) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let removed = store.delete_document(doc_id).await;
    store.close().await;

    if !removed? {
        bail!("document not found: {}", doc_id);
    }
    println!("deleted {}", doc_id);
    Ok(())
}
