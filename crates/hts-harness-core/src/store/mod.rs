//! Storage abstraction for HTS Harness.
//!
//! The [`Store`] trait is the logical document/chunk store: a document
//! table, a chunk table with a nullable embedding, and a revision history.
//! The physical engine is the implementor's choice (SQLite in the
//! application, [`memory::InMemoryStore`] here).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Chunk, Document};

/// One accepted content version of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Revision {
    pub doc_id: String,
    pub revision: i64,
    pub content_hash: String,
    /// Unix timestamp (seconds).
    pub recorded_at: i64,
}

/// Row counts for `hts stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
    pub revisions: u64,
    /// Document count per source kind.
    pub by_source: BTreeMap<String, u64>,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put_document`](Store::put_document) | Atomically write a document, its chunks and its revision row |
/// | [`get_document`](Store::get_document) | Fetch a document by `doc_id` |
/// | [`get_chunks`](Store::get_chunks) | Fetch a document's chunks in reading order |
/// | [`delete_document`](Store::delete_document) | Remove a document; chunks and revisions cascade |
/// | [`upsert_embedding`](Store::upsert_embedding) | Attach a vector to a chunk |
/// | [`pending_embeddings`](Store::pending_embeddings) | Chunks still lacking a vector |
/// | [`clear_embeddings`](Store::clear_embeddings) | Drop every vector (before a rebuild) |
/// | [`load_chunks`](Store::load_chunks) | Every chunk, for building an index snapshot |
/// | [`revisions`](Store::revisions) | Revision history of a document |
/// | [`stats`](Store::stats) | Row counts |
/// | [`data_version`](Store::data_version) | Change counter for snapshot staleness checks |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace a document together with its full chunk set.
    ///
    /// Chunks previously stored for the document are removed. A revision
    /// row for `(doc_id, revision)` is recorded if not already present.
    /// Either all of this is visible afterwards or none of it is.
    async fn put_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()>;

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>>;

    /// Chunks of one document ordered by locator.
    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>>;

    /// Returns `false` if no such document existed.
    async fn delete_document(&self, doc_id: &str) -> Result<bool>;

    /// Store a vector for a chunk. Errors if the chunk does not exist.
    async fn upsert_embedding(&self, chunk_id: &str, vector: &[f32], model: &str) -> Result<()>;

    /// Up to `limit` chunks without an embedding, in `chunk_id` order.
    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<Chunk>>;

    /// Remove every stored vector. Returns how many were removed.
    async fn clear_embeddings(&self) -> Result<u64>;

    /// Every chunk, with embeddings.
    async fn load_chunks(&self) -> Result<Vec<Chunk>>;

    /// Revision history, oldest first.
    async fn revisions(&self, doc_id: &str) -> Result<Vec<Revision>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// A counter that changes whenever a chunk or its embedding is written
    /// or removed, including by another process sharing the backend.
    async fn data_version(&self) -> Result<u64>;
}
