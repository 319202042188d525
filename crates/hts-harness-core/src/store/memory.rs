//! In-memory [`Store`] implementation for tests and embedding in other
//! processes.
//!
//! All tables sit behind one `std::sync::RwLock`, so
//! [`put_document`](Store::put_document) and
//! [`delete_document`](Store::delete_document) are atomic with respect to
//! readers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{Chunk, Document};

use super::{Revision, Store, StoreStats};

#[derive(Default)]
struct Tables {
    docs: HashMap<String, Document>,
    /// doc_id → chunk_id → chunk
    chunks: HashMap<String, BTreeMap<String, Chunk>>,
    revisions: HashMap<String, Vec<Revision>>,
    /// chunk_id → embedding model
    models: HashMap<String, String>,
    version: u64,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Model that produced a chunk's embedding, if any.
    pub fn embedding_model(&self, chunk_id: &str) -> Option<String> {
        self.read().ok()?.models.get(chunk_id).cloned()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn in_reading_order(chunks: &BTreeMap<String, Chunk>) -> Vec<Chunk> {
    let mut out: Vec<Chunk> = chunks.values().cloned().collect();
    out.sort_by_key(|c| c.locator);
    out
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_document(&self, doc: &Document, chunks: &[Chunk]) -> Result<()> {
        if let Some(stray) = chunks.iter().find(|c| c.doc_id != doc.doc_id) {
            bail!(
                "chunk {} does not belong to document {}",
                stray.chunk_id,
                doc.doc_id
            );
        }

        let mut t = self.write()?;
        if let Some(old) = t.chunks.remove(&doc.doc_id) {
            for id in old.keys() {
                t.models.remove(id);
            }
        }
        t.chunks.insert(
            doc.doc_id.clone(),
            chunks.iter().map(|c| (c.chunk_id.clone(), c.clone())).collect(),
        );

        let history = t.revisions.entry(doc.doc_id.clone()).or_default();
        if !history.iter().any(|r| r.revision == doc.revision) {
            history.push(Revision {
                doc_id: doc.doc_id.clone(),
                revision: doc.revision,
                content_hash: doc.content_hash.clone(),
                recorded_at: doc.ingested_at,
            });
        }
        t.docs.insert(doc.doc_id.clone(), doc.clone());
        t.version += 1;
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.docs.get(doc_id).cloned())
    }

    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        Ok(self
            .read()?
            .chunks
            .get(doc_id)
            .map(in_reading_order)
            .unwrap_or_default())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<bool> {
        let mut t = self.write()?;
        let existed = t.docs.remove(doc_id).is_some();
        if let Some(old) = t.chunks.remove(doc_id) {
            for id in old.keys() {
                t.models.remove(id);
            }
        }
        t.revisions.remove(doc_id);
        if existed {
            t.version += 1;
        }
        Ok(existed)
    }

    async fn upsert_embedding(&self, chunk_id: &str, vector: &[f32], model: &str) -> Result<()> {
        let mut t = self.write()?;
        let chunk = t
            .chunks
            .values_mut()
            .find_map(|m| m.get_mut(chunk_id))
            .ok_or_else(|| anyhow!("unknown chunk {}", chunk_id))?;
        chunk.embedding = Some(vector.to_vec());
        t.models.insert(chunk_id.to_string(), model.to_string());
        t.version += 1;
        Ok(())
    }

    async fn pending_embeddings(&self, limit: usize) -> Result<Vec<Chunk>> {
        let t = self.read()?;
        let mut pending: Vec<Chunk> = t
            .chunks
            .values()
            .flat_map(|m| m.values())
            .filter(|c| c.embedding.is_none())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn clear_embeddings(&self) -> Result<u64> {
        let mut t = self.write()?;
        let mut cleared = 0u64;
        for chunk in t.chunks.values_mut().flat_map(|m| m.values_mut()) {
            if chunk.embedding.take().is_some() {
                cleared += 1;
            }
        }
        t.models.clear();
        if cleared > 0 {
            t.version += 1;
        }
        Ok(cleared)
    }

    async fn load_chunks(&self) -> Result<Vec<Chunk>> {
        let t = self.read()?;
        Ok(t.chunks.values().flat_map(|m| m.values().cloned()).collect())
    }

    async fn revisions(&self, doc_id: &str) -> Result<Vec<Revision>> {
        let mut history = self.read()?.revisions.get(doc_id).cloned().unwrap_or_default();
        history.sort_by_key(|r| r.revision);
        Ok(history)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let t = self.read()?;
        let mut stats = StoreStats {
            documents: t.docs.len() as u64,
            revisions: t.revisions.values().map(|v| v.len() as u64).sum(),
            ..Default::default()
        };
        for chunk in t.chunks.values().flat_map(|m| m.values()) {
            stats.chunks += 1;
            if chunk.embedding.is_some() {
                stats.embedded_chunks += 1;
            }
        }
        for doc in t.docs.values() {
            *stats.by_source.entry(doc.source.to_string()).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn data_version(&self) -> Result<u64> {
        Ok(self.read()?.version)
    }
}
