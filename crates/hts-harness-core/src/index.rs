//! Immutable chunk index snapshot and its atomically swappable cell.
//!
//! Queries take an `Arc<IndexSnapshot>` once and score against it for
//! their whole lifetime. Ingestion builds a new snapshot off to the side and
//! publishes it with [`SnapshotCell::swap`], so a reader sees either all of
//! an ingestion or none of it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::lexical::{Bm25Params, LexicalIndex};
use crate::models::Chunk;

/// A read-only view of every indexed chunk, with its lexical index.
#[derive(Debug)]
pub struct IndexSnapshot {
    chunks: Vec<Chunk>,
    by_id: HashMap<String, usize>,
    lexical: LexicalIndex,
    embedded: usize,
    generation: u64,
}

impl IndexSnapshot {
    /// Build a snapshot. Chunks are put in `(doc_id, locator)` order so that
    /// passage positions do not depend on load order.
    pub fn build(mut chunks: Vec<Chunk>, params: Bm25Params, generation: u64) -> Self {
        chunks.sort_by(|a, b| a.doc_id.cmp(&b.doc_id).then(a.locator.cmp(&b.locator)));
        chunks.dedup_by(|a, b| a.chunk_id == b.chunk_id);

        let lexical = LexicalIndex::build(chunks.iter().map(|c| c.text.as_str()), params);
        let by_id = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.chunk_id.clone(), i))
            .collect();
        let embedded = chunks.iter().filter(|c| c.embedding.is_some()).count();

        Self {
            chunks,
            by_id,
            lexical,
            embedded,
            generation,
        }
    }

    pub fn empty(params: Bm25Params) -> Self {
        Self::build(Vec::new(), params, 0)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, position: usize) -> Option<&Chunk> {
        self.chunks.get(position)
    }

    pub fn get(&self, chunk_id: &str) -> Option<&Chunk> {
        self.by_id.get(chunk_id).map(|&i| &self.chunks[i])
    }

    /// Passage position of a chunk in the lexical index.
    pub fn position(&self, chunk_id: &str) -> Option<usize> {
        self.by_id.get(chunk_id).copied()
    }

    pub fn lexical(&self) -> &LexicalIndex {
        &self.lexical
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of chunks carrying an embedding.
    pub fn embedded_count(&self) -> usize {
        self.embedded
    }

    /// Monotonic publish counter of the cell that produced this snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Shared holder of the current snapshot.
#[derive(Debug)]
pub struct SnapshotCell {
    current: RwLock<Arc<IndexSnapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: IndexSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// The snapshot visible right now.
    pub fn load(&self) -> Arc<IndexSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Publish a new snapshot built from `chunks`. In-flight readers keep
    /// the snapshot they already hold.
    pub fn publish(&self, chunks: Vec<Chunk>, params: Bm25Params) -> Arc<IndexSnapshot> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::new(IndexSnapshot::build(chunks, params, guard.generation + 1));
        *guard = Arc::clone(&next);
        next
    }

    /// Replace the current snapshot wholesale.
    pub fn swap(&self, snapshot: Arc<IndexSnapshot>) -> Arc<IndexSnapshot> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, snapshot)
    }
}
