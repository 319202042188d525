//! Semantic scorer: cosine similarity against a query embedding.
//!
//! A chunk without an embedding, or with one of a different dimension,
//! scores [`None`] ("unknown"). Unknown is never coerced to zero; fusion
//! keeps it out of the semantic stream entirely.

use crate::embedding::cosine_similarity;

/// Similarity of one chunk to the query, or `None` when unknown.
pub fn score(query_embedding: &[f32], chunk_embedding: Option<&[f32]>) -> Option<f64> {
    cosine_similarity(query_embedding, chunk_embedding?)
}
