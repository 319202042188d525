//! Embedding capability trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus pure helpers for vector serialization, validation, and
//! similarity.
//!
//! Concrete providers (OpenAI, Ollama, deterministic stub) live in the
//! `hts-harness` app crate.

use anyhow::{bail, Result};
use async_trait::async_trait;

/// An opaque `embed(text) -> vector` capability.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Reject a provider response that is malformed for the request.
///
/// A response is malformed when the vector count differs from the input
/// count, any vector has the wrong dimension, or any component is not
/// finite.
pub fn check_vectors(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        bail!(
            "embedding response has {} vectors for {} inputs",
            vectors.len(),
            expected
        );
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dims {
            bail!("embedding {} has {} dims, expected {}", i, v.len(), dims);
        }
        if v.iter().any(|x| !x.is_finite()) {
            bail!("embedding {} contains a non-finite component", i);
        }
    }
    Ok(())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use hts_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`, or `None` when undefined.
///
/// Undefined means the vectors are empty, differ in length, or one of them
/// has zero magnitude. Accumulates in `f64` so that scale differences
/// between model versions do not change the result.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return None;
    }

    Some((dot / denom).clamp(-1.0, 1.0))
}
