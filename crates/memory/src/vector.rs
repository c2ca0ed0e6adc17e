//! Vector similarity and ranking utilities.
//!
//! Pure-Rust brute-force search shared by every [`VectorIndex`] backend:
//! - Cosine similarity
//! - Scope-filtered top-k ranking with deterministic tie-breaks
//! - f32 little-endian blob encoding for persisted embeddings
//!
//! [`VectorIndex`]: nestling_core::VectorIndex

use nestling_core::vector::{ScopeFilter, ScoredEntry, VectorEntry};
use std::cmp::Ordering;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Ordering for hits: similarity desc, then importance desc, then
/// `recorded_at` desc, then entry id so equal inputs always rank the same.
pub fn compare_hits(a: &ScoredEntry, b: &ScoredEntry) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.metadata.importance().cmp(&a.metadata.importance()))
        .then_with(|| b.metadata.recorded_at().cmp(&a.metadata.recorded_at()))
        .then_with(|| a.entry_id.cmp(&b.entry_id))
}

/// Rank entries against a query embedding.
///
/// The scope filter is applied before scoring; entries outside the scope are
/// never scored, let alone returned.
pub fn rank<'a>(
    entries: impl IntoIterator<Item = &'a VectorEntry>,
    query: &[f32],
    filter: &ScopeFilter,
    k: usize,
) -> Vec<ScoredEntry> {
    let mut scored: Vec<ScoredEntry> = entries
        .into_iter()
        .filter(|e| filter.matches(&e.metadata))
        .filter(|e| !e.embedding.is_empty())
        .map(|e| ScoredEntry {
            entry_id: e.id.clone(),
            document: e.document.clone(),
            metadata: e.metadata.clone(),
            score: cosine_similarity(&e.embedding, query),
        })
        .collect();

    scored.sort_by(compare_hits);
    scored.truncate(k);
    scored
}

/// Encode an embedding as an f32 little-endian blob.
pub fn to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode an f32 little-endian blob. Trailing partial chunks are ignored.
pub fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
