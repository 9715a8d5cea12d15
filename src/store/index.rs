//! In-memory vector index with cosine distance ranking.

use std::collections::BTreeMap;

use crate::eid::Eid;

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// Hash of the content that was embedded
    pub content_hash: u64,
    /// The embedding vector
    pub embedding: Vec<f32>,
}

/// Vectors keyed by row id.
///
/// Entries iterate in id order, which is the store's natural row order, so
/// equal distances keep that order after ranking.
pub struct VectorIndex {
    entries: BTreeMap<Eid, VectorEntry>,
    /// Expected embedding dimensions, 0 until the first vector is stored
    dimensions: usize,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,
}

impl VectorIndex {
    /// Create an empty index. Pass 0 to adopt the size of the first vector.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the vector of a row.
    pub fn insert(
        &mut self,
        id: Eid,
        content_hash: u64,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        if self.dimensions == 0 && self.entries.is_empty() {
            self.dimensions = embedding.len();
        }

        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        if l2_norm(&embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        self.entries.insert(
            id,
            VectorEntry {
                content_hash,
                embedding,
            },
        );

        Ok(())
    }

    pub fn remove(&mut self, id: &Eid) -> Option<VectorEntry> {
        self.entries.remove(id)
    }

    #[cfg(test)]
    pub fn get(&self, id: &Eid) -> Option<&VectorEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &Eid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Eid, &VectorEntry)> {
        self.entries.iter()
    }

    /// Rank stored vectors by cosine distance to `query`.
    ///
    /// Returns at most `limit` `(id, distance)` pairs, closest first.
    /// Distance is `1 - cosine similarity`, so it lies in `[0, 2]`.
    pub fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<(Eid, f32)>, IndexError> {
        if limit == 0 || self.entries.is_empty() {
            return Ok(vec![]);
        }

        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut results: Vec<(Eid, f32)> = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let similarity = cosine_similarity(query, &entry.embedding, query_norm);
                (id.clone(), (1.0 - similarity).clamp(0.0, 2.0))
            })
            .collect();

        // stable: equal distances stay in id order
        results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        Ok(results)
    }

    /// Drop every vector and forget the dimension count.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dimensions = 0;
    }
}

/// Compute L2 norm of a vector.
fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with a precomputed query norm.
fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot_product / (query_norm * target_norm)
}
