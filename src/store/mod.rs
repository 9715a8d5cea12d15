//! Row storage with a nullable vector per row.
//!
//! - `index`: in-memory vectors ranked by cosine distance
//! - `vectors`: binary persistence for vectors (vectors.bin)
//! - `local`: CSV-backed [`LocalStore`] implementing [`RowStore`]

mod index;
mod local;
mod vectors;

use async_trait::async_trait;
use serde::Serialize;

use crate::eid::Eid;
use crate::rows::{EntityKind, Row};

use index::IndexError;
use vectors::VectorStorageError;

pub use local::{LocalStore, StoreCounts};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("row {0} not found")]
    NotFound(Eid),

    #[error("row {0} changed since it was read")]
    Stale(Eid),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("vector storage error: {0}")]
    Vectors(#[from] VectorStorageError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// A row together with its distance to a query vector.
#[derive(Debug, Clone, Serialize)]
pub struct Neighbor {
    pub row: Row,
    pub distance: f32,
}

/// What the indexing pipeline needs from a row store.
///
/// Distance metric and indexing strategy belong to the implementation.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Rows of `kind` that have embeddable text but no vector, in store
    /// order, at most `limit` of them.
    async fn missing_vectors(&self, kind: EntityKind, limit: usize) -> Result<Vec<Row>, StoreError>;

    /// Persist `vector` onto the row it was computed from.
    ///
    /// Fails with [`StoreError::Stale`] when the row's text changed after
    /// `row` was read, leaving the row unindexed.
    async fn set_vector(&self, row: &Row, vector: Vec<f32>) -> Result<(), StoreError>;

    /// The `limit` indexed rows closest to `query`, ascending by distance,
    /// ties in store order. Rows without a vector are never returned.
    async fn nearest(&self, query: &[f32], limit: usize) -> Result<Vec<Neighbor>, StoreError>;
}
