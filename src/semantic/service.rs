//! Semantic search over indexed rows.
//!
//! Every failure on the way (blank query, model not ready, embedding or
//! store errors) degrades to an empty result list.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::lifecycle::EmbeddingLifecycle;
use crate::eid::Eid;
use crate::rows::EntityKind;
use crate::store::RowStore;

pub const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: Eid,
    pub kind: EntityKind,
    pub type_tag: String,
    pub title: String,
    /// `1 - distance`
    pub similarity: f32,
}

impl SearchResult {
    /// Similarity for display, e.g. `0.87`.
    pub fn display_similarity(&self) -> String {
        format!("{:.2}", self.similarity)
    }
}

pub struct SemanticSearchService {
    lifecycle: Arc<EmbeddingLifecycle>,
    store: Arc<dyn RowStore>,
    default_limit: usize,
    last_request: AtomicU64,
}

impl SemanticSearchService {
    pub fn new(
        lifecycle: Arc<EmbeddingLifecycle>,
        store: Arc<dyn RowStore>,
        default_limit: usize,
    ) -> Self {
        Self {
            lifecycle,
            store,
            default_limit,
            last_request: AtomicU64::new(0),
        }
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    pub fn is_available(&self) -> bool {
        self.lifecycle.is_ready()
    }

    /// Rows closest in meaning to `query`, most similar first, at most `k`.
    pub async fn search(&self, query: &str, k: usize) -> Vec<SearchResult> {
        let query = query.trim();
        if query.is_empty() || k == 0 {
            return vec![];
        }
        if !self.lifecycle.is_ready() {
            log::debug!("embedding model not ready, search returns nothing");
            return vec![];
        }

        let Some(vector) = self.lifecycle.embed(query).await else {
            return vec![];
        };

        let neighbors = match self.store.nearest(&vector, k).await {
            Ok(neighbors) => neighbors,
            Err(e) => {
                log::error!("nearest neighbor query failed: {e}");
                return vec![];
            }
        };

        let mut results: Vec<SearchResult> = neighbors
            .into_iter()
            .take(k)
            .map(|neighbor| SearchResult {
                similarity: 1.0 - neighbor.distance,
                id: neighbor.row.id,
                kind: neighbor.row.kind,
                type_tag: neighbor.row.type_tag,
                title: neighbor.row.title,
            })
            .collect();

        // stable, so equal distances keep store order
        results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        log::debug!("search '{query}' returned {} results", results.len());
        results
    }

    /// Like [`search`](Self::search), but returns `None` when a newer
    /// `search_latest` call was issued before this one finished.
    pub async fn search_latest(&self, query: &str, k: usize) -> Option<Vec<SearchResult>> {
        let request_id = self.last_request.fetch_add(1, Ordering::SeqCst) + 1;
        let results = self.search(query, k).await;

        if self.last_request.load(Ordering::SeqCst) != request_id {
            log::debug!("discarding results of superseded search {request_id}");
            return None;
        }
        Some(results)
    }

    /// Id of the most recently issued [`search_latest`](Self::search_latest) call.
    pub fn latest_request_id(&self) -> u64 {
        self.last_request.load(Ordering::SeqCst)
    }
}
