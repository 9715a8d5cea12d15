//! Local semantic search.
//!
//! # Architecture
//!
//! - `provider`: the embedding runtime seam ([`EmbeddingProvider`], [`ProviderFactory`])
//! - `embeddings`: fastembed-backed provider
//! - `lifecycle`: model readiness, stall detection and bounded retries
//! - `sweeper`: background backfill of missing vectors
//! - `service`: query embedding and nearest-neighbor ranking

pub mod embeddings;
mod lifecycle;
mod provider;
mod service;
mod sweeper;

pub use embeddings::FastembedFactory;
pub use lifecycle::{
    EmbeddingLifecycle, LifecycleSettings, LifecycleState, Phase, MAX_RETRIES, RETRY_COOLDOWN,
    STALL_TIMEOUT,
};
pub use provider::{
    EmbeddingError, EmbeddingProvider, ModelDescriptor, ProviderFactory, ProviderStatus,
};
pub use service::{SearchResult, SemanticSearchService, DEFAULT_LIMIT};
pub use sweeper::{IndexingSweeper, SweepReport, SweepStats, DEFAULT_BATCH_SIZE};

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
