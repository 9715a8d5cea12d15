//! The embedding runtime seam.
//!
//! A provider is created from a [`ModelDescriptor`] by a [`ProviderFactory`]
//! and starts loading on its own. Its readiness is published through a
//! `watch` channel so the lifecycle manager can follow downloads without
//! polling.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Readiness as reported by a provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProviderStatus {
    /// 0.0 before loading starts, 1.0 once the model files are in place
    pub download_progress: f32,
    pub is_ready: bool,
    pub is_generating: bool,
    pub error: Option<String>,
}

impl ProviderStatus {
    pub fn ready() -> Self {
        Self {
            download_progress: 1.0,
            is_ready: true,
            ..Default::default()
        }
    }

    pub fn downloading(progress: f32) -> Self {
        Self {
            download_progress: progress,
            ..Default::default()
        }
    }
}

/// Which model to load. Changing `cache_key` makes the provider ignore any
/// previously downloaded files and fetch the model again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model: String,
    pub cache_key: u32,
}

impl ModelDescriptor {
    pub fn new(model: impl Into<String>, cache_key: u32) -> Self {
        Self {
            model: model.into(),
            cache_key,
        }
    }

    /// Same model under a fresh cache key.
    pub fn cache_busted(&self) -> Self {
        Self {
            model: self.model.clone(),
            cache_key: self.cache_key.wrapping_add(1),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding model is not ready")]
    Unavailable,

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    Failed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Live readiness of this provider instance.
    fn status(&self) -> watch::Receiver<ProviderStatus>;

    /// Embed one text. Callers make sure the provider is ready.
    async fn forward(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

pub trait ProviderFactory: Send + Sync {
    /// Create a provider for `descriptor`. Loading proceeds in the
    /// background; progress shows up on [`EmbeddingProvider::status`].
    fn configure(&self, descriptor: &ModelDescriptor) -> Arc<dyn EmbeddingProvider>;

    /// Drop whatever `descriptor` left behind once its provider was replaced.
    fn discard(&self, _descriptor: &ModelDescriptor) {}
}
