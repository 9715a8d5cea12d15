use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::app::factory::AppPaths;
use crate::config::Config;
use crate::semantic::{
    EmbeddingLifecycle, IndexingSweeper, LifecycleState, ModelDescriptor, ProviderFactory,
    SemanticSearchService, SweepStats,
};
use crate::store::{LocalStore, StoreCounts};

/// One app session: the store, the embedding lifecycle and the services
/// built on them. Created at startup, torn down with [`AppContext::shutdown`].
pub struct AppContext {
    config: Config,
    store: Arc<LocalStore>,
    lifecycle: Arc<EmbeddingLifecycle>,
    sweeper: Arc<IndexingSweeper>,
    search: SemanticSearchService,
    ready_watcher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub model: ModelDescriptor,
    pub lifecycle: LifecycleState,
    pub sweeper: SweepStats,
    pub store: StoreCounts,
    /// Searches issued through `search_latest` so far
    pub search_requests: u64,
}

impl AppContext {
    /// Open the store and start loading the embedding model.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(paths: &AppPaths, config: Config, factory: Arc<dyn ProviderFactory>) -> Result<Self> {
        let semantic = &config.semantic_search;
        let store = Arc::new(Self::open_store(paths, &config)?);

        let lifecycle = Arc::new(EmbeddingLifecycle::start(
            factory,
            semantic.lifecycle_settings(),
        ));

        let sweeper = Arc::new(IndexingSweeper::new(
            lifecycle.clone(),
            store.clone(),
            semantic.kinds.clone(),
            semantic.batch_size,
        ));

        let search = SemanticSearchService::new(
            lifecycle.clone(),
            store.clone(),
            semantic.default_limit,
        );

        Ok(Self {
            config,
            store,
            lifecycle,
            sweeper,
            search,
            ready_watcher: Mutex::new(None),
        })
    }

    /// The row store alone, without loading the embedding model.
    pub fn open_store(paths: &AppPaths, config: &Config) -> Result<LocalStore> {
        LocalStore::open(&paths.store_path, &config.semantic_search.model)
            .with_context(|| format!("failed to open store at {}", paths.store_path.display()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<EmbeddingLifecycle> {
        &self.lifecycle
    }

    pub fn sweeper(&self) -> &Arc<IndexingSweeper> {
        &self.sweeper
    }

    pub fn search(&self) -> &SemanticSearchService {
        &self.search
    }

    /// Sweep whenever the model becomes ready, for as long as the context
    /// lives. Calling it again has no effect.
    pub fn spawn_background_indexing(&self) {
        let mut watcher = self
            .ready_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if watcher.is_none() {
            *watcher = Some(self.sweeper.spawn_on_ready());
        }
    }

    /// Wait until the model is ready or needs a manual retry.
    pub async fn wait_for_model(&self) -> LifecycleState {
        let mut state_rx = self.lifecycle.subscribe();
        let result = state_rx
            .wait_for(LifecycleState::is_settled)
            .await
            .map(|state| state.clone());

        result.unwrap_or_else(|_| self.lifecycle.state())
    }

    pub fn status(&self) -> Result<AppStatus> {
        Ok(AppStatus {
            model: self.lifecycle.descriptor(),
            lifecycle: self.lifecycle.state(),
            sweeper: self.sweeper.stats(),
            store: self.store.counts()?,
            search_requests: self.search.latest_request_id(),
        })
    }

    pub fn shutdown(&self) {
        self.stop();
        log::info!("app context shut down");
    }

    fn stop(&self) {
        if let Some(watcher) = self
            .ready_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        self.lifecycle.shutdown();
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.stop();
    }
}
