use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::app::context::AppContext;
use crate::config::Config;
use crate::semantic::{FastembedFactory, ProviderFactory};
use crate::store::LocalStore;

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Context backed by the fastembed provider, configured from
    /// `config.yaml` in the base directory.
    pub fn create_context(paths: &AppPaths) -> Result<AppContext> {
        let config = Config::load_with(&paths.base_path)?;
        let factory = Arc::new(FastembedFactory::new(
            paths.base_path.clone(),
            config.semantic_search.download_timeout(),
        ));

        Self::create_context_with(paths, config, factory)
    }

    /// Config and store for commands that never embed anything.
    pub fn open_store(paths: &AppPaths) -> Result<(Config, LocalStore)> {
        let config = Config::load_with(&paths.base_path)?;
        let store = AppContext::open_store(paths, &config)?;
        Ok((config, store))
    }

    /// Context with an explicit provider factory.
    pub fn create_context_with(
        paths: &AppPaths,
        config: Config,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<AppContext> {
        AppContext::start(paths, config, factory)
    }

    /// Get application paths with validation
    pub fn get_paths() -> Result<AppPaths> {
        let paths = AppPaths::new(Self::get_base_path()?);

        // Ensure base directory exists
        std::fs::create_dir_all(&paths.base_path)
            .context("Failed to create application base directory")?;

        Ok(paths)
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("NODESEARCH_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/nodesearch"))
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub store_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            store_path: base_path.join("store"),
            base_path,
        }
    }
}
