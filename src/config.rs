use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::rows::EntityKind;
use crate::semantic::{
    LifecycleSettings, ModelDescriptor, DEFAULT_BATCH_SIZE, DEFAULT_LIMIT, DEFAULT_MODEL,
    MAX_RETRIES, RETRY_COOLDOWN, STALL_TIMEOUT,
};
use crate::storage::{BackendLocal, StorageManager};

const CONFIG_FILE: &str = "config.yaml";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = STALL_TIMEOUT.as_secs();
const DEFAULT_RETRY_COOLDOWN_SECS: u64 = RETRY_COOLDOWN.as_secs();

/// Configuration for semantic search functionality
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Cache-busting key; bump it to force a fresh model download
    #[serde(default)]
    pub cache_key: u32,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// How long download progress may sit between 0 and 1 before the
    /// download counts as stalled
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    #[serde(default = "default_retry_cooldown_secs")]
    pub retry_cooldown_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Rows embedded per kind in one sweep
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Result count when a search does not ask for one
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Entity kinds the sweeper indexes
    #[serde(default = "default_kinds")]
    pub kinds: Vec<EntityKind>,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            model: default_semantic_model(),
            cache_key: 0,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            retry_cooldown_secs: DEFAULT_RETRY_COOLDOWN_SECS,
            max_retries: MAX_RETRIES,
            batch_size: DEFAULT_BATCH_SIZE,
            default_limit: DEFAULT_LIMIT,
            kinds: default_kinds(),
        }
    }
}

impl SemanticSearchConfig {
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            retry_cooldown: Duration::from_secs(self.retry_cooldown_secs),
            max_retries: self.max_retries,
            ..LifecycleSettings::new(ModelDescriptor::new(&self.model, self.cache_key))
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn default_semantic_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_stall_timeout_secs() -> u64 {
    DEFAULT_STALL_TIMEOUT_SECS
}

fn default_retry_cooldown_secs() -> u64 {
    DEFAULT_RETRY_COOLDOWN_SECS
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_kinds() -> Vec<EntityKind> {
    EntityKind::ALL.to_vec()
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the daemon binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            semantic_search: SemanticSearchConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let sem = &self.semantic_search;

        if sem.model.trim().is_empty() {
            bail!("semantic_search.model must not be empty");
        }
        if sem.download_timeout_secs == 0 {
            bail!("semantic_search.download_timeout_secs must be greater than 0");
        }
        if sem.stall_timeout_secs == 0 {
            bail!("semantic_search.stall_timeout_secs must be greater than 0");
        }
        if sem.batch_size == 0 {
            bail!("semantic_search.batch_size must be greater than 0");
        }
        if sem.default_limit == 0 {
            bail!("semantic_search.default_limit must be greater than 0");
        }
        if sem.kinds.is_empty() {
            bail!("semantic_search.kinds must name at least one entity kind");
        }

        self.listen
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("listen address '{}' is invalid", self.listen))?;

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults when missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let store = BackendLocal::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}
