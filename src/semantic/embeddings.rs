//! fastembed-backed [`EmbeddingProvider`].
//!
//! - Model files live under `models/<model>-<cache_key>` in the base directory
//! - Loading (and the download on first use) runs on the blocking pool
//! - A download that outlives `download_timeout` fails the provider

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{InitOptions, TextEmbedding};
use tokio::sync::watch;

use super::provider::{
    EmbeddingError, EmbeddingProvider, ModelDescriptor, ProviderFactory, ProviderStatus,
};

/// fastembed prints download progress to the terminal only, so an ongoing
/// load is reported as halfway done.
const LOADING_PROGRESS: f32 = 0.5;

pub struct FastembedFactory {
    cache_dir: PathBuf,
    download_timeout: Duration,
}

impl FastembedFactory {
    pub fn new(cache_dir: PathBuf, download_timeout: Duration) -> Self {
        Self {
            cache_dir,
            download_timeout,
        }
    }
}

impl ProviderFactory for FastembedFactory {
    fn configure(&self, descriptor: &ModelDescriptor) -> Arc<dyn EmbeddingProvider> {
        let provider = Arc::new(FastembedProvider::new(descriptor.clone()));
        provider
            .clone()
            .start_loading(self.cache_dir.clone(), self.download_timeout);
        provider
    }

    fn discard(&self, descriptor: &ModelDescriptor) {
        let dir = models_dir(&self.cache_dir, descriptor);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => log::info!("removed model files in {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to remove {}: {e}", dir.display()),
        }
    }
}

/// `<cache_dir>/models/<model>-<cache_key>`
fn models_dir(cache_dir: &Path, descriptor: &ModelDescriptor) -> PathBuf {
    cache_dir.join("models").join(format!(
        "{}-{}",
        descriptor.model.to_lowercase(),
        descriptor.cache_key
    ))
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastembedProvider {
    descriptor: ModelDescriptor,
    model: OnceLock<Arc<Mutex<TextEmbedding>>>,
    status: watch::Sender<ProviderStatus>,
    in_flight: AtomicUsize,
}

impl FastembedProvider {
    fn new(descriptor: ModelDescriptor) -> Self {
        let (status, _) = watch::channel(ProviderStatus::default());
        Self {
            descriptor,
            model: OnceLock::new(),
            status,
            in_flight: AtomicUsize::new(0),
        }
    }

    fn start_loading(self: Arc<Self>, cache_dir: PathBuf, download_timeout: Duration) {
        tokio::spawn(async move {
            let model_enum = match parse_model_name(&self.descriptor.model) {
                Ok(model_enum) => model_enum,
                Err(e) => return self.fail(e),
            };

            let models_dir = models_dir(&cache_dir, &self.descriptor);
            log::info!(
                "loading embedding model {} into {}",
                self.descriptor.model,
                models_dir.display()
            );
            self.status
                .send_replace(ProviderStatus::downloading(LOADING_PROGRESS));

            let load = tokio::task::spawn_blocking(move || load_model(model_enum, models_dir));
            match tokio::time::timeout(download_timeout, load).await {
                Ok(Ok(Ok(model))) => {
                    let _ = self.model.set(Arc::new(Mutex::new(model)));
                    self.status.send_replace(ProviderStatus::ready());
                    log::info!("embedding model {} ready", self.descriptor.model);
                }
                Ok(Ok(Err(e))) => self.fail(e),
                Ok(Err(e)) => self.fail(EmbeddingError::InitFailed(e.to_string())),
                Err(_) => self.fail(EmbeddingError::DownloadTimeout(download_timeout.as_secs())),
            }
        });
    }

    fn fail(&self, error: EmbeddingError) {
        log::error!("embedding model {}: {error}", self.descriptor.model);
        self.status.send_modify(|status| {
            status.download_progress = 0.0;
            status.is_ready = false;
            status.error = Some(error.to_string());
        });
    }

    fn set_generating(&self, delta: isize) {
        self.status.send_if_modified(|status| {
            let in_flight = if delta > 0 {
                self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1
            };
            let was = status.is_generating;
            status.is_generating = in_flight > 0;
            was != status.is_generating
        });
    }
}

#[async_trait]
impl EmbeddingProvider for FastembedProvider {
    fn status(&self) -> watch::Receiver<ProviderStatus> {
        self.status.subscribe()
    }

    async fn forward(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let model = self.model.get().cloned().ok_or(EmbeddingError::Unavailable)?;
        let text = text.to_string();

        self.set_generating(1);
        let result = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().map_err(|e| {
                EmbeddingError::Failed(format!("Failed to acquire model lock: {}", e))
            })?;

            model
                .embed(vec![text], None)
                .map_err(|e| EmbeddingError::Failed(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| EmbeddingError::Failed("No embedding returned".to_string()))
        })
        .await;
        self.set_generating(-1);

        result.map_err(|e| EmbeddingError::Failed(e.to_string()))?
    }
}

fn load_model(
    model_enum: fastembed::EmbeddingModel,
    models_dir: PathBuf,
) -> Result<TextEmbedding, EmbeddingError> {
    std::fs::create_dir_all(&models_dir).map_err(|e| {
        EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
    })?;

    let options = InitOptions::new(model_enum)
        .with_cache_dir(models_dir)
        .with_show_download_progress(true);

    TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
}

/// Parse model name string to fastembed enum.
pub fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-small-en-v1.5-q" | "bgesmallenv15q" => Ok(fastembed::EmbeddingModel::BGESmallENV15Q),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
        "multilingual-e5-small" | "multilinguale5small" => {
            Ok(fastembed::EmbeddingModel::MultilingualE5Small)
        }
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small (add -q suffix for quantized English models)",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_name() {
        assert!(matches!(
            parse_model_name("All-MiniLM-L6-v2"),
            Ok(fastembed::EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            parse_model_name("bgesmallenv15q"),
            Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
        ));
        assert!(matches!(
            parse_model_name("nonexistent-model"),
            Err(EmbeddingError::InvalidModel(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_model_reports_error() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = FastembedFactory::new(tmp.path().to_path_buf(), Duration::from_secs(5));

        let provider = factory.configure(&ModelDescriptor::new("nonexistent-model", 0));
        let mut status = provider.status();
        let status = status
            .wait_for(|status| status.error.is_some())
            .await
            .unwrap()
            .clone();

        assert!(!status.is_ready);
        assert!(status.error.unwrap().contains("Unknown model"));
        assert!(matches!(
            provider.forward("hello").await,
            Err(EmbeddingError::Unavailable)
        ));
    }

    #[test]
    fn test_cache_key_selects_models_dir() {
        let descriptor = ModelDescriptor::new("All-MiniLM-L6-v2", 3);
        let dir = models_dir(Path::new("/data"), &descriptor);
        assert_eq!(dir, PathBuf::from("/data/models/all-minilm-l6-v2-3"));
    }

    #[test]
    fn test_discard_removes_only_that_cache_key() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = FastembedFactory::new(tmp.path().to_path_buf(), Duration::from_secs(5));

        let old = ModelDescriptor::new("all-MiniLM-L6-v2", 0);
        let current = old.cache_busted();
        for descriptor in [&old, &current] {
            let dir = models_dir(tmp.path(), descriptor);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("model.onnx.part"), b"partial").unwrap();
        }

        factory.discard(&old);
        factory.discard(&old);

        assert!(!models_dir(tmp.path(), &old).exists());
        assert!(models_dir(tmp.path(), &current).exists());
    }

    // Integration tests require model download - run with --ignored
    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires model download"]
    async fn test_embedding_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = FastembedFactory::new(tmp.path().to_path_buf(), Duration::from_secs(300));

        let provider = factory.configure(&ModelDescriptor::new("all-MiniLM-L6-v2", 0));
        provider
            .status()
            .wait_for(|status| status.is_ready)
            .await
            .unwrap();

        let embedding = provider.forward("Hello, world!").await.unwrap();
        assert_eq!(embedding.len(), 384); // MiniLM produces 384-dim embeddings

        // Check that values are normalized (L2 norm ~= 1)
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }
}
