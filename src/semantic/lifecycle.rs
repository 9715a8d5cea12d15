//! Embedding model lifecycle.
//!
//! [`EmbeddingLifecycle`] owns the active provider and follows its status:
//!
//! ```text
//! Idle -> Downloading -> Ready
//!         Downloading -> TimedOut -> Downloading   (automatic, up to max_retries)
//!                        TimedOut -> Failed        (until manual_retry)
//! ```
//!
//! A download counts as stalled when its progress stays strictly between 0
//! and 1 for longer than the stall timeout. After a cool-down the provider is
//! reconfigured under a fresh cache key, which discards the partial download.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::provider::{EmbeddingProvider, ModelDescriptor, ProviderFactory, ProviderStatus};

pub const STALL_TIMEOUT: Duration = Duration::from_secs(120);
pub const RETRY_COOLDOWN: Duration = Duration::from_secs(2);
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub descriptor: ModelDescriptor,
    pub stall_timeout: Duration,
    pub retry_cooldown: Duration,
    pub max_retries: u32,
}

impl LifecycleSettings {
    pub fn new(descriptor: ModelDescriptor) -> Self {
        Self {
            descriptor,
            stall_timeout: STALL_TIMEOUT,
            retry_cooldown: RETRY_COOLDOWN,
            max_retries: MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Downloading,
    Ready,
    TimedOut,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Downloading => "downloading",
            Phase::Ready => "ready",
            Phase::TimedOut => "timed out",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleState {
    pub phase: Phase,
    pub is_ready: bool,
    pub is_generating: bool,
    pub download_progress: f32,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl LifecycleState {
    /// Ready, or stuck until someone calls
    /// [`EmbeddingLifecycle::manual_retry`].
    pub fn is_settled(&self) -> bool {
        self.is_ready
            || self.phase == Phase::Failed
            || (self.phase == Phase::Idle && self.last_error.is_some())
    }
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            is_ready: false,
            is_generating: false,
            download_progress: 0.0,
            retry_count: 0,
            last_error: None,
        }
    }
}

fn next_phase(current: Phase, status: &ProviderStatus) -> Phase {
    if status.is_ready {
        return Phase::Ready;
    }
    match current {
        Phase::Failed => Phase::Failed,
        _ if is_downloading(status) => Phase::Downloading,
        _ if status.error.is_some() => Phase::Idle,
        Phase::Ready => Phase::Idle,
        other => other,
    }
}

fn is_downloading(status: &ProviderStatus) -> bool {
    !status.is_ready && status.download_progress > 0.0 && status.download_progress < 1.0
}

enum Watch {
    /// The provider was swapped by a manual retry.
    Replaced,
    Stalled,
    /// The provider dropped its status channel.
    Closed,
}

struct Inner {
    factory: Arc<dyn ProviderFactory>,
    settings: LifecycleSettings,
    descriptor: Mutex<ModelDescriptor>,
    provider: RwLock<Arc<dyn EmbeddingProvider>>,
    state: watch::Sender<LifecycleState>,
    /// Bumped on every reinitialization; in-flight `embed` calls give up
    /// when it moves.
    generation: watch::Sender<u64>,
    replaced: Notify,
    in_flight: AtomicUsize,
}

impl Inner {
    fn provider(&self) -> Arc<dyn EmbeddingProvider> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut LifecycleState)) {
        self.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    fn apply_status(&self, status: &ProviderStatus) {
        self.update(|state| {
            if let Some(error) = &status.error {
                if state.last_error.as_ref() != Some(error) {
                    log::error!("embedding provider: {error}");
                    state.last_error = Some(error.clone());
                }
            }

            let phase = next_phase(state.phase, status);
            if phase != state.phase {
                log::info!("embedding model {} -> {}", state.phase, phase);
            }
            state.phase = phase;
            state.is_ready = status.is_ready;
            state.download_progress = status.download_progress.clamp(0.0, 1.0);
        });
    }

    /// Swap in a provider configured under a fresh cache key and cancel
    /// embeds running against the old one.
    fn reinitialize(&self, retry_count: u32) {
        let (previous, descriptor) = {
            let mut descriptor = self
                .descriptor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let busted = descriptor.cache_busted();
            let previous = std::mem::replace(&mut *descriptor, busted);
            (previous, descriptor.clone())
        };

        log::info!(
            "reinitializing embedding model {} (cache key {})",
            descriptor.model,
            descriptor.cache_key
        );

        let provider = self.factory.configure(&descriptor);
        *self.provider.write().unwrap_or_else(PoisonError::into_inner) = provider;
        self.generation.send_modify(|generation| *generation += 1);
        self.factory.discard(&previous);

        self.update(|state| {
            state.phase = Phase::Downloading;
            state.is_ready = false;
            state.download_progress = 0.0;
            state.retry_count = retry_count;
        });
    }

    fn track_generating(&self, started: bool) {
        self.state.send_if_modified(|state| {
            let in_flight = if started {
                self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1
            };
            let was = state.is_generating;
            state.is_generating = in_flight > 0;
            was != state.is_generating
        });
    }

    /// Mirror the current provider's status until it stalls or goes away.
    async fn watch_provider(&self, detect_stalls: bool) -> Watch {
        let mut status_rx = self.provider().status();
        let mut stall_deadline: Option<Instant> = None;

        loop {
            let status = status_rx.borrow_and_update().clone();
            self.apply_status(&status);

            if detect_stalls && is_downloading(&status) {
                stall_deadline.get_or_insert_with(|| Instant::now() + self.settings.stall_timeout);
            } else {
                stall_deadline = None;
            }

            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Watch::Closed;
                    }
                }
                _ = tokio::time::sleep_until(stall_deadline.unwrap_or_else(Instant::now)),
                    if stall_deadline.is_some() => {
                    return Watch::Stalled;
                }
                _ = self.replaced.notified() => return Watch::Replaced,
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut failed = false;

        loop {
            match self.watch_provider(!failed).await {
                Watch::Replaced => failed = false,
                Watch::Closed => {
                    log::warn!("embedding provider closed its status channel");
                    self.replaced.notified().await;
                    failed = false;
                }
                Watch::Stalled => {
                    let retry_count = self.state.borrow().retry_count;

                    if retry_count >= self.settings.max_retries {
                        log::error!(
                            "embedding model download stalled after {retry_count} retries, giving up"
                        );
                        self.update(|state| {
                            state.phase = Phase::Failed;
                            state.is_ready = false;
                            state.last_error = Some(format!(
                                "model download stalled after {retry_count} retries"
                            ));
                        });
                        failed = true;
                        continue;
                    }

                    log::warn!(
                        "embedding model download stalled for {:?}, retrying ({}/{})",
                        self.settings.stall_timeout,
                        retry_count + 1,
                        self.settings.max_retries
                    );
                    self.update(|state| state.phase = Phase::TimedOut);

                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.retry_cooldown) => {
                            self.reinitialize(retry_count + 1);
                        }
                        _ = self.replaced.notified() => {}
                    }
                }
            }
        }
    }
}

/// Handle to the embedding model. Create one per process with [`start`],
/// share it behind an `Arc`, and [`shutdown`] it on exit.
///
/// [`start`]: EmbeddingLifecycle::start
/// [`shutdown`]: EmbeddingLifecycle::shutdown
pub struct EmbeddingLifecycle {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl EmbeddingLifecycle {
    /// Configure the provider and start following its status.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(factory: Arc<dyn ProviderFactory>, settings: LifecycleSettings) -> Self {
        let descriptor = settings.descriptor.clone();
        let provider = factory.configure(&descriptor);
        let (state, _) = watch::channel(LifecycleState::default());
        let (generation, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            factory,
            settings,
            descriptor: Mutex::new(descriptor),
            provider: RwLock::new(provider),
            state,
            generation,
            replaced: Notify::new(),
            in_flight: AtomicUsize::new(0),
        });

        let supervisor = tokio::spawn(inner.clone().supervise());

        Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.borrow().is_ready
    }

    /// Descriptor of the active provider, including the current cache key.
    pub fn descriptor(&self) -> ModelDescriptor {
        self.inner
            .descriptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Embed `text`, or `None` when the model is not ready, the text is
    /// blank, the provider fails, or a reinitialization cancels the call.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if !self.is_ready() {
            log::debug!("embedding model not ready, skipping embed");
            return None;
        }

        // subscribe before picking the provider so a concurrent swap is seen
        let mut generation = self.inner.generation.subscribe();
        let provider = self.inner.provider();

        let _busy = Generating::new(&self.inner);
        tokio::select! {
            result = provider.forward(text) => match result {
                Ok(vector) if vector.is_empty() => {
                    log::warn!("embedding provider returned an empty vector");
                    None
                }
                Ok(vector) => Some(vector),
                Err(e) => {
                    log::warn!("embedding failed: {e}");
                    None
                }
            },
            _ = generation.changed() => {
                log::debug!("embed cancelled by provider reinitialization");
                None
            }
        }
    }

    /// Reset the retry budget and reinitialize the provider, from any phase.
    pub fn manual_retry(&self) {
        log::info!("manual retry of embedding model initialization");
        self.inner.reinitialize(0);
        self.inner.update(|state| state.last_error = None);
        self.inner.replaced.notify_one();
    }

    /// Stop following the provider and cancel in-flight embeds.
    pub fn shutdown(&self) {
        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }

        self.inner.generation.send_modify(|generation| *generation += 1);
        self.inner.update(|state| {
            state.phase = Phase::Idle;
            state.is_ready = false;
        });
    }
}

impl Drop for EmbeddingLifecycle {
    fn drop(&mut self) {
        if let Some(supervisor) = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }
    }
}

struct Generating<'a> {
    inner: &'a Inner,
}

impl<'a> Generating<'a> {
    fn new(inner: &'a Inner) -> Self {
        inner.track_generating(true);
        Self { inner }
    }
}

impl Drop for Generating<'_> {
    fn drop(&mut self) {
        self.inner.track_generating(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_phase() {
        let downloading = ProviderStatus::downloading(0.3);
        let idle = ProviderStatus::default();

        assert_eq!(next_phase(Phase::Idle, &downloading), Phase::Downloading);
        assert_eq!(next_phase(Phase::Idle, &idle), Phase::Idle);
        assert_eq!(next_phase(Phase::Downloading, &ProviderStatus::ready()), Phase::Ready);
        assert_eq!(next_phase(Phase::Ready, &idle), Phase::Idle);
        assert_eq!(next_phase(Phase::TimedOut, &idle), Phase::TimedOut);
    }

    #[test]
    fn test_failed_is_sticky_until_ready() {
        assert_eq!(
            next_phase(Phase::Failed, &ProviderStatus::downloading(0.9)),
            Phase::Failed
        );
        assert_eq!(next_phase(Phase::Failed, &ProviderStatus::ready()), Phase::Ready);
    }

    #[test]
    fn test_provider_error_stops_download() {
        let failed = ProviderStatus {
            error: Some("no space left on device".to_string()),
            ..Default::default()
        };
        assert_eq!(next_phase(Phase::Downloading, &failed), Phase::Idle);
        assert_eq!(next_phase(Phase::Idle, &failed), Phase::Idle);
    }

    #[test]
    fn test_is_settled() {
        let mut state = LifecycleState::default();
        assert!(!state.is_settled());

        state.last_error = Some("boom".to_string());
        assert!(state.is_settled());

        state.phase = Phase::Downloading;
        assert!(!state.is_settled());

        state.phase = Phase::Failed;
        assert!(state.is_settled());
    }

    #[test]
    fn test_progress_bounds_are_not_downloading() {
        assert!(!is_downloading(&ProviderStatus::downloading(0.0)));
        assert!(!is_downloading(&ProviderStatus::downloading(1.0)));
        assert!(is_downloading(&ProviderStatus::downloading(0.01)));
    }
}
