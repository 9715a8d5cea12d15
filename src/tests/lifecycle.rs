use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::semantic::{
    EmbeddingLifecycle, LifecycleSettings, LifecycleState, ModelDescriptor, Phase, ProviderStatus,
};
use crate::tests::fakes::{fake_vector, FakeFactory};

pub fn start(factory: &Arc<FakeFactory>) -> Arc<EmbeddingLifecycle> {
    let settings = LifecycleSettings::new(ModelDescriptor::new("fake-model", 0));
    Arc::new(EmbeddingLifecycle::start(factory.clone(), settings))
}

pub async fn wait_for(
    lifecycle: &EmbeddingLifecycle,
    predicate: impl FnMut(&LifecycleState) -> bool,
) -> LifecycleState {
    let mut state_rx = lifecycle.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(3600), state_rx.wait_for(predicate))
        .await
        .expect("lifecycle state not reached")
        .unwrap()
        .clone();
    state
}

pub async fn wait_for_ready(lifecycle: &EmbeddingLifecycle) -> LifecycleState {
    wait_for(lifecycle, |state| state.is_ready).await
}

/// Records every phase the lifecycle passes through.
fn record_phases(lifecycle: &EmbeddingLifecycle) -> Arc<Mutex<Vec<Phase>>> {
    let phases = Arc::new(Mutex::new(vec![]));
    let mut state_rx = lifecycle.subscribe();

    tokio::spawn({
        let phases = phases.clone();
        async move {
            loop {
                let phase = state_rx.borrow_and_update().phase;
                {
                    let mut phases = phases.lock().unwrap();
                    if phases.last() != Some(&phase) {
                        phases.push(phase);
                    }
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    });

    phases
}

#[tokio::test(start_paused = true)]
async fn test_stalled_download_retries_three_times_then_fails() {
    let factory = Arc::new(FakeFactory::stalling());
    let started = tokio::time::Instant::now();
    let lifecycle = start(&factory);
    let phases = record_phases(&lifecycle);

    let state = wait_for(&lifecycle, |state| state.phase == Phase::Failed).await;

    assert_eq!(state.retry_count, 3);
    assert!(!state.is_ready);
    assert!(state.last_error.is_some());

    // four stall windows plus three cool-downs
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(4 * 120 + 3 * 2), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(500), "{elapsed:?}");

    // initial provider plus one per retry, each under a fresh cache key
    let cache_keys: Vec<u32> = factory.descriptors().iter().map(|d| d.cache_key).collect();
    assert_eq!(cache_keys, vec![0, 1, 2, 3]);

    // every replaced download is cleaned up, the last one is kept
    let discarded: Vec<u32> = factory.discarded().iter().map(|d| d.cache_key).collect();
    assert_eq!(discarded, vec![0, 1, 2]);

    let timeouts = phases
        .lock()
        .unwrap()
        .iter()
        .filter(|phase| **phase == Phase::TimedOut)
        .count();
    assert_eq!(timeouts, 3);

    // failed is terminal
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(factory.configured(), 4);
    assert_eq!(lifecycle.state().phase, Phase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_when_download_succeeds() {
    let factory = Arc::new(FakeFactory::ready_from(2));
    let lifecycle = start(&factory);

    let state = wait_for_ready(&lifecycle).await;
    assert_eq!(state.phase, Phase::Ready);
    assert_eq!(state.retry_count, 2);
    assert_eq!(state.download_progress, 1.0);
    assert_eq!(factory.configured(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_download_finishing_in_time_is_not_retried() {
    let factory = Arc::new(FakeFactory::stalling());
    let lifecycle = start(&factory);

    let state = wait_for(&lifecycle, |state| state.phase == Phase::Downloading).await;
    assert!(state.download_progress > 0.0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    factory.provider(0).set_status(ProviderStatus::downloading(0.9));
    tokio::time::sleep(Duration::from_secs(50)).await;
    factory.provider(0).set_status(ProviderStatus::ready());

    wait_for_ready(&lifecycle).await;
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(factory.configured(), 1);
    assert_eq!(lifecycle.state().retry_count, 0);
    assert_eq!(lifecycle.state().phase, Phase::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_provider_error_is_surfaced_without_retry() {
    let factory = Arc::new(FakeFactory::ready());
    let lifecycle = start(&factory);
    wait_for_ready(&lifecycle).await;

    factory.provider(0).set_status(ProviderStatus {
        error: Some("disk full".to_string()),
        ..Default::default()
    });

    let state = wait_for(&lifecycle, |state| state.last_error.is_some()).await;
    assert_eq!(state.last_error.as_deref(), Some("disk full"));
    assert!(!state.is_ready);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(factory.configured(), 1);
    assert_eq!(lifecycle.state().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_retry_resets_retry_budget() {
    let factory = Arc::new(FakeFactory::stalling());
    let lifecycle = start(&factory);
    wait_for(&lifecycle, |state| state.phase == Phase::Failed).await;

    lifecycle.manual_retry();

    let state = lifecycle.state();
    assert_eq!(state.phase, Phase::Downloading);
    assert_eq!(state.retry_count, 0);
    assert!(state.last_error.is_none());
    assert_eq!(lifecycle.descriptor().cache_key, 4);
    assert_eq!(factory.discarded().last().map(|d| d.cache_key), Some(3));

    // a fresh budget of three automatic retries
    wait_for(&lifecycle, |state| state.phase == Phase::Failed).await;
    assert_eq!(factory.configured(), 8);
}

#[tokio::test]
async fn test_manual_retry_cancels_in_flight_embed() {
    let factory = Arc::new(FakeFactory::ready().hanging_until(1));
    let lifecycle = start(&factory);
    wait_for_ready(&lifecycle).await;

    let pending = tokio::spawn({
        let lifecycle = lifecycle.clone();
        async move { lifecycle.embed("trail shoes").await }
    });
    wait_for(&lifecycle, |state| state.is_generating).await;

    lifecycle.manual_retry();
    assert_eq!(pending.await.unwrap(), None);
    assert!(!lifecycle.state().is_generating);

    wait_for_ready(&lifecycle).await;
    assert_eq!(
        lifecycle.embed("trail shoes").await,
        Some(fake_vector("trail shoes"))
    );
}

#[tokio::test]
async fn test_embed_fails_soft() {
    let factory = Arc::new(FakeFactory::ready().failing_on("broken"));
    let lifecycle = start(&factory);
    wait_for_ready(&lifecycle).await;

    assert_eq!(lifecycle.embed("").await, None);
    assert_eq!(lifecycle.embed("  \n").await, None);
    assert_eq!(factory.calls(), 0);

    assert_eq!(lifecycle.embed("broken").await, None);
    assert_eq!(factory.calls(), 1);

    // input is trimmed before it reaches the provider
    assert_eq!(lifecycle.embed(" hat ").await, Some(fake_vector("hat")));
}

#[tokio::test]
async fn test_embed_before_ready_skips_provider() {
    let factory = Arc::new(FakeFactory::stalling());
    let lifecycle = start(&factory);

    assert_eq!(lifecycle.embed("trail shoes").await, None);
    assert_eq!(factory.calls(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_serving() {
    let factory = Arc::new(FakeFactory::ready());
    let lifecycle = start(&factory);
    wait_for_ready(&lifecycle).await;

    lifecycle.shutdown();

    let state = lifecycle.state();
    assert_eq!(state.phase, Phase::Idle);
    assert!(!state.is_ready);
    assert_eq!(lifecycle.embed("trail shoes").await, None);
}
