use std::sync::Arc;
use std::time::Duration;

use crate::app::{AppContext, AppFactory, AppPaths};
use crate::config::Config;
use crate::rows::{EntityKind, RowCreate};
use crate::semantic::{
    EmbeddingProvider, ModelDescriptor, Phase, ProviderFactory, ProviderStatus,
};
use crate::tests::fakes::FakeFactory;

/// Creates an isolated AppContext using a unique temp directory.
pub fn create_app(factory: &Arc<FakeFactory>) -> (AppContext, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let app = AppFactory::create_context_with(
        &AppPaths::new(tmp.path()),
        Config::default(),
        factory.clone(),
    )
    .expect("failed to create app context");
    (app, tmp)
}

fn add_row(app: &AppContext, kind: EntityKind, title: &str) {
    app.store()
        .create(RowCreate {
            kind,
            type_tag: Some("product".to_string()),
            title: title.to_string(),
            description: None,
        })
        .unwrap();
}

#[tokio::test]
async fn test_background_indexing_after_model_is_ready() {
    let factory = Arc::new(FakeFactory::stalling());
    let (app, _tmp) = create_app(&factory);

    add_row(&app, EntityKind::Node, "Trail Shoes");
    add_row(&app, EntityKind::Actor, "Ada");
    app.spawn_background_indexing();
    app.spawn_background_indexing();

    assert!(app.search().search("shoes", 5).await.is_empty());

    factory.provider(0).set_status(ProviderStatus::ready());
    assert_eq!(app.wait_for_model().await.phase, Phase::Ready);

    tokio::time::timeout(Duration::from_secs(5), async {
        while app.status().unwrap().store.indexed < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("rows were not indexed");

    let status = app.status().unwrap();
    assert_eq!(status.sweeper.sweeps, 1);
    assert_eq!(status.sweeper.total_processed, 2);
    assert_eq!(status.model.model, Config::default().semantic_search.model);

    let results = app.search().search("shoes", 5).await;
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_shutdown_disables_search() {
    let factory = Arc::new(FakeFactory::ready());
    let (app, _tmp) = create_app(&factory);
    app.wait_for_model().await;

    add_row(&app, EntityKind::Node, "Trail Shoes");
    app.sweeper().sweep().await.unwrap();

    app.shutdown();

    assert_eq!(app.status().unwrap().lifecycle.phase, Phase::Idle);
    assert!(app.search().search("shoes", 5).await.is_empty());
}

#[tokio::test]
async fn test_store_is_locked_per_context() {
    let factory = Arc::new(FakeFactory::ready());
    let (_app, tmp) = create_app(&factory);

    let second = AppFactory::create_context_with(
        &AppPaths::new(tmp.path()),
        Config::default(),
        factory.clone(),
    );
    assert!(second.is_err());
}

/// Starts a model load on the blocking pool that outlives the test, like a
/// download stuck on a dead connection.
struct BlockingLoadFactory {
    load: Duration,
    inner: FakeFactory,
}

impl ProviderFactory for BlockingLoadFactory {
    fn configure(&self, descriptor: &ModelDescriptor) -> Arc<dyn EmbeddingProvider> {
        let load = self.load;
        tokio::task::spawn_blocking(move || std::thread::sleep(load));
        self.inner.configure(descriptor)
    }
}

#[test]
fn test_exit_does_not_wait_for_a_blocked_model_load() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = AppPaths::new(tmp.path());
    let started = std::time::Instant::now();

    crate::block_on(async move {
        let factory = Arc::new(BlockingLoadFactory {
            load: Duration::from_secs(60),
            inner: FakeFactory::stalling(),
        });
        let app = AppFactory::create_context_with(&paths, Config::default(), factory)?;
        add_row(&app, EntityKind::Node, "Trail Shoes");
        app.shutdown();
        Ok::<_, anyhow::Error>(())
    })
    .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(30), "{elapsed:?}");
}
