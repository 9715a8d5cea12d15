//! Background backfill of missing row vectors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::lifecycle::EmbeddingLifecycle;
use crate::rows::EntityKind;
use crate::store::RowStore;

pub const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindReport {
    pub fetched: usize,
    pub processed: usize,
    pub errors: usize,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub errors: usize,
    pub kinds: BTreeMap<EntityKind, KindReport>,
    /// The model stopped being ready mid-sweep; remaining rows were left
    /// for the next sweep.
    pub interrupted: bool,
}

/// Running totals across sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub total_processed: u64,
    pub total_errors: u64,
    pub sweeps: u64,
    pub running: bool,
}

pub struct IndexingSweeper {
    lifecycle: Arc<EmbeddingLifecycle>,
    store: Arc<dyn RowStore>,
    kinds: Vec<EntityKind>,
    batch_size: usize,
    running: AtomicBool,
    total_processed: AtomicU64,
    total_errors: AtomicU64,
    sweeps: AtomicU64,
}

/// Clears the single-flight flag even when a sweep is dropped midway.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IndexingSweeper {
    pub fn new(
        lifecycle: Arc<EmbeddingLifecycle>,
        store: Arc<dyn RowStore>,
        kinds: Vec<EntityKind>,
        batch_size: usize,
    ) -> Self {
        Self {
            lifecycle,
            store,
            kinds,
            batch_size,
            running: AtomicBool::new(false),
            total_processed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SweepStats {
        SweepStats {
            total_processed: self.total_processed.load(Ordering::SeqCst),
            total_errors: self.total_errors.load(Ordering::SeqCst),
            sweeps: self.sweeps.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Embed and store up to one batch of unindexed rows per kind.
    ///
    /// Returns `None` without doing anything when another sweep is running.
    /// A row that fails to embed or persist is counted and skipped; it stays
    /// unindexed until a later sweep.
    pub async fn sweep(&self) -> Option<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("sweep already running, skipping");
            return None;
        }
        let _running = RunningGuard(&self.running);

        let now = Instant::now();
        let mut report = SweepReport::default();

        'kinds: for &kind in &self.kinds {
            let kind_report = report.kinds.entry(kind).or_default();

            let rows = match self.store.missing_vectors(kind, self.batch_size).await {
                Ok(rows) => rows,
                Err(e) => {
                    log::error!("failed to fetch unindexed {kind} rows: {e}");
                    continue;
                }
            };
            kind_report.fetched = rows.len();

            for row in rows {
                if !self.lifecycle.is_ready() {
                    log::info!("embedding model no longer ready, stopping sweep");
                    report.interrupted = true;
                    break 'kinds;
                }

                let Some(text) = row.embedding_text() else {
                    continue;
                };

                let Some(vector) = self.lifecycle.embed(&text).await else {
                    log::warn!("no vector produced for {kind} {}", row.id);
                    kind_report.errors += 1;
                    continue;
                };

                match self.store.set_vector(&row, vector).await {
                    Ok(()) => kind_report.processed += 1,
                    Err(e) => {
                        log::warn!("failed to store vector for {kind} {}: {e}", row.id);
                        kind_report.errors += 1;
                    }
                }
            }
        }

        report.processed = report.kinds.values().map(|k| k.processed).sum();
        report.errors = report.kinds.values().map(|k| k.errors).sum();

        self.total_processed
            .fetch_add(report.processed as u64, Ordering::SeqCst);
        self.total_errors
            .fetch_add(report.errors as u64, Ordering::SeqCst);
        self.sweeps.fetch_add(1, Ordering::SeqCst);

        log::info!(
            "sweep indexed {} rows with {} errors in {}ms",
            report.processed,
            report.errors,
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Some(report)
    }

    /// Sweep every time the embedding model becomes ready.
    pub fn spawn_on_ready(self: &Arc<Self>) -> JoinHandle<()> {
        let sweeper = self.clone();
        let mut state_rx = self.lifecycle.subscribe();

        tokio::spawn(async move {
            let mut was_ready = false;
            loop {
                let is_ready = state_rx.borrow_and_update().is_ready;
                if is_ready && !was_ready {
                    sweeper.sweep().await;
                }
                was_ready = is_ready;

                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
