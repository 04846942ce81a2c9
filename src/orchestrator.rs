//! Range synchronization across a small, bounded worker pool.

use crate::checkpoint::{CheckpointEntry, CheckpointLog};
use crate::controls::SyncControls;
use crate::extract::Extraction;
use crate::fetcher::{FetchError, UnitFetcher};
use crate::record::{Category, StoreRecord};
use crate::session::SessionFactory;
use crate::state::{persist_with_fallback, Sink, StoreError};
use futures_util::future::join_all;
use std::error::Error;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// A sync run that could not make any progress at all.
#[derive(Debug)]
pub enum SyncError {
    /// Not a single worker session could be created at startup.
    NoSessions(FetchError),
    /// The checkpoint log could not be appended to.
    Checkpoint(io::Error),
    /// The durable store failed a read.
    Store(StoreError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSessions(err) => write!(f, "no remote session could be created: {err}"),
            Self::Checkpoint(err) => write!(f, "checkpoint write failed: {err}"),
            Self::Store(err) => write!(f, "store read failed: {err}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NoSessions(err) => Some(err),
            Self::Checkpoint(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// What a sync run did, unit by unit and record by record.
///
/// A non-empty `failed_units` list is a normal, reportable outcome, never a
/// crash; failed units stay eligible for a future run. Record order follows
/// worker completion, which under concurrency is not unit order.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Every record extracted during the run, in completion order.
    pub records: Vec<StoreRecord>,
    /// Units that still had no listing after retries, ascending.
    pub failed_units: Vec<u32>,
    /// Units scheduled for this run (after checkpoint skips).
    pub units_attempted: usize,
    /// Units whose listing was fetched and extracted.
    pub units_succeeded: usize,
    /// Records newly appended by the sink.
    pub records_persisted: usize,
    /// Records the sink skipped as already-known facts.
    pub records_skipped: usize,
    /// Extraction candidates dropped for missing identity fields.
    pub records_dropped: usize,
    /// Records that could not be persisted even individually.
    pub records_lost: usize,
}

impl SyncReport {
    /// Units that failed permanently this run.
    pub fn units_failed(&self) -> usize {
        self.failed_units.len()
    }

    /// Logs the run counters at info level.
    pub fn report(&self, category: Category) {
        info!(
            %category,
            attempted = self.units_attempted,
            succeeded = self.units_succeeded,
            failed = self.units_failed(),
            persisted = self.records_persisted,
            skipped = self.records_skipped,
            dropped = self.records_dropped,
            lost = self.records_lost,
            "sync run finished"
        );
        if !self.failed_units.is_empty() {
            let shown: Vec<u32> = self.failed_units.iter().copied().take(5).collect();
            warn!(
                failed = self.failed_units.len(),
                first = ?shown,
                "some units failed this run and stay eligible for the next"
            );
        }
    }
}

struct UnitOutcome {
    unit: u32,
    result: Result<Extraction, FetchError>,
}

/// Schedules unit fetches across workers and aggregates their results.
///
/// Each worker owns exactly one session for its lifetime; the checkpoint
/// log and the result accumulator have a single writer (the aggregator on
/// the calling task), fed over a channel.
pub struct SyncOrchestrator<F> {
    factory: Arc<F>,
    controls: SyncControls,
    stop: Arc<AtomicBool>,
}

impl<F: SessionFactory + 'static> SyncOrchestrator<F> {
    /// Orchestrator drawing sessions from `factory` under `controls`.
    pub fn new(factory: Arc<F>, controls: SyncControls) -> Self {
        Self {
            factory,
            controls,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares an external stop flag; workers stop pulling new units once it
    /// is set, letting in-flight fetches finish naturally.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// The controls this orchestrator runs under.
    pub fn controls(&self) -> &SyncControls {
        &self.controls
    }

    /// Fetches every unit in `[start, end]` not yet settled in `checkpoint`,
    /// persisting extracted records to `sink` as the run progresses.
    pub async fn sync_range<S>(
        &self,
        category: Category,
        start: u32,
        end: u32,
        sink: &S,
        checkpoint: &mut CheckpointLog,
    ) -> Result<SyncReport, SyncError>
    where
        S: Sink + ?Sized,
    {
        let units: Vec<u32> = (start..=end)
            .filter(|&unit| !checkpoint.is_done(category, unit))
            .collect();

        let mut report = SyncReport {
            units_attempted: units.len(),
            ..SyncReport::default()
        };
        if units.is_empty() {
            return Ok(report);
        }

        let worker_count = self.controls.workers().clamp(1, 5).min(units.len());
        info!(
            %category,
            start,
            end,
            scheduled = units.len(),
            workers = worker_count,
            "starting sync run"
        );

        let units = Arc::new(units);
        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel::<UnitOutcome>(self.controls.checkpoint_interval());

        let mut handles = Vec::with_capacity(worker_count);
        let mut last_create_error = None;
        for worker_id in 0..worker_count {
            let mut fetcher = UnitFetcher::new(
                Arc::clone(&self.factory),
                category,
                self.controls.retry_policy(),
            );
            // Connect eagerly: a run where no session exists at all is a
            // setup failure, not a string of per-unit soft failures.
            if let Err(err) = fetcher.connect().await {
                warn!(worker = worker_id, error = %err, "worker session could not be created");
                last_create_error = Some(err);
                continue;
            }
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                fetcher,
                Arc::clone(&units),
                Arc::clone(&cursor),
                Arc::clone(&self.stop),
                self.controls.politeness_delay(),
                self.controls.long_pause_every(),
                self.controls.long_pause(),
                tx.clone(),
            )));
        }
        drop(tx);

        if handles.is_empty() {
            let err = last_create_error.unwrap_or(FetchError::Create(
                crate::session::SessionError::Connect("no workers requested".into()),
            ));
            return Err(SyncError::NoSessions(err));
        }

        // Single-writer aggregation: checkpoint appends, the accumulator,
        // and sink flushes all happen here.
        let mut flushed = 0usize;
        let mut processed = 0usize;
        while let Some(outcome) = rx.recv().await {
            processed += 1;
            match outcome.result {
                Ok(extraction) => {
                    report.units_succeeded += 1;
                    report.records_dropped += extraction.dropped;
                    report.records.extend(extraction.records);
                    checkpoint
                        .record(CheckpointEntry {
                            unit: outcome.unit,
                            category,
                            ok: true,
                        })
                        .map_err(SyncError::Checkpoint)?;
                }
                Err(err) => {
                    warn!(unit = outcome.unit, error = %err, "unit failed for this run");
                    report.failed_units.push(outcome.unit);
                    checkpoint
                        .record(CheckpointEntry {
                            unit: outcome.unit,
                            category,
                            ok: false,
                        })
                        .map_err(SyncError::Checkpoint)?;
                }
            }

            if processed % self.controls.checkpoint_interval() == 0 {
                let flush = persist_with_fallback(sink, &report.records[flushed..]).await;
                flushed = report.records.len();
                report.records_persisted += flush.written;
                report.records_skipped += flush.duplicates;
                report.records_lost += flush.lost;
                debug!(
                    processed,
                    written = flush.written,
                    "interval flush to sink"
                );
            }
        }

        for joined in join_all(handles).await {
            if joined.is_err() {
                warn!("worker task panicked");
            }
        }

        let flush = persist_with_fallback(sink, &report.records[flushed..]).await;
        report.records_persisted += flush.written;
        report.records_skipped += flush.duplicates;
        report.records_lost += flush.lost;

        let unprocessed = report.units_attempted - processed;
        if unprocessed > 0 {
            // Every worker exited before the range was drained (lost
            // sessions or a stop request); the units carry no checkpoint
            // entry and will be picked up by the next run.
            warn!(unprocessed, "run ended with units left unattempted");
        }

        report.failed_units.sort_unstable();
        Ok(report)
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<F: SessionFactory + 'static>(
    worker_id: usize,
    mut fetcher: UnitFetcher<F>,
    units: Arc<Vec<u32>>,
    cursor: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    politeness: Duration,
    long_pause_every: u32,
    long_pause: Duration,
    tx: mpsc::Sender<UnitOutcome>,
) {
    let mut fetched = 0u32;
    loop {
        if stop.load(Ordering::Acquire) {
            debug!(worker = worker_id, "stop requested, worker winding down");
            break;
        }
        let index = cursor.fetch_add(1, Ordering::AcqRel);
        let Some(&unit) = units.get(index) else {
            break;
        };

        let result = fetcher.fetch(unit).await;
        let session_gone = matches!(&result, Err(err) if err.is_create());
        if tx.send(UnitOutcome { unit, result }).await.is_err() {
            break;
        }
        if session_gone {
            warn!(worker = worker_id, "worker lost its session for good, exiting");
            break;
        }

        fetched += 1;
        if !politeness.is_zero() {
            sleep(politeness).await;
        }
        if long_pause_every > 0 && fetched % long_pause_every == 0 && !long_pause.is_zero() {
            debug!(worker = worker_id, fetched, "long rest to ease remote load");
            sleep(long_pause).await;
        }
    }
    fetcher.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Category;
    use crate::session::{RemoteSession, SessionError};
    use crate::state::{LocalState, MemoryStore};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn listing(unit: u32, stores: usize) -> String {
        (0..stores)
            .map(|n| {
                format!(
                    r#"<div class="store-box" data-ltshpid="shp-{unit}-{n}">
                         <span class="store-num">{}</span>
                         <strong class="store-loc">판매점 {unit}-{n}</strong>
                         <em class="draw-rank">1등</em>
                       </div>"#,
                    n + 1
                )
            })
            .collect()
    }

    struct ScriptedSession {
        unit: Option<u32>,
        fail_units: Arc<HashSet<u32>>,
        fetch_order: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn select_category(&mut self, _category: Category) -> Result<(), SessionError> {
            Ok(())
        }

        async fn select_unit(&mut self, unit: u32) -> Result<(), SessionError> {
            self.unit = Some(unit);
            Ok(())
        }

        async fn refresh_listing(&mut self) -> Result<(), SessionError> {
            let unit = self.unit.unwrap_or(0);
            self.fetch_order.lock().expect("order lock").push(unit);
            if self.fail_units.contains(&unit) {
                return Err(SessionError::ElementWait {
                    selector: ".store-box",
                    waited: Duration::from_secs(15),
                });
            }
            Ok(())
        }

        async fn fetch_document(&mut self) -> Result<String, SessionError> {
            Ok(self.unit.map(|unit| listing(unit, 2)).unwrap_or_default())
        }

        async fn close(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct ScriptedFactory {
        fail_units: Arc<HashSet<u32>>,
        fetch_order: Arc<Mutex<Vec<u32>>>,
    }

    impl ScriptedFactory {
        fn new(fail_units: impl IntoIterator<Item = u32>) -> Self {
            Self {
                fail_units: Arc::new(fail_units.into_iter().collect()),
                fetch_order: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn create(&self) -> Result<Box<dyn RemoteSession>, SessionError> {
            Ok(Box::new(ScriptedSession {
                unit: None,
                fail_units: Arc::clone(&self.fail_units),
                fetch_order: Arc::clone(&self.fetch_order),
            }))
        }
    }

    fn fast_controls() -> SyncControls {
        SyncControls::default()
            .with_workers(1)
            .with_retries(3, Duration::ZERO)
            .with_politeness(Duration::ZERO)
            .with_long_pause(50, Duration::ZERO)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn single_worker_fetches_missing_range_in_order() {
        let factory = Arc::new(ScriptedFactory::new([]));
        let order = Arc::clone(&factory.fetch_order);
        let store = MemoryStore::new();
        let orchestrator = SyncOrchestrator::new(factory, fast_controls());

        let mut checkpoint = CheckpointLog::in_memory();
        let report = orchestrator
            .sync_range(Category::Lotto645, 1207, 1209, &store, &mut checkpoint)
            .await
            .expect("sync succeeds");

        assert_eq!(report.units_attempted, 3);
        assert_eq!(report.units_succeeded, 3);
        assert!(report.failed_units.is_empty());
        assert_eq!(report.records_persisted, 6);
        assert_eq!(store.len(), 6);
        assert_eq!(*order.lock().expect("order"), vec![1207, 1208, 1209]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_unit_does_not_block_later_units() {
        let factory = Arc::new(ScriptedFactory::new([1208]));
        let store = MemoryStore::new();
        let orchestrator = SyncOrchestrator::new(factory, fast_controls());

        let mut checkpoint = CheckpointLog::in_memory();
        let report = orchestrator
            .sync_range(Category::Lotto645, 1207, 1210, &store, &mut checkpoint)
            .await
            .expect("sync succeeds");

        assert_eq!(report.failed_units, vec![1208]);
        assert_eq!(report.units_succeeded, 3);
        // 1209 and 1210 were still fetched and persisted.
        assert_eq!(
            store.latest_known_unit(Category::Lotto645).await.expect("latest"),
            1210
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn resynced_range_skips_known_facts() {
        let factory = Arc::new(ScriptedFactory::new([]));
        let store = MemoryStore::new();
        let orchestrator = SyncOrchestrator::new(factory, fast_controls());

        let mut first_run = CheckpointLog::in_memory();
        orchestrator
            .sync_range(Category::Lotto645, 1207, 1208, &store, &mut first_run)
            .await
            .expect("first sync");

        // Fresh checkpoint: everything is re-fetched, nothing re-persisted.
        let mut second_run = CheckpointLog::in_memory();
        let report = orchestrator
            .sync_range(Category::Lotto645, 1207, 1208, &store, &mut second_run)
            .await
            .expect("second sync");

        assert_eq!(report.units_succeeded, 2);
        assert_eq!(report.records_persisted, 0);
        assert_eq!(report.records_skipped, 4);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkpointed_units_are_not_refetched() {
        let factory = Arc::new(ScriptedFactory::new([]));
        let order = Arc::clone(&factory.fetch_order);
        let store = MemoryStore::new();
        let orchestrator = SyncOrchestrator::new(factory, fast_controls());

        let mut checkpoint = CheckpointLog::in_memory();
        checkpoint
            .record(CheckpointEntry {
                unit: 1207,
                category: Category::Lotto645,
                ok: true,
            })
            .expect("seed checkpoint");

        let report = orchestrator
            .sync_range(Category::Lotto645, 1207, 1209, &store, &mut checkpoint)
            .await
            .expect("sync succeeds");

        assert_eq!(report.units_attempted, 2);
        assert_eq!(*order.lock().expect("order"), vec![1208, 1209]);
    }

    struct RefusingFactory;

    #[async_trait]
    impl SessionFactory for RefusingFactory {
        async fn create(&self) -> Result<Box<dyn RemoteSession>, SessionError> {
            Err(SessionError::Connect("maintenance window".into()))
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn no_sessions_at_all_is_a_setup_failure() {
        let orchestrator = SyncOrchestrator::new(Arc::new(RefusingFactory), fast_controls());
        let store = MemoryStore::new();
        let mut checkpoint = CheckpointLog::in_memory();

        let err = orchestrator
            .sync_range(Category::Lotto645, 1207, 1209, &store, &mut checkpoint)
            .await
            .expect_err("setup fails");
        assert!(matches!(err, SyncError::NoSessions(_)));
    }
}
