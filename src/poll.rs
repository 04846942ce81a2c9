//! Polling loop that waits for new units to appear remotely.
//!
//! An explicit state machine instead of a recursive sleep loop: the clock
//! is injectable, so the loop is testable without real wall-clock waits,
//! and cancellation takes effect at state-transition boundaries while
//! in-flight fetches finish naturally.

use crate::checkpoint::CheckpointLog;
use crate::orchestrator::{SyncError, SyncOrchestrator, SyncReport};
use crate::probe::latest_remote_unit;
use crate::record::Category;
use crate::session::SessionFactory;
use crate::state::{LocalState, Sink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Not started yet.
    Idle,
    /// Asking the remote for its newest unit.
    Probing,
    /// Fetching a missing range.
    Syncing,
    /// Sleeping until the next probe.
    Waiting,
    /// New units were found and synced.
    Done,
    /// The wall-clock ceiling elapsed with nothing new — a clean stop so an
    /// external scheduler can re-invoke the process.
    TimedOut,
}

/// Time source the loop runs on.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
    /// Sleeps for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of one [`PollLoop::run`].
#[derive(Debug)]
pub struct PollOutcome {
    /// Final state the loop stopped in.
    pub state: PollState,
    /// Reports of every sync performed, one per category with new units.
    pub reports: Vec<(Category, SyncReport)>,
    /// Number of probe ticks taken.
    pub ticks: u32,
}

/// Repeatedly probes for new units and syncs them when they appear.
pub struct PollLoop<F, S, C> {
    orchestrator: SyncOrchestrator<F>,
    factory: Arc<F>,
    store: Arc<S>,
    clock: C,
    categories: Vec<Category>,
    checkpoint: CheckpointLog,
    stop: Arc<AtomicBool>,
    state: PollState,
}

impl<F, S> PollLoop<F, S, SystemClock>
where
    F: SessionFactory + 'static,
    S: Sink + LocalState,
{
    /// Loop over `categories`, probing through `factory` and persisting to
    /// `store`, on the system clock.
    pub fn new(
        orchestrator: SyncOrchestrator<F>,
        factory: Arc<F>,
        store: Arc<S>,
        categories: Vec<Category>,
    ) -> Self {
        Self {
            orchestrator,
            factory,
            store,
            clock: SystemClock,
            categories,
            checkpoint: CheckpointLog::in_memory(),
            stop: Arc::new(AtomicBool::new(false)),
            state: PollState::Idle,
        }
    }
}

impl<F, S, C> PollLoop<F, S, C>
where
    F: SessionFactory + 'static,
    S: Sink + LocalState,
    C: Clock,
{
    /// Swaps in a different time source (a fake clock in tests).
    pub fn with_clock<C2: Clock>(self, clock: C2) -> PollLoop<F, S, C2> {
        PollLoop {
            orchestrator: self.orchestrator,
            factory: self.factory,
            store: self.store,
            clock,
            categories: self.categories,
            checkpoint: self.checkpoint,
            stop: self.stop,
            state: self.state,
        }
    }

    /// Shares an external stop flag, honored at state-transition boundaries.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Uses a durable checkpoint log for the syncs the loop performs.
    pub fn with_checkpoint(mut self, checkpoint: CheckpointLog) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Current state, for observability.
    pub fn state(&self) -> PollState {
        self.state
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Runs until new units are synced (`Done`), the ceiling elapses
    /// (`TimedOut`), or the stop flag is raised.
    pub async fn run(&mut self) -> Result<PollOutcome, SyncError> {
        let controls = *self.orchestrator.controls();
        let probe_policy = controls.probe_policy();
        let started = self.clock.now();
        let mut reports = Vec::new();
        let mut ticks = 0u32;

        loop {
            if self.stop_requested() {
                info!(state = ?self.state, "stop requested, leaving poll loop");
                break;
            }
            if self.clock.now().saturating_duration_since(started) >= controls.max_wait() {
                info!(ticks, "poll ceiling reached without new units");
                self.state = PollState::TimedOut;
                break;
            }

            self.state = PollState::Probing;
            ticks += 1;
            let mut plans = Vec::new();
            for &category in &self.categories {
                let local = self.store.latest_known_unit(category).await?;
                match latest_remote_unit(self.factory.as_ref(), category, &probe_policy).await {
                    Ok(remote) if remote > local => {
                        info!(%category, local, remote, "new units published");
                        plans.push((category, local + 1, remote));
                    }
                    Ok(remote) => {
                        debug!(%category, local, remote, "already up to date");
                    }
                    // A failed probe is "no update this tick", not the end
                    // of the loop.
                    Err(err) => {
                        warn!(%category, error = %err, "probe failed, waiting for next tick");
                    }
                }
            }

            if plans.is_empty() {
                self.state = PollState::Waiting;
                if self.stop_requested() {
                    break;
                }
                self.clock.sleep(controls.poll_interval()).await;
                continue;
            }

            self.state = PollState::Syncing;
            for (category, start, end) in plans {
                let report = self
                    .orchestrator
                    .sync_range(category, start, end, self.store.as_ref(), &mut self.checkpoint)
                    .await?;
                report.report(category);
                reports.push((category, report));
            }
            self.state = PollState::Done;
            break;
        }

        Ok(PollOutcome {
            state: self.state,
            reports,
            ticks,
        })
    }
}
