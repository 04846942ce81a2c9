//! Sync pacing and filtering controls shared across components.

use crate::record::Category;
use crate::retry::RetryPolicy;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Tunable knobs that bound how hard the sync leans on the remote site.
///
/// The pacing defaults are deliberate: the remote interface is stateful and
/// rate sensitive, so concurrency stays low and configurable rather than
/// auto-scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncControls {
    workers: usize,
    fetch_attempts: u32,
    retry_delay: Duration,
    politeness_delay: Duration,
    long_pause_every: u32,
    long_pause: Duration,
    checkpoint_interval: usize,
    listing_timeout: Duration,
    listing_poll: Duration,
    probe_attempts: u32,
    poll_interval: Duration,
    max_wait: Duration,
}

impl SyncControls {
    /// Parallel sessions per sync run, clamped to `1..=5` where used.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Attempts per unit fetch sequence, including the first.
    pub fn fetch_attempts(&self) -> u32 {
        self.fetch_attempts
    }

    /// Delay between retry attempts.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Delay between consecutive fetches on the same session.
    pub fn politeness_delay(&self) -> Duration {
        self.politeness_delay
    }

    /// A longer rest is inserted after this many units on one session.
    pub fn long_pause_every(&self) -> u32 {
        self.long_pause_every
    }

    /// Length of the periodic long rest.
    pub fn long_pause(&self) -> Duration {
        self.long_pause
    }

    /// Units processed between flushes to the sink and checkpoint.
    pub fn checkpoint_interval(&self) -> usize {
        self.checkpoint_interval
    }

    /// Bounded wait for the store listing to populate after a refresh.
    pub fn listing_timeout(&self) -> Duration {
        self.listing_timeout
    }

    /// Poll spacing while waiting for the listing.
    pub fn listing_poll(&self) -> Duration {
        self.listing_poll
    }

    /// Attempts per remote probe, including the first.
    pub fn probe_attempts(&self) -> u32 {
        self.probe_attempts
    }

    /// Sleep between polls while watching for new units.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wall-clock ceiling for a watch run before a clean timeout.
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Retry policy for unit fetch sequences.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.fetch_attempts, self.retry_delay)
    }

    /// Retry policy for remote probes.
    pub fn probe_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.probe_attempts, self.retry_delay)
    }

    /// Overrides the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Overrides attempts and delay for both fetch and probe retries.
    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.fetch_attempts = attempts;
        self.probe_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// Overrides the per-fetch politeness delay.
    pub fn with_politeness(mut self, delay: Duration) -> Self {
        self.politeness_delay = delay;
        self
    }

    /// Overrides the periodic long rest.
    pub fn with_long_pause(mut self, every: u32, pause: Duration) -> Self {
        self.long_pause_every = every;
        self.long_pause = pause;
        self
    }

    /// Overrides the flush interval.
    pub fn with_checkpoint_interval(mut self, interval: usize) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    /// Overrides the listing wait bounds.
    pub fn with_listing_wait(mut self, timeout: Duration, poll: Duration) -> Self {
        self.listing_timeout = timeout;
        self.listing_poll = poll;
        self
    }

    /// Overrides the watch-mode pacing.
    pub fn with_poll_timing(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval;
        self.max_wait = max_wait;
        self
    }
}

impl Default for SyncControls {
    fn default() -> Self {
        Self {
            workers: 3,
            fetch_attempts: 3,
            retry_delay: Duration::from_secs(5),
            politeness_delay: Duration::from_secs(2),
            long_pause_every: 50,
            long_pause: Duration::from_secs(10),
            checkpoint_interval: 100,
            listing_timeout: Duration::from_secs(15),
            listing_poll: Duration::from_millis(500),
            probe_attempts: 3,
            poll_interval: Duration::from_secs(600),
            max_wait: Duration::from_secs(12 * 3600),
        }
    }
}

/// Command-line interface for the sync binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "lottosync", about = "Incremental winning-store sync for dhlottery rounds")]
pub struct Cli {
    /// Output CSV path
    #[arg(long, env = "LOTTOSYNC_OUTPUT", default_value = "winning_stores.csv")]
    pub output: PathBuf,

    /// Product lines to track, comma separated
    #[arg(
        long,
        env = "LOTTOSYNC_CATEGORIES",
        value_enum,
        value_delimiter = ',',
        default_value = "lotto645"
    )]
    pub categories: Vec<Category>,

    /// First unit of an explicit backfill range
    #[arg(long)]
    pub start: Option<u32>,

    /// Last unit of an explicit backfill range (default: newest remote unit)
    #[arg(long)]
    pub end: Option<u32>,

    /// Parallel sessions (1-5); more trades ban risk for throughput
    #[arg(long, env = "LOTTOSYNC_WORKERS", default_value_t = 3)]
    pub workers: usize,

    /// Poll until new units appear instead of running once
    #[arg(long, env = "LOTTOSYNC_WATCH", default_value_t = false)]
    pub watch: bool,

    /// Seconds between polls in watch mode
    #[arg(long, env = "LOTTOSYNC_INTERVAL", default_value_t = 600)]
    pub interval_secs: u64,

    /// Wall-clock ceiling for watch mode, seconds
    #[arg(long, env = "LOTTOSYNC_MAX_WAIT", default_value_t = 43_200)]
    pub max_wait_secs: u64,

    /// Milliseconds between fetches on one session
    #[arg(long, env = "LOTTOSYNC_POLITENESS_MS", default_value_t = 2_000)]
    pub politeness_ms: u64,

    /// Remote call attempts before a unit counts as failed
    #[arg(long, env = "LOTTOSYNC_RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Seconds between retry attempts
    #[arg(long, env = "LOTTOSYNC_RETRY_DELAY", default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Checkpoint file enabling resumable backfills
    #[arg(long, env = "LOTTOSYNC_CHECKPOINT")]
    pub checkpoint: Option<PathBuf>,
}

impl Cli {
    /// Converts the parsed CLI into [`SyncControls`].
    pub fn build_controls(&self) -> SyncControls {
        SyncControls::default()
            .with_workers(self.workers)
            .with_retries(self.retries, Duration::from_secs(self.retry_delay_secs))
            .with_politeness(Duration::from_millis(self.politeness_ms))
            .with_poll_timing(
                Duration::from_secs(self.interval_secs),
                Duration::from_secs(self.max_wait_secs),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_pacing() {
        let controls = SyncControls::default();
        assert_eq!(controls.workers(), 3);
        assert_eq!(controls.fetch_attempts(), 3);
        assert_eq!(controls.retry_delay(), Duration::from_secs(5));
        assert_eq!(controls.politeness_delay(), Duration::from_secs(2));
        assert_eq!(controls.long_pause_every(), 50);
        assert_eq!(controls.long_pause(), Duration::from_secs(10));
        assert_eq!(controls.checkpoint_interval(), 100);
        assert_eq!(controls.poll_interval(), Duration::from_secs(600));
        assert_eq!(controls.max_wait(), Duration::from_secs(43_200));
    }

    #[test]
    fn cli_flags_flow_into_controls() {
        let cli = Cli::try_parse_from([
            "lottosync",
            "--workers",
            "2",
            "--politeness-ms",
            "100",
            "--interval-secs",
            "60",
            "--max-wait-secs",
            "3600",
            "--categories",
            "lotto645,pension720",
        ])
        .expect("parse");
        assert_eq!(
            cli.categories,
            vec![Category::Lotto645, Category::Pension720]
        );

        let controls = cli.build_controls();
        assert_eq!(controls.workers(), 2);
        assert_eq!(controls.politeness_delay(), Duration::from_millis(100));
        assert_eq!(controls.poll_interval(), Duration::from_secs(60));
        assert_eq!(controls.max_wait(), Duration::from_secs(3600));
    }
}
