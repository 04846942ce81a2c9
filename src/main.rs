//! Binary entry point: one-shot sync/backfill or watch mode.

use anyhow::{bail, Context, Result};
use clap::Parser;
use lottosync::{
    latest_remote_unit, Category, CheckpointLog, Cli, CsvStore, HttpSessionFactory, PollLoop,
    PollState, SyncOrchestrator,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let controls = cli.build_controls();

    let factory = Arc::new(HttpSessionFactory::new(
        controls.listing_timeout(),
        controls.listing_poll(),
    ));
    let store = Arc::new(CsvStore::new(&cli.output));
    let checkpoint = match &cli.checkpoint {
        Some(path) => CheckpointLog::load(path)
            .with_context(|| format!("unreadable checkpoint log {}", path.display()))?,
        None => CheckpointLog::in_memory(),
    };

    // Ctrl-C sets the stop flag; loops exit at the next transition boundary
    // while in-flight fetches finish naturally.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing in-flight work");
                stop.store(true, Ordering::Release);
            }
        });
    }

    let orchestrator =
        SyncOrchestrator::new(Arc::clone(&factory), controls).with_stop(Arc::clone(&stop));

    if cli.watch {
        let mut poll = PollLoop::new(
            orchestrator,
            Arc::clone(&factory),
            Arc::clone(&store),
            cli.categories.clone(),
        )
        .with_stop(stop)
        .with_checkpoint(checkpoint);

        let outcome = poll.run().await.context("poll loop failed")?;
        match outcome.state {
            PollState::Done => info!("new units synced"),
            // A clean stop, not an error: the scheduler re-invokes us.
            PollState::TimedOut => info!(ticks = outcome.ticks, "no new units before ceiling"),
            state => info!(?state, "poll loop stopped"),
        }
        return Ok(());
    }

    run_once(&cli, orchestrator, factory, store, checkpoint).await
}

/// One-shot mode: explicit backfill range, or catch-up against the probe.
async fn run_once(
    cli: &Cli,
    orchestrator: SyncOrchestrator<HttpSessionFactory>,
    factory: Arc<HttpSessionFactory>,
    store: Arc<CsvStore>,
    mut checkpoint: CheckpointLog,
) -> Result<()> {
    use lottosync::LocalState;

    let probe_policy = orchestrator.controls().probe_policy();
    for &category in &cli.categories {
        let start = match cli.start {
            Some(start) => start,
            None => {
                let local = store
                    .latest_known_unit(category)
                    .await
                    .context("local state unreadable")?;
                local + 1
            }
        };
        let end = match cli.end {
            Some(end) => end,
            None => latest_remote_unit(factory.as_ref(), category, &probe_policy)
                .await
                .context("could not determine the newest remote unit")?,
        };

        if start > end {
            info!(%category, start, end, "already up to date");
            continue;
        }
        sync_category(&orchestrator, category, start, end, &store, &mut checkpoint).await?;
    }
    Ok(())
}

async fn sync_category(
    orchestrator: &SyncOrchestrator<HttpSessionFactory>,
    category: Category,
    start: u32,
    end: u32,
    store: &CsvStore,
    checkpoint: &mut CheckpointLog,
) -> Result<()> {
    let report = orchestrator
        .sync_range(category, start, end, store, checkpoint)
        .await;
    match report {
        Ok(report) => {
            report.report(category);
            Ok(())
        }
        Err(err) => bail!("sync for {category} could not run: {err}"),
    }
}
