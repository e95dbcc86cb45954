//! Collection rounds: fan out one task per metric family, join them all, then report.

use crate::error::CollectError;
use crate::metrics::{disk, DiskIoData, MetricFamily, ProcessMetric};
use crate::report::Reporter;
use crate::snapshot::{Snapshot, SnapshotAggregator};
use crate::source::MetricSource;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a round collects and with which parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSettings {
    pub families: Vec<MetricFamily>,
    /// Processes kept per top-processes ranking
    pub top_n: usize,
    /// Gap between the two disk counter reads
    pub disk_io_window: Duration,
}

/// Result of a completed round
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub snapshot: Snapshot,
    /// Families whose task errored or panicked, in join order
    pub failed: Vec<MetricFamily>,
    pub elapsed: Duration,
}

impl RoundOutcome {
    pub fn failure(&self) -> Option<CollectError> {
        if self.failed.is_empty() {
            None
        } else {
            Some(CollectError::PartialRoundFailure {
                failed: self.failed.clone(),
            })
        }
    }
}

/// One fan-out of collection tasks over a shared source
pub struct CollectionRound {
    source: Arc<dyn MetricSource>,
    settings: RoundSettings,
}

impl CollectionRound {
    pub fn new(source: Arc<dyn MetricSource>, settings: RoundSettings) -> Self {
        Self { source, settings }
    }

    pub fn settings(&self) -> &RoundSettings {
        &self.settings
    }

    /// Collect every configured family concurrently and wait for all of them.
    ///
    /// Individual failures leave that family out of the snapshot. The round only errors
    /// with [`CollectError::Cancelled`] when shutdown interrupts it.
    pub async fn run(&self, token: &CancellationToken) -> Result<RoundOutcome, CollectError> {
        let started = Instant::now();
        let aggregator = Arc::new(SnapshotAggregator::new());
        let mut tasks = JoinSet::new();

        for &family in &self.settings.families {
            let source = Arc::clone(&self.source);
            let aggregator = Arc::clone(&aggregator);
            let token = token.clone();
            let top_n = self.settings.top_n;
            let window = self.settings.disk_io_window;

            tasks.spawn(async move {
                let collect = collect_family(source.as_ref(), &aggregator, family, top_n, window);
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CollectError::Cancelled),
                    result = collect => result,
                };
                (family, result)
            });
        }

        let mut reported = HashSet::new();
        let mut failed = Vec::new();
        let mut cancelled = false;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((family, result)) => {
                    reported.insert(family);
                    match result {
                        Ok(()) => debug!(family = %family, "Collected"),
                        Err(CollectError::Cancelled) => cancelled = true,
                        Err(e) => {
                            warn!(family = %family, error = %e, "Collection failed");
                            failed.push(family);
                        }
                    }
                }
                Err(e) => error!(error = %e, "Collection task panicked"),
            }
        }

        if cancelled || token.is_cancelled() {
            return Err(CollectError::Cancelled);
        }

        // A panicked task never reports its family back
        for &family in &self.settings.families {
            if !reported.contains(&family) {
                failed.push(family);
            }
        }

        let snapshot = match Arc::try_unwrap(aggregator) {
            Ok(aggregator) => aggregator.into_snapshot(),
            Err(shared) => shared.snapshot().await,
        };

        Ok(RoundOutcome {
            snapshot,
            failed,
            elapsed: started.elapsed(),
        })
    }
}

async fn collect_family(
    source: &dyn MetricSource,
    aggregator: &SnapshotAggregator,
    family: MetricFamily,
    top_n: usize,
    disk_io_window: Duration,
) -> Result<(), CollectError> {
    match family {
        MetricFamily::Cpu => aggregator.set_cpu(source.read_cpu().await?).await,
        MetricFamily::Memory => aggregator.set_memory(source.read_memory().await?).await,
        MetricFamily::DiskPartitions => {
            aggregator
                .set_disk_partitions(source.read_partitions().await?)
                .await
        }
        MetricFamily::DiskIo => {
            aggregator
                .set_disk_io(disk_io_speeds(source, disk_io_window).await?)
                .await
        }
        MetricFamily::TopProcessesCpu => {
            let processes = source.read_top_processes(ProcessMetric::Cpu, top_n).await?;
            aggregator.set_top_processes_cpu(processes).await
        }
        MetricFamily::TopProcessesMemory => {
            let processes = source
                .read_top_processes(ProcessMetric::Memory, top_n)
                .await?;
            aggregator.set_top_processes_memory(processes).await
        }
    }
    Ok(())
}

/// Read disk counters twice, `window` apart, and turn the difference into speeds
pub async fn disk_io_speeds(
    source: &dyn MetricSource,
    window: Duration,
) -> Result<Vec<DiskIoData>, CollectError> {
    let initial = source.read_disk_io_counters().await?;
    time::sleep(window).await;
    let last = source.read_disk_io_counters().await?;
    Ok(disk::io_speeds(&initial, &last, window))
}

/// Runs collection rounds on a fixed interval and hands each snapshot to every reporter
pub struct RoundScheduler {
    round: CollectionRound,
    interval: Duration,
    reporters: Vec<Box<dyn Reporter>>,
    rounds_completed: u64,
}

impl RoundScheduler {
    pub fn new(
        round: CollectionRound,
        interval: Duration,
        reporters: Vec<Box<dyn Reporter>>,
    ) -> Self {
        Self {
            round,
            interval,
            reporters,
            rounds_completed: 0,
        }
    }

    /// Run rounds until cancelled. A round that overruns the interval is followed straight
    /// away by the next one, and the ticks it missed are dropped. Rounds never overlap.
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs_f64(),
            families = self.round.settings().families.len(),
            "Collection rounds scheduled"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.run_once(&token).await.is_err() {
                break;
            }
        }

        debug!(rounds = self.rounds_completed, "Round scheduler stopped");
    }

    /// Collect one round and report it. Only cancellation is an error.
    pub async fn run_once(
        &mut self,
        token: &CancellationToken,
    ) -> Result<RoundOutcome, CollectError> {
        let outcome = self.round.run(token).await.inspect_err(|_| {
            debug!("Collection round abandoned for shutdown");
        })?;

        if outcome.snapshot.is_empty() {
            warn!("Collection round produced no metrics");
        } else if let Some(failure) = outcome.failure() {
            warn!(error = %failure, "Partial collection round");
        }

        self.publish(&outcome.snapshot);
        self.rounds_completed += 1;

        info!(
            round = self.rounds_completed,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "System metrics collection completed"
        );
        Ok(outcome)
    }

    fn publish(&mut self, snapshot: &Snapshot) {
        for reporter in &mut self.reporters {
            if let Err(e) = reporter.report(snapshot) {
                warn!(
                    reporter = reporter.name(),
                    error = %format!("{:#}", e),
                    "Reporter failed"
                );
            }
        }
    }
}
