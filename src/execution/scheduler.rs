use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::monitor::{PositionMonitor, SweepReport};
use crate::models::ExitReason;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Time between sweep starts
    pub interval: Duration,
    /// A sweep still running after this is cancelled
    pub max_sweep_duration: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_sweep_duration: Duration::from_secs(25),
        }
    }
}

/// Runs monitor sweeps on a fixed cadence, one at a time.
pub struct SweepScheduler;

impl SweepScheduler {
    /// Spawn the sweep loop. The first sweep starts immediately.
    pub fn start(monitor: Arc<PositionMonitor>, config: SchedulerConfig) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();

        let task = tokio::spawn(sweep_loop(monitor, config, shutdown.clone(), abort.clone()));

        SchedulerHandle {
            shutdown,
            abort,
            task,
        }
    }

    /// Run a single sweep bounded by `max_duration`. `None` if it was
    /// cancelled for running too long.
    pub async fn run_once(monitor: &PositionMonitor, max_duration: Duration) -> Option<SweepReport> {
        match tokio::time::timeout(max_duration, monitor.sweep()).await {
            Ok(report) => {
                log_report(&report);
                Some(report)
            }
            Err(_) => {
                tracing::error!(
                    limit = ?max_duration,
                    "⚠️  Sweep exceeded max duration and was cancelled"
                );
                None
            }
        }
    }
}

async fn sweep_loop(
    monitor: Arc<PositionMonitor>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    abort: CancellationToken,
) -> usize {
    tracing::info!(
        interval = ?config.interval,
        max_sweep_duration = ?config.max_sweep_duration,
        "🔄 Position monitor starting"
    );

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut completed = 0usize;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Awaited inline so sweeps never overlap
        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                tracing::warn!("In-flight sweep aborted");
                break;
            }
            outcome = SweepScheduler::run_once(&monitor, config.max_sweep_duration) => {
                if outcome.is_some() {
                    completed += 1;
                }
            }
        }
    }

    tracing::info!(completed, "Position monitor stopped");
    completed
}

fn log_report(report: &SweepReport) {
    if report.load_failed {
        tracing::warn!(duration = ?report.duration, "Sweep skipped, open positions unavailable");
        return;
    }

    tracing::info!(
        positions = report.positions_loaded,
        evaluated = report.evaluated,
        skipped = report.skipped_unavailable,
        tokens_priced = report.tokens_priced,
        tokens_unavailable = report.tokens_unavailable,
        highest_updates = report.highest_price_updates,
        stop_loss = report.closed_count(ExitReason::StopLoss),
        trailing_stop = report.closed_count(ExitReason::TrailingStop),
        take_profit = report.closed_count(ExitReason::TakeProfit),
        already_closed = report.already_closed,
        failures = report.failures,
        duration = ?report.duration,
        "📊 Sweep complete"
    );
}

/// Control handle for a running scheduler
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    abort: CancellationToken,
    task: JoinHandle<usize>,
}

impl SchedulerHandle {
    /// Let the in-flight sweep finish, then stop. Returns completed sweeps.
    pub async fn stop(self) -> usize {
        self.shutdown.cancel();
        self.join().await
    }

    /// Drop the in-flight sweep and stop. Returns completed sweeps.
    pub async fn cancel(self) -> usize {
        self.abort.cancel();
        self.shutdown.cancel();
        self.join().await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    async fn join(self) -> usize {
        match self.task.await {
            Ok(completed) => completed,
            Err(e) => {
                tracing::error!("Scheduler task failed: {}", e);
                0
            }
        }
    }
}
