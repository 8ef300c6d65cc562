use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use super::executor::{ExitExecutor, ExitOutcome};
use super::price_feed::PriceOracle;
use crate::db::PositionStore;
use crate::models::{ExitReason, Position};
use crate::risk::BreakerRegistry;

/// Summary of one sweep, logged by the scheduler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub positions_loaded: usize,
    pub evaluated: usize,
    /// Positions skipped because their token had no usable price
    pub skipped_unavailable: usize,
    pub tokens_priced: usize,
    pub tokens_unavailable: usize,
    pub highest_price_updates: usize,
    pub closed: Vec<(Uuid, ExitReason)>,
    pub already_closed: usize,
    pub failures: usize,
    /// Open positions could not be loaded, nothing was evaluated
    pub load_failed: bool,
    pub duration: Duration,
}

impl SweepReport {
    pub fn closed_count(&self, reason: ExitReason) -> usize {
        self.closed.iter().filter(|(_, r)| *r == reason).count()
    }
}

/// Decide whether `position` should exit at `current_price`.
///
/// Loss protection runs first, so a trailing floor above take-profit still
/// closes as a stop.
pub fn exit_trigger(position: &Position, current_price: f64) -> Option<ExitReason> {
    let effective_stop = position.effective_stop_loss();

    if current_price <= effective_stop {
        if effective_stop > position.stop_loss_price {
            return Some(ExitReason::TrailingStop);
        }
        return Some(ExitReason::StopLoss);
    }

    if current_price >= position.take_profit_price {
        return Some(ExitReason::TakeProfit);
    }

    None
}

/// Re-evaluates every open position against its exit thresholds.
pub struct PositionMonitor {
    store: Arc<dyn PositionStore>,
    oracle: Arc<dyn PriceOracle>,
    breakers: BreakerRegistry,
    exits: Arc<ExitExecutor>,
    price_concurrency: usize,
}

impl PositionMonitor {
    pub fn new(
        store: Arc<dyn PositionStore>,
        oracle: Arc<dyn PriceOracle>,
        breakers: BreakerRegistry,
        exits: Arc<ExitExecutor>,
        price_concurrency: usize,
    ) -> Self {
        Self {
            store,
            oracle,
            breakers,
            exits,
            price_concurrency: price_concurrency.max(1),
        }
    }

    pub fn exits(&self) -> &Arc<ExitExecutor> {
        &self.exits
    }

    /// Run one sweep over all open positions. Never fails; problems are
    /// logged and counted in the report.
    pub async fn sweep(&self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();

        let positions = match self
            .breakers
            .persistence()
            .execute(|| self.store.find_open_positions())
            .await
        {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load open positions, skipping sweep");
                report.load_failed = true;
                report.duration = started.elapsed();
                return report;
            }
        };
        report.positions_loaded = positions.len();

        if positions.is_empty() {
            tracing::debug!("No open positions");
            report.duration = started.elapsed();
            return report;
        }

        let tokens: BTreeSet<String> = positions.iter().map(|p| p.token.clone()).collect();
        let prices = self.fetch_prices(tokens.into_iter().collect()).await;
        report.tokens_priced = prices.values().filter(|p| p.is_some()).count();
        report.tokens_unavailable = prices.len() - report.tokens_priced;

        for position in positions {
            let Some(price) = prices.get(&position.token).copied().flatten() else {
                report.skipped_unavailable += 1;
                continue;
            };

            self.evaluate(position, price, &mut report).await;
            report.evaluated += 1;
        }

        report.duration = started.elapsed();
        report
    }

    /// One price per token, `None` for tokens unavailable this sweep
    async fn fetch_prices(&self, tokens: Vec<String>) -> HashMap<String, Option<f64>> {
        let semaphore = Arc::new(Semaphore::new(self.price_concurrency));
        let mut tasks = JoinSet::new();

        for token in &tokens {
            let token = token.clone();
            let oracle = self.oracle.clone();
            let breaker = self.breakers.price_feed().clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = breaker.execute(|| oracle.get_price(&token)).await;
                (token, result)
            });
        }

        let mut prices: HashMap<String, Option<f64>> =
            tokens.into_iter().map(|token| (token, None)).collect();

        while let Some(joined) = tasks.join_next().await {
            let (token, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!("Price fetch task failed: {}", e);
                    continue;
                }
            };

            match result {
                Ok(Some(price)) if price.is_finite() && price > 0.0 => {
                    prices.insert(token, Some(price));
                }
                Ok(_) => {
                    tracing::debug!(token = %token, "No fresh price, skipping token this sweep");
                }
                Err(e) if e.is_open() => {
                    tracing::debug!(token = %token, "Price feed circuit open, skipping token");
                }
                Err(e) => {
                    tracing::warn!(token = %token, error = %e, "Price fetch failed");
                }
            }
        }

        prices
    }

    async fn evaluate(&self, mut position: Position, price: f64, report: &mut SweepReport) {
        let position_id = position.id;

        if position.raise_highest_price(price) {
            match self
                .breakers
                .persistence()
                .execute(|| self.store.update_highest_price(position_id, price))
                .await
            {
                Ok(()) => report.highest_price_updates += 1,
                Err(e) => tracing::warn!(
                    %position_id,
                    error = %e,
                    "Failed to persist highest price, continuing with in-memory value"
                ),
            }
        }

        let Some(reason) = exit_trigger(&position, price) else {
            return;
        };

        tracing::info!(
            %position_id,
            token = %position.token,
            reason = %reason,
            price,
            effective_stop = position.effective_stop_loss(),
            take_profit = position.take_profit_price,
            "Exit triggered"
        );

        match self.exits.close(position_id, reason, price).await {
            Ok(ExitOutcome::Closed(closed)) => {
                report.closed.push((closed.position.id, reason));
            }
            Ok(ExitOutcome::AlreadyClosed) | Ok(ExitOutcome::NotFound) => {
                report.already_closed += 1;
            }
            Err(e) => {
                report.failures += 1;
                if e.is_circuit_open() {
                    tracing::warn!(%position_id, error = %e, "Exit deferred, circuit open");
                } else {
                    tracing::error!(%position_id, error = %e, "Exit failed, will retry next sweep");
                }
            }
        }
    }
}
