use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::trade::TradeExecutor;
use crate::db::PositionStore;
use crate::models::{ClosePosition, ExitReason, Position};
use crate::risk::{BreakerError, BreakerRegistry};

/// A position this executor closed
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub pnl_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Closed(ClosedPosition),
    /// Someone else closed it first. Not an error.
    AlreadyClosed,
    NotFound,
}

/// Why an exit did not complete. The position stays open either way and is
/// retried on the next sweep.
#[derive(Debug, Error)]
pub enum ExitError {
    #[error("failed to read position {position_id}: {source}")]
    Read {
        position_id: Uuid,
        #[source]
        source: BreakerError,
    },
    #[error("exit order for position {position_id} failed: {source}")]
    Trade {
        position_id: Uuid,
        #[source]
        source: BreakerError,
    },
    #[error("failed to persist close of position {position_id}: {source}")]
    Persist {
        position_id: Uuid,
        #[source]
        source: BreakerError,
    },
}

impl ExitError {
    /// True when a breaker refused the call rather than the dependency failing
    pub fn is_circuit_open(&self) -> bool {
        match self {
            ExitError::Read { source, .. }
            | ExitError::Trade { source, .. }
            | ExitError::Persist { source, .. } => source.is_open(),
        }
    }
}

type PositionLocks = Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

/// Closes positions idempotently.
///
/// Calls for the same position id are serialized; the store's
/// compare-and-close is the final guard against double closes.
pub struct ExitExecutor {
    store: Arc<dyn PositionStore>,
    trader: Arc<dyn TradeExecutor>,
    breakers: BreakerRegistry,
    locks: PositionLocks,
}

impl ExitExecutor {
    pub fn new(store: Arc<dyn PositionStore>, trader: Arc<dyn TradeExecutor>, breakers: BreakerRegistry) -> Self {
        Self {
            store,
            trader,
            breakers,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Close `position_id` at `trigger_price` for `reason`
    pub async fn close(
        &self,
        position_id: Uuid,
        reason: ExitReason,
        trigger_price: f64,
    ) -> Result<ExitOutcome, ExitError> {
        let _guard = self.lock_position(position_id).await;
        self.close_locked(position_id, reason, trigger_price).await
    }

    /// Operator-initiated close
    pub async fn close_manually(&self, position_id: Uuid, exit_price: f64) -> Result<ExitOutcome, ExitError> {
        self.close(position_id, ExitReason::Manual, exit_price).await
    }

    async fn close_locked(
        &self,
        position_id: Uuid,
        reason: ExitReason,
        trigger_price: f64,
    ) -> Result<ExitOutcome, ExitError> {
        let position = match self
            .breakers
            .persistence()
            .execute(|| self.store.find_position(position_id))
            .await
        {
            Ok(Some(position)) => position,
            Ok(None) => {
                tracing::warn!(%position_id, "Exit requested for unknown position");
                return Ok(ExitOutcome::NotFound);
            }
            Err(source) => return Err(ExitError::Read { position_id, source }),
        };

        if !position.is_open() {
            tracing::debug!(%position_id, "Position already closed, skipping exit");
            return Ok(ExitOutcome::AlreadyClosed);
        }

        let exit_price = self
            .breakers
            .trade_execution()
            .execute(|| self.trader.execute_exit(&position, trigger_price))
            .await
            .map_err(|source| ExitError::Trade { position_id, source })?;

        let close = ClosePosition {
            exit_price,
            reason,
            pnl: position.pnl_at(exit_price),
            closed_at: Utc::now(),
        };

        match self
            .breakers
            .persistence()
            .execute(|| self.store.close_if_open(position_id, &close))
            .await
        {
            Ok(Some(closed)) => {
                let pnl_percent = closed.pnl_percent_at(exit_price);
                tracing::info!(
                    %position_id,
                    owner_id = %closed.owner_id,
                    token = %closed.token,
                    reason = %reason,
                    exit_price,
                    pnl = close.pnl,
                    pnl_percent,
                    "✓ Position closed"
                );
                Ok(ExitOutcome::Closed(ClosedPosition {
                    position: closed,
                    pnl_percent,
                }))
            }
            Ok(None) => {
                tracing::info!(%position_id, "Position closed concurrently, keeping existing record");
                Ok(ExitOutcome::AlreadyClosed)
            }
            Err(source) => {
                tracing::error!(
                    %position_id,
                    error = %source,
                    "Exit filled but close not persisted, position stays open for retry"
                );
                Err(ExitError::Persist { position_id, source })
            }
        }
    }

    async fn lock_position(&self, position_id: Uuid) -> PositionGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(position_id).or_default().clone()
        };

        let guard = lock.clone().lock_owned().await;
        PositionGuard {
            locks: &self.locks,
            position_id,
            lock,
            _guard: guard,
        }
    }

    /// Positions with a close in progress or queued
    pub fn in_flight(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Holds the per-position lock; drops the map entry when nobody else is
/// waiting on it.
struct PositionGuard<'a> {
    locks: &'a PositionLocks,
    position_id: Uuid,
    lock: Arc<tokio::sync::Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for PositionGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry, our handle, and the owned guard
        if Arc::strong_count(&self.lock) <= 3 {
            locks.remove(&self.position_id);
        }
    }
}
