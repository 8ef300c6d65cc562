use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stop_loss" => Some(ExitReason::StopLoss),
            "trailing_stop" => Some(ExitReason::TrailingStop),
            "take_profit" => Some(ExitReason::TakeProfit),
            "manual" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored trading position.
///
/// Rows are created by the trade-entry flow with `status = Open`. Only the
/// monitor (`highest_price`) and the exit executor (close) mutate them, and
/// closed rows are kept as history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub token: String,
    pub amount: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_stop_percent: Option<f64>,
    pub highest_price: f64, // High water mark since entry
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ExitReason>,
    pub pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Raise the high water mark. Returns true if it moved.
    pub fn raise_highest_price(&mut self, price: f64) -> bool {
        if price > self.highest_price {
            self.highest_price = price;
            true
        } else {
            false
        }
    }

    /// Trailing floor derived from the high water mark, if a usable trailing
    /// percent is configured.
    pub fn trailing_floor(&self) -> Option<f64> {
        self.trailing_stop_percent
            .filter(|pct| *pct > 0.0 && *pct < 100.0)
            .map(|pct| self.highest_price * (1.0 - pct / 100.0))
    }

    /// The greater of the fixed stop and the trailing floor. Never below
    /// `stop_loss_price`.
    pub fn effective_stop_loss(&self) -> f64 {
        match self.trailing_floor() {
            Some(floor) => self.stop_loss_price.max(floor),
            None => self.stop_loss_price,
        }
    }

    /// Realized P&L for an exit at `exit_price`
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) * self.amount
    }

    /// P&L as a percentage of the entry price
    pub fn pnl_percent_at(&self, exit_price: f64) -> f64 {
        (exit_price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Request to open a position, as handed over by the trade-entry flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPosition {
    pub owner_id: Uuid,
    pub token: String,
    pub amount: f64,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_stop_percent: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(f64),
    #[error("entry price must be positive, got {0}")]
    InvalidEntryPrice(f64),
    #[error("thresholds must satisfy stop_loss < entry < take_profit (got {stop_loss} / {entry} / {take_profit})")]
    InvalidThresholds {
        stop_loss: f64,
        entry: f64,
        take_profit: f64,
    },
    #[error("trailing stop percent must be within 0-100, got {0}")]
    InvalidTrailingPercent(f64),
    #[error("owner {owner_id} already has {open} open positions (cap {cap})")]
    OwnerCapReached {
        owner_id: Uuid,
        open: usize,
        cap: usize,
    },
}

impl NewPosition {
    pub fn validate(&self) -> Result<(), PositionError> {
        if !(self.amount.is_finite() && self.amount > 0.0) {
            return Err(PositionError::InvalidAmount(self.amount));
        }
        if !(self.entry_price.is_finite() && self.entry_price > 0.0) {
            return Err(PositionError::InvalidEntryPrice(self.entry_price));
        }
        if !(self.stop_loss_price < self.entry_price && self.entry_price < self.take_profit_price) {
            return Err(PositionError::InvalidThresholds {
                stop_loss: self.stop_loss_price,
                entry: self.entry_price,
                take_profit: self.take_profit_price,
            });
        }
        if let Some(pct) = self.trailing_stop_percent {
            if !(0.0..=100.0).contains(&pct) {
                return Err(PositionError::InvalidTrailingPercent(pct));
            }
        }
        Ok(())
    }

    /// Build the open row. `highest_price` starts at the entry price.
    pub fn into_position(self, opened_at: DateTime<Utc>) -> Result<Position, PositionError> {
        self.validate()?;

        Ok(Position {
            id: Uuid::new_v4(),
            owner_id: self.owner_id,
            token: self.token,
            amount: self.amount,
            entry_price: self.entry_price,
            stop_loss_price: self.stop_loss_price,
            take_profit_price: self.take_profit_price,
            trailing_stop_percent: self.trailing_stop_percent,
            highest_price: self.entry_price,
            status: PositionStatus::Open,
            exit_price: None,
            exit_reason: None,
            pnl: None,
            opened_at,
            closed_at: None,
        })
    }
}

/// Fields written by a compare-and-close
#[derive(Debug, Clone, PartialEq)]
pub struct ClosePosition {
    pub exit_price: f64,
    pub reason: ExitReason,
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
}
