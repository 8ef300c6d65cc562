use async_trait::async_trait;

use crate::models::Position;
use crate::Result;

/// Submits exit orders. Routing, slippage and signing live behind this
/// trait; the monitor only sees a fill price or a failure.
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    /// Sell the full position. Returns the fill price.
    async fn execute_exit(&self, position: &Position, trigger_price: f64) -> Result<f64>;
}

/// Paper trading: fills every exit at the trigger price.
#[derive(Debug, Clone, Default)]
pub struct PaperTradeExecutor;

#[async_trait]
impl TradeExecutor for PaperTradeExecutor {
    async fn execute_exit(&self, position: &Position, trigger_price: f64) -> Result<f64> {
        tracing::info!(
            "  → Would SELL {:.4} {} @ ${:.4} (total: ${:.2})",
            position.amount,
            position.token,
            trigger_price,
            position.amount * trigger_price
        );

        Ok(trigger_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewPosition;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_paper_fill_at_trigger_price() {
        let position = NewPosition {
            owner_id: Uuid::new_v4(),
            token: "JUP".to_string(),
            amount: 100.0,
            entry_price: 1.0,
            stop_loss_price: 0.9,
            take_profit_price: 1.5,
            trailing_stop_percent: None,
        }
        .into_position(Utc::now())
        .unwrap();

        let fill = PaperTradeExecutor.execute_exit(&position, 0.89).await.unwrap();
        assert_eq!(fill, 0.89);
    }
}
