use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::PositionStore;
use crate::models::{ClosePosition, NewPosition, Position, PositionError, PositionStatus};
use crate::Result;

/// Process-local position store.
///
/// Used when no database is configured. Every write happens under one
/// write lock, so compare-and-close is atomic.
pub struct InMemoryPositionStore {
    positions: RwLock<HashMap<Uuid, Position>>,
    max_open_per_owner: usize,
}

impl InMemoryPositionStore {
    pub fn new(max_open_per_owner: usize) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            max_open_per_owner,
        }
    }

    /// All rows, open and closed, oldest first
    pub async fn all_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.read().await.values().cloned().collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn find_open_positions(&self) -> Result<Vec<Position>> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.opened_at);
        Ok(open)
    }

    async fn find_position(&self, id: Uuid) -> Result<Option<Position>> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn update_highest_price(&self, id: Uuid, price: f64) -> Result<()> {
        let mut positions = self.positions.write().await;
        if let Some(position) = positions.get_mut(&id).filter(|p| p.is_open()) {
            position.raise_highest_price(price);
        }
        Ok(())
    }

    async fn close_if_open(&self, id: Uuid, close: &ClosePosition) -> Result<Option<Position>> {
        let mut positions = self.positions.write().await;

        let position = match positions.get_mut(&id) {
            Some(p) if p.is_open() => p,
            _ => return Ok(None),
        };

        position.status = PositionStatus::Closed;
        position.exit_price = Some(close.exit_price);
        position.exit_reason = Some(close.reason);
        position.pnl = Some(close.pnl);
        position.closed_at = Some(close.closed_at);

        Ok(Some(position.clone()))
    }

    async fn insert_position(&self, request: NewPosition) -> Result<Position> {
        request.validate()?;

        let mut positions = self.positions.write().await;
        let open = positions
            .values()
            .filter(|p| p.owner_id == request.owner_id && p.is_open())
            .count();
        if open >= self.max_open_per_owner {
            return Err(PositionError::OwnerCapReached {
                owner_id: request.owner_id,
                open,
                cap: self.max_open_per_owner,
            }
            .into());
        }

        let position = request.into_position(Utc::now())?;
        positions.insert(position.id, position.clone());

        tracing::debug!(
            position_id = %position.id,
            owner_id = %position.owner_id,
            token = %position.token,
            "Stored new position"
        );

        Ok(position)
    }
}
