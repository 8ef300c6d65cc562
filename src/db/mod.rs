// Position persistence
pub mod memory;
pub mod postgres;

pub use memory::InMemoryPositionStore;
pub use postgres::PostgresPositionStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{ClosePosition, NewPosition, Position};
use crate::Result;

/// Durable storage for position rows.
///
/// `close_if_open` is the compare-and-close primitive: it writes the close
/// only if the row is still open and returns `None` otherwise (already
/// closed or unknown id).
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Open positions across all owners
    async fn find_open_positions(&self) -> Result<Vec<Position>>;

    async fn find_position(&self, id: Uuid) -> Result<Option<Position>>;

    /// Raise the stored high water mark. Never lowers it.
    async fn update_highest_price(&self, id: Uuid, price: f64) -> Result<()>;

    async fn close_if_open(&self, id: Uuid, close: &ClosePosition) -> Result<Option<Position>>;

    /// Validate and store a new open position, enforcing the per-owner cap
    async fn insert_position(&self, request: NewPosition) -> Result<Position>;
}
