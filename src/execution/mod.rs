// Position monitoring, exits and the sweep loop
pub mod executor;
pub mod monitor;
pub mod price_feed;
pub mod scheduler;
pub mod trade;

pub use executor::{ClosedPosition, ExitError, ExitExecutor, ExitOutcome};
pub use monitor::{exit_trigger, PositionMonitor, SweepReport};
pub use price_feed::{DexScreenerOracle, PriceOracle, DEXSCREENER_API_BASE};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SweepScheduler};
pub use trade::{PaperTradeExecutor, TradeExecutor};
