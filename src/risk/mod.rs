// Dependency isolation: per-dependency circuit breakers
pub mod circuit_breakers;
pub mod registry;

pub use circuit_breakers::{BreakerConfig, BreakerError, BreakerStatus, CircuitBreaker, CircuitState};
pub use registry::{BreakerRegistry, RegistryError, PERSISTENCE, PRICE_FEED, TRADE_EXECUTION};
