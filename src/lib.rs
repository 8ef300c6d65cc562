// Core modules
pub mod config;
pub mod db;
pub mod execution;
pub mod models;
pub mod risk;

// Re-export commonly used types
pub use models::*;
pub use risk::{BreakerConfig, BreakerError, BreakerRegistry, CircuitBreaker, CircuitState};

// Error handling
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, BoxError>;
