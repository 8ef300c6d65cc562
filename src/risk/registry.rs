use std::sync::Arc;
use thiserror::Error;

use super::circuit_breakers::{BreakerConfig, BreakerStatus, CircuitBreaker};

pub const PRICE_FEED: &str = "price_feed";
pub const TRADE_EXECUTION: &str = "trade_execution";
pub const PERSISTENCE: &str = "persistence";

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown circuit breaker '{0}'")]
    UnknownBreaker(String),
}

/// Named breakers, one per guarded dependency.
///
/// Built once at startup and handed to the monitor and exit executor, so a
/// slow price feed can never trip the persistence breaker.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    price_feed: Arc<CircuitBreaker>,
    trade_execution: Arc<CircuitBreaker>,
    persistence: Arc<CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(price_feed: BreakerConfig, trade_execution: BreakerConfig, persistence: BreakerConfig) -> Self {
        tracing::info!(
            price_feed = ?price_feed,
            trade_execution = ?trade_execution,
            persistence = ?persistence,
            "Circuit breakers initialized"
        );

        Self {
            price_feed: Arc::new(CircuitBreaker::new(PRICE_FEED, price_feed)),
            trade_execution: Arc::new(CircuitBreaker::new(TRADE_EXECUTION, trade_execution)),
            persistence: Arc::new(CircuitBreaker::new(PERSISTENCE, persistence)),
        }
    }

    pub fn price_feed(&self) -> &Arc<CircuitBreaker> {
        &self.price_feed
    }

    pub fn trade_execution(&self) -> &Arc<CircuitBreaker> {
        &self.trade_execution
    }

    pub fn persistence(&self) -> &Arc<CircuitBreaker> {
        &self.persistence
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CircuitBreaker>> {
        match name {
            PRICE_FEED => Some(&self.price_feed),
            TRADE_EXECUTION => Some(&self.trade_execution),
            PERSISTENCE => Some(&self.persistence),
            _ => None,
        }
    }

    fn require(&self, name: &str) -> Result<&Arc<CircuitBreaker>, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::UnknownBreaker(name.to_string()))
    }

    pub fn status(&self, name: &str) -> Result<BreakerStatus, RegistryError> {
        Ok(self.require(name)?.status())
    }

    pub fn statuses(&self) -> Vec<BreakerStatus> {
        vec![
            self.price_feed.status(),
            self.trade_execution.status(),
            self.persistence.status(),
        ]
    }

    pub fn force_open(&self, name: &str) -> Result<(), RegistryError> {
        self.require(name)?.force_open();
        Ok(())
    }

    pub fn force_close(&self, name: &str) -> Result<(), RegistryError> {
        self.require(name)?.force_close();
        Ok(())
    }

    /// Halt all exits by forcing the trade-execution breaker open
    pub fn emergency_stop(&self) {
        tracing::warn!("Emergency stop requested, halting trade execution");
        self.trade_execution.force_open();
    }

    /// Resume trading after [`emergency_stop`](Self::emergency_stop)
    pub fn release_emergency_stop(&self) {
        tracing::warn!("Emergency stop released, resuming trade execution");
        self.trade_execution.force_close();
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(
            BreakerConfig::default(),
            BreakerConfig::default(),
            BreakerConfig::default(),
        )
    }
}
