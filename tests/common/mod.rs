#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use riskbot::db::{InMemoryPositionStore, PositionStore};
use riskbot::execution::{ExitExecutor, PaperTradeExecutor, PositionMonitor, PriceOracle};
use riskbot::models::{ClosePosition, NewPosition, Position};
use riskbot::risk::{BreakerConfig, BreakerRegistry};

#[derive(Debug, Clone, Copy)]
pub enum Quote {
    Price(f64),
    Stale,
    Fail,
}

/// Oracle returning whatever the test last set per token
#[derive(Default)]
pub struct ScriptedOracle {
    quotes: Mutex<HashMap<String, Quote>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every quote takes `delay` (tokio time)
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set(&self, token: &str, quote: Quote) {
        self.quotes.lock().unwrap().insert(token.to_string(), quote);
    }

    pub fn set_price(&self, token: &str, price: f64) {
        self.set(token, Quote::Price(price));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceOracle for ScriptedOracle {
    async fn get_price(&self, token: &str) -> riskbot::Result<Option<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let quote = self.quotes.lock().unwrap().get(token).copied();
        match quote {
            Some(Quote::Price(price)) => Ok(Some(price)),
            Some(Quote::Stale) | None => Ok(None),
            Some(Quote::Fail) => Err(format!("price feed unreachable for {}", token).into()),
        }
    }
}

/// In-memory store with switchable failures
pub struct FlakyStore {
    inner: InMemoryPositionStore,
    pub fail_loads: AtomicBool,
    pub fail_highest_updates: AtomicBool,
    pub fail_closes: AtomicBool,
}

impl FlakyStore {
    pub fn new(max_open_per_owner: usize) -> Self {
        Self {
            inner: InMemoryPositionStore::new(max_open_per_owner),
            fail_loads: AtomicBool::new(false),
            fail_highest_updates: AtomicBool::new(false),
            fail_closes: AtomicBool::new(false),
        }
    }

    pub async fn get(&self, id: Uuid) -> Position {
        self.inner.find_position(id).await.unwrap().unwrap()
    }
}

#[async_trait]
impl PositionStore for FlakyStore {
    async fn find_open_positions(&self) -> riskbot::Result<Vec<Position>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        self.inner.find_open_positions().await
    }

    async fn find_position(&self, id: Uuid) -> riskbot::Result<Option<Position>> {
        self.inner.find_position(id).await
    }

    async fn update_highest_price(&self, id: Uuid, price: f64) -> riskbot::Result<()> {
        if self.fail_highest_updates.load(Ordering::SeqCst) {
            return Err("write timeout".into());
        }
        self.inner.update_highest_price(id, price).await
    }

    async fn close_if_open(&self, id: Uuid, close: &ClosePosition) -> riskbot::Result<Option<Position>> {
        if self.fail_closes.load(Ordering::SeqCst) {
            return Err("write timeout".into());
        }
        self.inner.close_if_open(id, close).await
    }

    async fn insert_position(&self, request: NewPosition) -> riskbot::Result<Position> {
        self.inner.insert_position(request).await
    }
}

pub const PRICE_CONCURRENCY: usize = 4;

pub fn request(token: &str, stop_loss: f64, take_profit: f64, trailing: Option<f64>) -> NewPosition {
    NewPosition {
        owner_id: Uuid::new_v4(),
        token: token.to_string(),
        amount: 2.0,
        entry_price: 100.0,
        stop_loss_price: stop_loss,
        take_profit_price: take_profit,
        trailing_stop_percent: trailing,
    }
}

pub fn registry() -> BreakerRegistry {
    BreakerRegistry::new(
        BreakerConfig {
            failure_threshold: 3,
            timeout: Duration::from_secs(60),
            ..Default::default()
        },
        BreakerConfig::default(),
        BreakerConfig::default(),
    )
}

pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub oracle: Arc<ScriptedOracle>,
    pub breakers: BreakerRegistry,
    pub monitor: Arc<PositionMonitor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_oracle(ScriptedOracle::new())
    }

    pub fn with_oracle(oracle: ScriptedOracle) -> Self {
        let store = Arc::new(FlakyStore::new(100));
        let oracle = Arc::new(oracle);
        let breakers = registry();
        let monitor = Arc::new(monitor_for(store.clone(), oracle.clone(), breakers.clone()));

        Self {
            store,
            oracle,
            breakers,
            monitor,
        }
    }

    pub async fn open(&self, request: NewPosition) -> Position {
        self.store.insert_position(request).await.unwrap()
    }
}

/// A monitor with its own exit executor over shared collaborators
pub fn monitor_for(
    store: Arc<FlakyStore>,
    oracle: Arc<ScriptedOracle>,
    breakers: BreakerRegistry,
) -> PositionMonitor {
    let exits = Arc::new(ExitExecutor::new(
        store.clone(),
        Arc::new(PaperTradeExecutor),
        breakers.clone(),
    ));
    PositionMonitor::new(store, oracle, breakers, exits, PRICE_CONCURRENCY)
}
