use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::execution::{SchedulerConfig, DEXSCREENER_API_BASE};
use crate::risk::BreakerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "riskbot.toml";
pub const ENV_PREFIX: &str = "RISKBOT";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Postgres URL. Absent means the in-memory store.
    pub database_url: Option<String>,
    pub price_feed: PriceFeedSettings,
    pub monitor: MonitorSettings,
    pub breakers: BreakerSettingsSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriceFeedSettings {
    pub base_url: String,
    /// Preferred chain when a token trades on several
    pub chain_id: Option<String>,
    pub requests_per_minute: u32,
    pub request_timeout_secs: u64,
}

impl Default for PriceFeedSettings {
    fn default() -> Self {
        Self {
            base_url: DEXSCREENER_API_BASE.to_string(),
            chain_id: Some("solana".to_string()),
            requests_per_minute: 300, // DexScreener token endpoint limit
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    pub max_sweep_secs: u64,
    pub price_concurrency: usize,
    pub max_open_positions_per_owner: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_sweep_secs: 25,
            price_concurrency: 8,
            max_open_positions_per_owner: 20,
        }
    }
}

impl MonitorSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.interval_secs),
            max_sweep_duration: Duration::from_secs(self.max_sweep_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
    pub call_timeout_ms: Option<u64>,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            timeout_ms: config.timeout.as_millis() as u64,
            call_timeout_ms: config.call_timeout.map(|d| d.as_millis() as u64),
            half_open_max_calls: config.half_open_max_calls,
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            success_threshold: settings.success_threshold,
            timeout: Duration::from_millis(settings.timeout_ms),
            call_timeout: settings.call_timeout_ms.map(Duration::from_millis),
            half_open_max_calls: settings.half_open_max_calls,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettingsSet {
    pub price_feed: BreakerSettings,
    pub trade_execution: BreakerSettings,
    pub persistence: BreakerSettings,
}

impl Default for BreakerSettingsSet {
    fn default() -> Self {
        Self {
            // Quotes are cheap to skip, trip fast
            price_feed: BreakerSettings {
                failure_threshold: 3,
                timeout_ms: 30_000,
                call_timeout_ms: Some(5_000),
                ..Default::default()
            },
            trade_execution: BreakerSettings {
                failure_threshold: 3,
                timeout_ms: 60_000,
                call_timeout_ms: Some(15_000),
                ..Default::default()
            },
            persistence: BreakerSettings {
                failure_threshold: 5,
                timeout_ms: 30_000,
                call_timeout_ms: Some(5_000),
                ..Default::default()
            },
        }
    }
}

impl Settings {
    /// Layer the TOML file (if present) under `RISKBOT__*` environment
    /// variables, e.g. `RISKBOT__MONITOR__INTERVAL_SECS=10`.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };

        let settings: Settings = with_breaker_defaults(Config::builder())?
            .add_source(File::from(path).format(FileFormat::Toml).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = with_breaker_defaults(Config::builder())?
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        positive("price_feed.requests_per_minute", self.price_feed.requests_per_minute as u64)?;
        positive("price_feed.request_timeout_secs", self.price_feed.request_timeout_secs)?;
        positive("monitor.interval_secs", self.monitor.interval_secs)?;
        positive("monitor.max_sweep_secs", self.monitor.max_sweep_secs)?;
        positive("monitor.price_concurrency", self.monitor.price_concurrency as u64)?;
        positive(
            "monitor.max_open_positions_per_owner",
            self.monitor.max_open_positions_per_owner as u64,
        )?;

        for (name, breaker) in [
            ("price_feed", &self.breakers.price_feed),
            ("trade_execution", &self.breakers.trade_execution),
            ("persistence", &self.breakers.persistence),
        ] {
            positive(&format!("breakers.{name}.failure_threshold"), breaker.failure_threshold as u64)?;
            positive(&format!("breakers.{name}.success_threshold"), breaker.success_threshold as u64)?;
            positive(&format!("breakers.{name}.timeout_ms"), breaker.timeout_ms)?;
            positive(
                &format!("breakers.{name}.half_open_max_calls"),
                breaker.half_open_max_calls as u64,
            )?;
            if let Some(call_timeout) = breaker.call_timeout_ms {
                positive(&format!("breakers.{name}.call_timeout_ms"), call_timeout)?;
            }
        }

        Ok(())
    }
}

/// Seed each breaker's own defaults beneath the file and env layers. A table
/// that sets one key keeps the rest of that breaker's tuning.
fn with_breaker_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, SettingsError> {
    let defaults = BreakerSettingsSet::default();
    let mut builder = builder;

    for (name, breaker) in [
        ("price_feed", &defaults.price_feed),
        ("trade_execution", &defaults.trade_execution),
        ("persistence", &defaults.persistence),
    ] {
        let key = |field: &str| format!("breakers.{name}.{field}");
        builder = builder
            .set_default(key("failure_threshold"), breaker.failure_threshold as i64)?
            .set_default(key("success_threshold"), breaker.success_threshold as i64)?
            .set_default(key("timeout_ms"), breaker.timeout_ms as i64)?
            .set_default(key("half_open_max_calls"), breaker.half_open_max_calls as i64)?;
        if let Some(call_timeout) = breaker.call_timeout_ms {
            builder = builder.set_default(key("call_timeout_ms"), call_timeout as i64)?;
        }
    }

    Ok(builder)
}

fn positive(field: &str, value: u64) -> Result<(), SettingsError> {
    if value == 0 {
        return Err(SettingsError::Invalid {
            field: field.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}
