use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

pub const DEXSCREENER_API_BASE: &str = "https://api.dexscreener.com/latest/dex";

type OracleRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Source of current token prices.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Current price for `token`, or `None` when the feed has no usable
    /// quote (stale or unlisted). Transport errors are `Err`.
    async fn get_price(&self, token: &str) -> Result<Option<f64>>;
}

#[derive(Debug, Deserialize)]
struct DexScreenerResponse {
    #[serde(default)]
    pairs: Option<Vec<PairData>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairData {
    chain_id: String,
    #[serde(default)]
    price_usd: Option<String>,
}

/// Price oracle backed by the DexScreener token endpoint.
///
/// Clones share the HTTP client and rate limiter.
#[derive(Clone)]
pub struct DexScreenerOracle {
    client: Client,
    base_url: String,
    chain_id: Option<String>,
    rate_limiter: Arc<OracleRateLimiter>,
}

impl DexScreenerOracle {
    /// # Arguments
    /// * `base_url` - API base, normally [`DEXSCREENER_API_BASE`]
    /// * `chain_id` - Preferred chain for pair selection (e.g. "solana")
    /// * `requests_per_minute` - Client-side rate limit
    /// * `request_timeout` - Per-request HTTP timeout
    pub fn new(
        base_url: impl Into<String>,
        chain_id: Option<String>,
        requests_per_minute: u32,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;

        let quota = Quota::per_minute(NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            chain_id,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    fn select_price(&self, pairs: Vec<PairData>) -> Option<f64> {
        let pair = match &self.chain_id {
            Some(chain) => pairs.into_iter().find(|p| &p.chain_id == chain),
            None => pairs.into_iter().next(),
        }?;

        pair.price_usd
            .and_then(|raw| raw.parse::<f64>().ok())
            .filter(|price| price.is_finite() && *price > 0.0)
    }
}

#[async_trait]
impl PriceOracle for DexScreenerOracle {
    async fn get_price(&self, token: &str) -> Result<Option<f64>> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/tokens/{}", self.base_url, token);
        let response: DexScreenerResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let price = self.select_price(response.pairs.unwrap_or_default());
        match price {
            Some(price) => tracing::debug!(token, price, "Fetched price"),
            None => tracing::debug!(token, "No usable quote"),
        }

        Ok(price)
    }
}
