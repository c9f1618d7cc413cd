// src/price.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ethers::types::U256;
#[cfg(test)]
use mockall::automock;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{fixed_point_rate, RateCache};

pub const CRYPTOCOMPARE_URL: &str = "https://min-api.cryptocompare.com";

/// Source of native-coin prices quoted in the fee token's unit.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Price of one `BASE` in `QUOTE` for a `BASE/QUOTE` pair.
    async fn fetch_rate(&self, pair: String) -> Result<f64>;
}

pub struct CryptoCompare {
    client: reqwest::Client,
    base_url: String,
}

impl CryptoCompare {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait]
impl PriceFeed for CryptoCompare {
    async fn fetch_rate(&self, pair: String) -> Result<f64> {
        let (base, quote) = pair
            .split_once('/')
            .ok_or_else(|| anyhow!("price pair {pair:?} is not BASE/QUOTE"))?;
        let url = format!("{}/data/price", self.base_url.trim_end_matches('/'));

        let prices: HashMap<String, f64> = self
            .client
            .get(url)
            .query(&[("fsym", base), ("tsyms", quote)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("unexpected price response")?;

        match prices.get(quote) {
            Some(price) if price.is_finite() && *price > 0.0 => Ok(*price),
            Some(price) => bail!("invalid {pair} price {price}"),
            None => bail!("no {quote} price in response"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriceRefreshSettings {
    pub interval: Duration,
    /// Attempts per refresh cycle.
    pub retries: u32,
    pub retry_backoff: Duration,
    /// Failed cycles in a row before the chain's rate is reported degraded.
    pub degraded_after: u32,
}

impl Default for PriceRefreshSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            retries: 3,
            retry_backoff: Duration::from_secs(2),
            degraded_after: 3,
        }
    }
}

/// Keeps the chains' exchange rates fresh. A failed refresh leaves the last
/// rate in place; it never stops the process.
pub struct PriceRefresher {
    feed: Arc<dyn PriceFeed>,
    settings: PriceRefreshSettings,
}

impl PriceRefresher {
    pub fn new(feed: Arc<dyn PriceFeed>, settings: PriceRefreshSettings) -> Self {
        Self { feed, settings }
    }

    async fn fetch_with_retries(&self, pair: &str) -> Result<U256> {
        let attempts = self.settings.retries.max(1);
        let mut last_error = anyhow!("no attempt made");
        for attempt in 1..=attempts {
            let result = self.feed.fetch_rate(pair.to_string()).await.and_then(|price| {
                let price = Decimal::try_from(price).with_context(|| format!("unrepresentable price {price}"))?;
                match fixed_point_rate(price) {
                    Some(rate) if !rate.is_zero() => Ok(rate),
                    _ => Err(anyhow!("price {price} out of range")),
                }
            });
            match result {
                Ok(rate) => return Ok(rate),
                Err(err) => {
                    warn!(pair, attempt, attempts, error = %err, "Price fetch failed");
                    last_error = err;
                }
            }
            if attempt < attempts {
                sleep(self.settings.retry_backoff * attempt).await;
            }
        }
        Err(last_error)
    }

    /// Runs one refresh cycle and returns whether a fresh rate was stored.
    pub async fn refresh_once(&self, chain_id: u64, pair: &str, cache: &RateCache) -> bool {
        match self.fetch_with_retries(pair).await {
            Ok(rate) => {
                if cache.is_degraded() {
                    info!(chain_id, pair, "Price feed recovered");
                }
                cache.record_success(rate);
                debug!(chain_id, pair, %rate, "Exchange rate updated");
                true
            }
            Err(err) => {
                if cache.record_failure(self.settings.degraded_after) {
                    error!(
                        chain_id,
                        pair,
                        failures = cache.consecutive_failures(),
                        stale_rate = %cache.current(),
                        last_success = ?cache.age(),
                        error = %err,
                        "Price feed degraded, serving stale exchange rate"
                    );
                } else {
                    warn!(chain_id, pair, error = %err, "Price refresh failed, keeping last exchange rate");
                }
                false
            }
        }
    }

    /// Refreshes `cache` on the configured interval until `cancel` fires. The first cycle runs immediately.
    pub fn spawn(
        self: Arc<Self>,
        chain_id: u64,
        pair: String,
        cache: RateCache,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut clock = interval(self.settings.interval);
            clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = clock.tick() => {
                        self.refresh_once(chain_id, &pair, &cache).await;
                    }
                }
            }
            debug!(chain_id, "Price refresh stopped");
        })
    }
}
