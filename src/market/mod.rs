//! Market data client
//!
//! Real-time quotes plus the macro trio (VIX, 10Y yield, S&P day change)
//! from a chart-style quote endpoint, paced through the rate limiter.
//! Upstream failure degrades to a synthetic quote around the last known
//! price and marks the snapshot stale; the ledger refuses to open new
//! positions from stale snapshots.

use anyhow::{bail, Result};
use chrono::Utc;
use futures_util::future::join_all;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::config::MarketConfig;
use crate::rate_limit::{Outcome, RateLimiter};
use crate::types::MarketSnapshot;

const RATE_KEY: &str = "market";

/// Seed prices used when a symbol has never been observed
fn seed_price(symbol: &str, config: &MarketConfig) -> f64 {
    if symbol == config.vix_symbol {
        20.0
    } else if symbol == config.tnx_symbol {
        4.0
    } else {
        100.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub price: f64,
    pub stale: bool,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
    #[serde(rename = "chartPreviousClose")]
    chart_previous_close: Option<f64>,
}

/// Quote client with synthetic-fallback degradation
pub struct MarketDataClient {
    client: Client,
    config: MarketConfig,
    rate_limiter: Arc<RateLimiter>,
    last_known: RwLock<HashMap<String, f64>>,
}

impl MarketDataClient {
    pub fn new(client: Client, config: MarketConfig, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            config,
            rate_limiter,
            last_known: RwLock::new(HashMap::new()),
        }
    }

    /// Current price for a symbol; stale on fallback
    pub async fn quote(&self, symbol: &str) -> Quote {
        match self.fetch_meta(symbol).await {
            Ok(meta) if meta.regular_market_price.is_some() => {
                let price = meta.regular_market_price.unwrap_or_default();
                self.remember(symbol, price);
                Quote { price, stale: false }
            }
            Ok(_) => {
                warn!(symbol, "quote payload missing price, using synthetic");
                self.synthetic_quote(symbol)
            }
            Err(err) => {
                warn!(symbol, error = %err, "quote fetch failed, using synthetic");
                self.synthetic_quote(symbol)
            }
        }
    }

    /// Day change percentage for a symbol; None on fallback
    async fn day_change_pct(&self, symbol: &str) -> Option<f64> {
        let meta = self.fetch_meta(symbol).await.ok()?;
        let price = meta.regular_market_price?;
        let previous = meta.chart_previous_close?;
        if previous <= 0.0 {
            return None;
        }
        self.remember(symbol, price);
        Some((price - previous) / previous * 100.0)
    }

    /// Build the cycle's market snapshot. Symbol quotes run as parallel
    /// sub-tasks; the macro trio is fetched alongside them.
    pub async fn snapshot(&self) -> MarketSnapshot {
        let symbols = self.config.symbols.clone();
        let quote_futures = symbols.iter().map(|s| self.quote(s));

        let (quotes, vix, yield_10y, sp500_change) = tokio::join!(
            join_all(quote_futures),
            self.quote(&self.config.vix_symbol),
            self.quote(&self.config.tnx_symbol),
            self.day_change_pct(&self.config.sp500_symbol),
        );

        let mut stale = vix.stale || yield_10y.stale || sp500_change.is_none();
        let mut per_symbol_price = HashMap::new();
        for (symbol, quote) in symbols.into_iter().zip(quotes) {
            stale |= quote.stale;
            per_symbol_price.insert(symbol, quote.price);
        }

        let snapshot = MarketSnapshot {
            timestamp: Utc::now(),
            vix: vix.price,
            bond_yield_10y: yield_10y.price,
            sp500_change_pct: sp500_change.unwrap_or(0.0),
            per_symbol_price,
            stale,
        };
        debug!(
            vix = snapshot.vix,
            yield_10y = snapshot.bond_yield_10y,
            sp500_pct = snapshot.sp500_change_pct,
            stale = snapshot.stale,
            "market snapshot"
        );
        snapshot
    }

    async fn fetch_meta(&self, symbol: &str) -> Result<ChartMeta> {
        self.rate_limiter.acquire(RATE_KEY).await;

        let url = format!("{}/{}", self.config.endpoint.trim_end_matches('/'), symbol);
        let response = self
            .client
            .get(&url)
            .query(&[("interval", "1d"), ("range", "2d")])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                let outcome = if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
                    Outcome::RateLimited
                } else {
                    Outcome::OtherError
                };
                self.rate_limiter.record(RATE_KEY, outcome).await;
                bail!("quote request failed: {}", err);
            }
        };

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.rate_limiter.record(RATE_KEY, Outcome::RateLimited).await;
            bail!("quote source rate limited");
        }
        if !response.status().is_success() {
            self.rate_limiter.record(RATE_KEY, Outcome::OtherError).await;
            bail!("quote source returned {}", response.status());
        }

        let body: ChartResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                self.rate_limiter.record(RATE_KEY, Outcome::OtherError).await;
                bail!("quote payload malformed: {}", err);
            }
        };
        self.rate_limiter.record(RATE_KEY, Outcome::Ok).await;

        body.chart
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .map(|r| r.meta)
            .ok_or_else(|| anyhow::anyhow!("quote payload empty for {}", symbol))
    }

    fn remember(&self, symbol: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            if let Ok(mut known) = self.last_known.write() {
                known.insert(symbol.to_string(), price);
            }
        }
    }

    /// Synthetic quote: last known price drifted uniformly within ±2%
    fn synthetic_quote(&self, symbol: &str) -> Quote {
        let base = self
            .last_known
            .read()
            .ok()
            .and_then(|known| known.get(symbol).copied())
            .unwrap_or_else(|| seed_price(symbol, &self.config));
        let factor = rand::thread_rng().gen_range(0.98..1.02);
        Quote {
            price: base * factor,
            stale: true,
        }
    }
}
