//! Configuration management for HighTrade
//!
//! Loads from YAML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Result};
use config::{Config, Environment, File};

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Orchestrator defaults
            .set_default("orchestrator.cycle_interval_sec", 900_i64)?
            .set_default("orchestrator.broker_mode", "disabled")?
            .set_default("orchestrator.data_dir", "./trading_data")?
            .set_default("orchestrator.command_tick_ms", 250_i64)?
            // Deduplication defaults
            .set_default("dedup.similarity_threshold", 0.6)?
            .set_default("dedup.body_token_limit", 200_i64)?
            // Rate limit defaults (Alpha-Vantage-style and RSS pacing)
            .set_default("rate_limits.alpha_vantage.rpm", 5_i64)?
            .set_default("rate_limits.alpha_vantage.min_ms", 12_000_i64)?
            .set_default("rate_limits.rss.rpm", 60_i64)?
            .set_default("rate_limits.rss.min_ms", 1_000_i64)?
            .set_default("rate_limits.market.rpm", 60_i64)?
            .set_default("rate_limits.market.min_ms", 1_000_i64)?
            // DEFCON weight defaults
            .set_default("defcon.weights.news", 0.40)?
            .set_default("defcon.weights.vix", 0.20)?
            .set_default("defcon.weights.yield", 0.15)?
            .set_default("defcon.weights.drawdown", 0.15)?
            .set_default("defcon.weights.breaking", 0.10)?
            // Exit strategy defaults
            .set_default("exit.profit_target", 0.05)?
            .set_default("exit.stop_loss", -0.03)?
            .set_default("exit.trailing_stop", 0.02)?
            .set_default("exit.max_hold_hours", 72_i64)?
            .set_default("exit.min_hold_minutes", 60_i64)?
            // Entry defaults
            .set_default("entry.base_position_pct", 0.10)?
            .set_default("entry.max_positions", 5_i64)?
            .set_default("entry.decision_ttl_min", 60_i64)?
            .set_default("entry.total_capital", 100_000.0)?
            // News source defaults
            .set_default("sources.alpha_vantage.enabled", false)?
            .set_default(
                "sources.alpha_vantage.endpoint",
                "https://www.alphavantage.co/query",
            )?
            .set_default("sources.alpha_vantage.api_key", "")?
            .set_default(
                "sources.alpha_vantage.topics",
                vec!["financial_markets", "economy_macro"],
            )?
            .set_default("sources.rss.enabled", false)?
            .set_default("sources.rss.feeds", Vec::<String>::new())?
            // Market data defaults
            .set_default(
                "market.endpoint",
                "https://query1.finance.yahoo.com/v8/finance/chart",
            )?
            .set_default("market.symbols", vec!["SPY", "QQQ", "TLT", "GLD"])?
            .set_default("market.vix_symbol", "^VIX")?
            .set_default("market.tnx_symbol", "^TNX")?
            .set_default("market.sp500_symbol", "^GSPC")?
            // Alert router defaults
            .set_default("alerts.urgent.endpoint", "")?
            .set_default("alerts.silent.endpoint", "")?
            .set_default(
                "alerts.silent.events",
                vec![
                    "cycle_summary",
                    "defcon_change",
                    "trade_entry",
                    "trade_exit",
                    "news_update",
                ],
            )?
            // News classification defaults (overridable lexicons)
            .set_default(
                "news.keywords.breaking",
                vec![
                    "breaking", "emergency", "crash", "collapse", "halt", "panic",
                    "plunge", "default",
                ],
            )?
            .set_default(
                "news.keywords.high",
                vec![
                    "warning", "selloff", "sell-off", "tumble", "slump", "spike",
                    "recession", "downgrade",
                ],
            )?
            .set_default(
                "news.relevance_lexicon",
                vec![
                    "market", "stocks", "fed", "inflation", "rates", "yield",
                    "economy", "earnings", "treasury", "bonds", "vix", "recession",
                    "tariff", "credit", "liquidity", "banking",
                ],
            )?
            .set_default(
                "news.bearish_keywords",
                vec![
                    "crash", "collapse", "crisis", "plunge", "plummet", "fear",
                    "panic", "selloff", "sell-off", "tumble", "slump", "recession",
                    "downturn", "bearish", "warning", "emergency", "concern",
                    "risk", "threat", "decline", "fall", "drop",
                ],
            )?
            .set_default(
                "news.bullish_keywords",
                vec![
                    "rally", "surge", "soar", "recovery", "rebound", "deal",
                    "agreement", "resolution", "bullish", "optimism", "growth",
                    "gain", "rise", "climb", "advance", "breakthrough", "strong",
                    "robust", "improving", "upturn",
                ],
            )?
            .set_default(
                "news.crisis_patterns.tech_crash",
                vec!["tech", "valuation", "margin", "leverage", "overvalued", "nasdaq"],
            )?
            .set_default(
                "news.crisis_patterns.geopolitical",
                vec!["tariff", "trade war", "sanctions", "conflict", "invasion", "supply chain"],
            )?
            .set_default(
                "news.crisis_patterns.liquidity_credit",
                vec!["liquidity", "credit", "spread", "banking", "default", "insolvency"],
            )?
            .set_default(
                "news.crisis_patterns.inflation_rate",
                vec!["inflation", "yield", "rate", "fed", "tightening", "cpi"],
            )?
            .set_default(
                "news.crisis_patterns.market_correction",
                vec!["correction", "selloff", "drawdown", "decline", "drop", "crash"],
            )?
            .set_default(
                "news.crisis_patterns.systemic",
                vec!["contagion", "systemic", "bailout", "bank run", "counterparty", "frozen"],
            )?
            // Crisis playbook: ordered symbol lists per crisis type
            .set_default(
                "playbook.tech_crash",
                vec!["SPY", "BRK-B", "GLD"],
            )?
            .set_default(
                "playbook.geopolitical",
                vec!["MSFT", "GOOGL", "GLD"],
            )?
            .set_default(
                "playbook.liquidity_credit",
                vec!["AAPL", "MSFT", "TLT"],
            )?
            .set_default(
                "playbook.inflation_rate",
                vec!["QQQ", "NVDA", "TIP"],
            )?
            .set_default(
                "playbook.market_correction",
                vec!["SPY", "AAPL", "MSFT"],
            )?
            .set_default(
                "playbook.systemic",
                vec!["GLD", "TLT", "BRK-B"],
            )?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Environment variables override (HIGHTRADE_ORCHESTRATOR__DATA_DIR, ...)
            .add_source(
                Environment::with_prefix("HIGHTRADE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: AppConfig = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.cycle_interval_sec == 0 {
            bail!("orchestrator.cycle_interval_sec must be positive");
        }
        if !(0.0..=1.0).contains(&self.dedup.similarity_threshold) {
            bail!(
                "dedup.similarity_threshold must be in [0, 1], got {}",
                self.dedup.similarity_threshold
            );
        }
        if self.exit.stop_loss >= 0.0 {
            bail!("exit.stop_loss must be negative (e.g. -0.03)");
        }
        if self.exit.profit_target <= 0.0 {
            bail!("exit.profit_target must be positive (e.g. 0.05)");
        }
        if self.exit.trailing_stop <= 0.0 {
            bail!("exit.trailing_stop must be positive (e.g. 0.02)");
        }
        let w = &self.defcon.weights;
        let total = w.news + w.vix + w.r#yield + w.drawdown + w.breaking;
        if (total - 1.0).abs() > 0.01 {
            bail!("defcon.weights must sum to 1.0, got {:.3}", total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_and_validate() {
        let cfg = AppConfig::load().expect("defaults must load");
        assert_eq!(cfg.orchestrator.cycle_interval_sec, 900);
        assert_eq!(cfg.dedup.similarity_threshold, 0.6);
        assert_eq!(cfg.exit.max_hold_hours, 72);
        let av = cfg.rate_limits.get("alpha_vantage").unwrap();
        assert_eq!(av.rpm, 5);
        assert_eq!(av.min_ms, 12_000);
    }

    #[test]
    fn test_weight_sum_enforced() {
        let mut cfg = AppConfig::load().unwrap();
        cfg.defcon.weights.news = 0.9;
        assert!(cfg.validate().is_err());
    }
}
