//! Typed configuration sections, one per component

use serde::Deserialize;
use std::collections::HashMap;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub dedup: DedupConfig,
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub defcon: DefconConfig,
    pub exit: ExitConfig,
    pub entry: EntryConfig,
    pub sources: SourcesConfig,
    pub market: MarketConfig,
    pub alerts: AlertsConfig,
    pub news: NewsConfig,
    /// Ordered symbol lists per crisis type, used for entry proposals
    pub playbook: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Main loop period in seconds
    pub cycle_interval_sec: u64,
    /// disabled | semi_auto | full_auto
    pub broker_mode: String,
    /// Directory holding the store, command queue, PID file and spill file
    pub data_dir: String,
    /// Command polling tick in milliseconds
    pub command_tick_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Phase-2 cosine similarity threshold
    pub similarity_threshold: f64,
    /// Number of body tokens joined with the title for the TF-IDF vector
    pub body_token_limit: usize,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Rolling one-minute request cap
    pub rpm: u32,
    /// Minimum spacing between calls in milliseconds
    pub min_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefconConfig {
    pub weights: DefconWeights,
}

/// Sub-signal weights; must sum to 1.0
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DefconWeights {
    pub news: f64,
    pub vix: f64,
    pub r#yield: f64,
    pub drawdown: f64,
    pub breaking: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ExitConfig {
    /// Fixed profit target (0.05 = +5%)
    pub profit_target: f64,
    /// Fixed stop loss (-0.03 = -3%)
    pub stop_loss: f64,
    /// Trailing stop distance from peak (0.02 = 2%)
    pub trailing_stop: f64,
    /// Hard hold limit
    pub max_hold_hours: u64,
    /// No exit fires before this hold time
    pub min_hold_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    /// Base fraction of capital per position before VIX adjustment
    pub base_position_pct: f64,
    /// Cap on simultaneously open positions
    pub max_positions: usize,
    /// Lifetime of a pending entry decision
    pub decision_ttl_min: u64,
    /// Virtual capital the sizing is computed against
    pub total_capital: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub alpha_vantage: AlphaVantageConfig,
    pub rss: RssConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlphaVantageConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RssConfig {
    pub enabled: bool,
    pub feeds: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Chart-style quote endpoint; `{endpoint}/{symbol}` must return JSON
    pub endpoint: String,
    /// Symbols marked every cycle
    pub symbols: Vec<String>,
    pub vix_symbol: String,
    pub tnx_symbol: String,
    pub sp500_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    pub urgent: AlertChannelConfig,
    pub silent: SilentChannelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertChannelConfig {
    /// Webhook URL; empty disables the channel
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SilentChannelConfig {
    pub endpoint: String,
    /// Event kinds forwarded to the silent channel
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsConfig {
    pub keywords: UrgencyKeywords,
    /// Keyword overlap with this lexicon drives article relevance
    pub relevance_lexicon: Vec<String>,
    pub bearish_keywords: Vec<String>,
    pub bullish_keywords: Vec<String>,
    /// Keyword families per crisis type
    pub crisis_patterns: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UrgencyKeywords {
    pub breaking: Vec<String>,
    pub high: Vec<String>,
}
