//! Core types used throughout HighTrade
//!
//! Defines the shared data model: articles, news signals, market
//! snapshots, DEFCON state, paper positions and pending decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Urgency tier assigned to an article at ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    High,
    Breaking,
}

impl Urgency {
    /// Weight used in the composite news score
    pub fn score_weight(&self) -> f64 {
        match self {
            Urgency::Breaking => 10.0,
            Urgency::High => 5.0,
            Urgency::Routine => 1.0,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "routine" => Some(Urgency::Routine),
            "high" => Some(Urgency::High),
            "breaking" => Some(Urgency::Breaking),
            _ => None,
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Routine => write!(f, "routine"),
            Urgency::High => write!(f, "high"),
            Urgency::Breaking => write!(f, "breaking"),
        }
    }
}

/// Sentiment label for an article or a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Bearish,
    Bullish,
    Neutral,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentiment::Bearish => write!(f, "bearish"),
            Sentiment::Bullish => write!(f, "bullish"),
            Sentiment::Neutral => write!(f, "neutral"),
        }
    }
}

/// Categorical crisis label derived from keyword-family dominance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisType {
    None,
    MarketCorrection,
    InflationRate,
    LiquidityCredit,
    TechCrash,
    Geopolitical,
    Systemic,
}

impl CrisisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrisisType::None => "none",
            CrisisType::MarketCorrection => "market_correction",
            CrisisType::InflationRate => "inflation_rate",
            CrisisType::LiquidityCredit => "liquidity_credit",
            CrisisType::TechCrash => "tech_crash",
            CrisisType::Geopolitical => "geopolitical",
            CrisisType::Systemic => "systemic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CrisisType::None),
            "market_correction" => Some(CrisisType::MarketCorrection),
            "inflation_rate" => Some(CrisisType::InflationRate),
            "liquidity_credit" => Some(CrisisType::LiquidityCredit),
            "tech_crash" => Some(CrisisType::TechCrash),
            "geopolitical" => Some(CrisisType::Geopolitical),
            "systemic" => Some(CrisisType::Systemic),
            _ => None,
        }
    }
}

impl fmt::Display for CrisisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Standardized news article, immutable after ingest. Identity = `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Stable hash of the normalized URL
    pub id: String,
    pub source: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub raw_text: String,
    /// Relevance in [0, 1]
    pub relevance: f64,
    pub urgency: Urgency,
}

impl Article {
    /// Stable article id: hex-truncated SHA-256 of the normalized URL
    pub fn stable_id(url: &str) -> String {
        let normalized = url.trim().to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        hex_prefix(&digest, 16)
    }
}

/// Lowercase hex of the first `n` bytes of a digest
pub fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes
        .iter()
        .take(n)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Sentiment distribution across a batch; components sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SentimentDist {
    pub bearish: f64,
    pub bullish: f64,
    pub neutral: f64,
}

impl SentimentDist {
    /// Dominant label; neutral wins ties
    pub fn label(&self) -> Sentiment {
        if self.bearish > self.bullish && self.bearish > self.neutral {
            Sentiment::Bearish
        } else if self.bullish > self.bearish && self.bullish > self.neutral {
            Sentiment::Bullish
        } else {
            Sentiment::Neutral
        }
    }
}

/// Per-cycle news signal. Written once per cycle; never mutated.
/// The most recent row is the novelty baseline for the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSignal {
    pub cycle_id: u64,
    pub timestamp: DateTime<Utc>,
    pub article_count: usize,
    /// Composite news score in [0, 100]
    pub score: f64,
    pub crisis_type: CrisisType,
    pub sentiment: SentimentDist,
    /// Up to five article ids, ordered by contribution
    pub top_articles: Vec<String>,
    pub breaking_count: usize,
}

/// One market snapshot per cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    pub vix: f64,
    pub bond_yield_10y: f64,
    pub sp500_change_pct: f64,
    pub per_symbol_price: HashMap<String, f64>,
    /// True when any component fell back to a synthetic value
    pub stale: bool,
}

/// Discrete crisis level. Five is peacetime, One is maximum crisis.
/// Not a numeric continuum: comparisons go through `as_u8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefconLevel {
    One,
    Two,
    Three,
    Four,
    Five,
}

impl DefconLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            DefconLevel::One => 1,
            DefconLevel::Two => 2,
            DefconLevel::Three => 3,
            DefconLevel::Four => 4,
            DefconLevel::Five => 5,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(DefconLevel::One),
            2 => Some(DefconLevel::Two),
            3 => Some(DefconLevel::Three),
            4 => Some(DefconLevel::Four),
            5 => Some(DefconLevel::Five),
            _ => None,
        }
    }

    /// Map a composite signal score in [0, 100] to a level.
    /// Inclusive lower thresholds; total and monotone in score.
    pub fn from_score(score: f64) -> Self {
        if score >= 85.0 {
            DefconLevel::One
        } else if score >= 70.0 {
            DefconLevel::Two
        } else if score >= 50.0 {
            DefconLevel::Three
        } else if score >= 30.0 {
            DefconLevel::Four
        } else {
            DefconLevel::Five
        }
    }

    /// True when `self` is a more severe alert than `other`
    pub fn more_severe_than(&self, other: DefconLevel) -> bool {
        self.as_u8() < other.as_u8()
    }
}

impl fmt::Display for DefconLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DEFCON {}", self.as_u8())
    }
}

/// Sub-signal that contributed most to a DEFCON transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    NewsScore,
    VixComponent,
    YieldComponent,
    Sp500Drawdown,
    BreakingBias,
    NewsOverride,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::NewsScore => "news_score",
            ReasonCode::VixComponent => "vix_component",
            ReasonCode::YieldComponent => "yield_component",
            ReasonCode::Sp500Drawdown => "sp500_drawdown",
            ReasonCode::BreakingBias => "breaking_bias",
            ReasonCode::NewsOverride => "news_override",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "news_score" => Some(ReasonCode::NewsScore),
            "vix_component" => Some(ReasonCode::VixComponent),
            "yield_component" => Some(ReasonCode::YieldComponent),
            "sp500_drawdown" => Some(ReasonCode::Sp500Drawdown),
            "breaking_bias" => Some(ReasonCode::BreakingBias),
            "news_override" => Some(ReasonCode::NewsOverride),
            _ => None,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted on every DEFCON transition; current state = latest row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefconState {
    pub level: DefconLevel,
    pub signal_score: f64,
    pub entered_at: DateTime<Utc>,
    pub reason_code: ReasonCode,
}

impl Default for DefconState {
    fn default() -> Self {
        Self {
            level: DefconLevel::Five,
            signal_score: 0.0,
            entered_at: Utc::now(),
            reason_code: ReasonCode::NewsScore,
        }
    }
}

/// Lifecycle state of a paper position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PendingExit,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::PendingExit => "pending_exit",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "pending_exit" => Some(PositionStatus::PendingExit),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    ProfitTarget,
    TrailingStop,
    DefconRevert,
    TimeLimit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::DefconRevert => "defcon_revert",
            ExitReason::TimeLimit => "time_limit",
            ExitReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stop_loss" => Some(ExitReason::StopLoss),
            "profit_target" => Some(ExitReason::ProfitTarget),
            "trailing_stop" => Some(ExitReason::TrailingStop),
            "defcon_revert" => Some(ExitReason::DefconRevert),
            "time_limit" => Some(ExitReason::TimeLimit),
            "manual" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A paper position.
///
/// Invariants: `qty > 0`; while open, `peak_price` is monotone
/// non-decreasing and at least `max(entry_price, every observed mark)`;
/// a closed position is frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_defcon: DefconLevel,
    pub peak_price: f64,
    pub current_price: f64,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    /// Unrealized return relative to entry
    pub fn pnl_pct(&self) -> f64 {
        if self.entry_price > 0.0 {
            (self.current_price - self.entry_price) / self.entry_price
        } else {
            0.0
        }
    }

    pub fn hold_duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.entry_time
    }
}

/// Kind of decision awaiting the human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Entry,
    Exit,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Entry => "entry",
            DecisionKind::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(DecisionKind::Entry),
            "exit" => Some(DecisionKind::Exit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Awaiting,
    Approved,
    Rejected,
    Expired,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Awaiting => "awaiting",
            DecisionStatus::Approved => "approved",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting" => Some(DecisionStatus::Awaiting),
            "approved" => Some(DecisionStatus::Approved),
            "rejected" => Some(DecisionStatus::Rejected),
            "expired" => Some(DecisionStatus::Expired),
            _ => None,
        }
    }
}

/// A trade proposal awaiting approval. At most one active entry
/// decision exists at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDecision {
    pub id: String,
    pub kind: DecisionKind,
    /// Position id for exits, serialized proposal for entries
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: DecisionStatus,
}

/// Policy governing how proposed trades traverse the approval boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    /// Every entry is filed as a pending decision; nothing executes
    /// until approved
    Disabled,
    /// Entries execute immediately and notify
    SemiAuto,
    /// Entries and exits execute silently
    FullAuto,
}

impl BrokerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerMode::Disabled => "disabled",
            BrokerMode::SemiAuto => "semi_auto",
            BrokerMode::FullAuto => "full_auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "disabled" => Some(BrokerMode::Disabled),
            "semi_auto" | "semi" => Some(BrokerMode::SemiAuto),
            "full_auto" | "full" => Some(BrokerMode::FullAuto),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Run mode of the monitoring loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorMode {
    Running,
    Held,
    EStopped,
    ShuttingDown,
}

impl OrchestratorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorMode::Running => "running",
            OrchestratorMode::Held => "held",
            OrchestratorMode::EStopped => "e_stopped",
            OrchestratorMode::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for OrchestratorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// In-memory orchestrator state, restored from persistence at boot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub mode: OrchestratorMode,
    pub broker_mode: BrokerMode,
    pub cycle_interval_sec: u64,
    pub last_cycle_start: Option<DateTime<Utc>>,
    pub cycle_count: u64,
}

impl OrchestratorState {
    pub fn new(broker_mode: BrokerMode, cycle_interval_sec: u64) -> Self {
        Self {
            mode: OrchestratorMode::Running,
            broker_mode,
            cycle_interval_sec,
            last_cycle_start: None,
            cycle_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defcon_mapping_thresholds() {
        assert_eq!(DefconLevel::from_score(0.0), DefconLevel::Five);
        assert_eq!(DefconLevel::from_score(29.9), DefconLevel::Five);
        assert_eq!(DefconLevel::from_score(30.0), DefconLevel::Four);
        assert_eq!(DefconLevel::from_score(50.0), DefconLevel::Three);
        assert_eq!(DefconLevel::from_score(70.0), DefconLevel::Two);
        assert_eq!(DefconLevel::from_score(85.0), DefconLevel::One);
        assert_eq!(DefconLevel::from_score(100.0), DefconLevel::One);
    }

    #[test]
    fn test_defcon_mapping_monotone() {
        let mut prev = DefconLevel::from_score(0.0).as_u8();
        for i in 0..=1000 {
            let level = DefconLevel::from_score(i as f64 / 10.0).as_u8();
            assert!(level <= prev, "level must not relax as score rises");
            prev = level;
        }
    }

    #[test]
    fn test_stable_id_is_deterministic() {
        let a = Article::stable_id("https://example.com/story");
        let b = Article::stable_id("  HTTPS://EXAMPLE.COM/story  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_sentiment_label_neutral_on_tie() {
        let dist = SentimentDist {
            bearish: 0.4,
            bullish: 0.4,
            neutral: 0.2,
        };
        assert_eq!(dist.label(), Sentiment::Neutral);
    }

    #[test]
    fn test_broker_mode_parse() {
        assert_eq!(BrokerMode::parse("semi_auto"), Some(BrokerMode::SemiAuto));
        assert_eq!(BrokerMode::parse("FULL"), Some(BrokerMode::FullAuto));
        assert_eq!(BrokerMode::parse("bogus"), None);
    }
}
