//! Signal scoring and DEFCON level engine
//!
//! Composes the news score, market metrics and breaking-news pressure
//! into a weighted composite in [0, 100], maps it onto the discrete
//! DEFCON scale with no hysteresis, and applies the breaking-news
//! override (which only ever raises the alert, never relaxes it).

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::DefconWeights;
use crate::types::{
    DefconLevel, DefconState, MarketSnapshot, NewsSignal, ReasonCode, Sentiment,
};

/// Weighted contribution of each sub-signal
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub components: [(ReasonCode, f64); 5],
    /// Composite score in [0, 100]
    pub total: f64,
}

impl ScoreBreakdown {
    /// Sub-signal with the largest weighted contribution
    pub fn dominant(&self) -> ReasonCode {
        self.components
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(code, _)| *code)
            .unwrap_or(ReasonCode::NewsScore)
    }
}

/// Result of one cycle's DEFCON evaluation
#[derive(Debug, Clone)]
pub struct DefconEvaluation {
    pub state: DefconState,
    pub breakdown: ScoreBreakdown,
    /// True when the level differs from the previous cycle;
    /// only then is a DefconState row persisted
    pub changed: bool,
}

/// Composite scorer with configurable sub-signal weights
pub struct SignalScorer {
    weights: DefconWeights,
}

impl SignalScorer {
    pub fn new(weights: DefconWeights) -> Self {
        Self { weights }
    }

    /// Weighted composite of the five normalized sub-signals
    pub fn score(&self, news: &NewsSignal, market: &MarketSnapshot) -> ScoreBreakdown {
        let vix = ((market.vix - 15.0) / (40.0 - 15.0)).clamp(0.0, 1.0) * 100.0;
        let yield_dev = ((market.bond_yield_10y - 3.5).abs() / 2.0).clamp(0.0, 1.0) * 100.0;
        let drawdown = (-market.sp500_change_pct / 3.0).clamp(0.0, 1.0) * 100.0;
        let breaking = ((news.breaking_count as f64) * 20.0).min(100.0);

        let w = &self.weights;
        let components = [
            (ReasonCode::NewsScore, w.news * news.score.clamp(0.0, 100.0)),
            (ReasonCode::VixComponent, w.vix * vix),
            (ReasonCode::YieldComponent, w.r#yield * yield_dev),
            (ReasonCode::Sp500Drawdown, w.drawdown * drawdown),
            (ReasonCode::BreakingBias, w.breaking * breaking),
        ];
        let total: f64 = components.iter().map(|(_, v)| v).sum::<f64>().clamp(0.0, 100.0);

        ScoreBreakdown { components, total }
    }

    /// Evaluate one cycle. Transitions are immediate: whatever the score
    /// maps to (after any news override) is the new level.
    pub fn evaluate(
        &self,
        previous: DefconLevel,
        news: &NewsSignal,
        market: &MarketSnapshot,
        now: DateTime<Utc>,
    ) -> DefconEvaluation {
        let breakdown = self.score(news, market);
        let scored_level = DefconLevel::from_score(breakdown.total);

        let (level, reason_code) = match news_override(news) {
            Some(override_level) if override_level.more_severe_than(scored_level) => {
                warn!(
                    %override_level,
                    score = format!("{:.1}", breakdown.total).as_str(),
                    breaking = news.breaking_count,
                    "breaking news override"
                );
                (override_level, ReasonCode::NewsOverride)
            }
            _ => (scored_level, breakdown.dominant()),
        };

        let changed = level != previous;
        if changed {
            info!(
                from = %previous,
                to = %level,
                score = format!("{:.1}", breakdown.total).as_str(),
                reason = %reason_code,
                "DEFCON transition"
            );
        }

        DefconEvaluation {
            state: DefconState {
                level,
                signal_score: breakdown.total,
                entered_at: now,
                reason_code,
            },
            breakdown,
            changed,
        }
    }
}

/// Breaking-news override conditions. Only returns levels more severe
/// than routine scoring would typically produce; the caller applies it
/// only when it lowers the level.
pub fn news_override(news: &NewsSignal) -> Option<DefconLevel> {
    let bearish = news.sentiment.label() == Sentiment::Bearish;
    if news.score >= 90.0 && news.breaking_count >= 3 && bearish {
        Some(DefconLevel::One)
    } else if news.score >= 80.0 && bearish {
        Some(DefconLevel::Two)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrisisType, SentimentDist};
    use std::collections::HashMap;

    fn weights() -> DefconWeights {
        DefconWeights {
            news: 0.40,
            vix: 0.20,
            r#yield: 0.15,
            drawdown: 0.15,
            breaking: 0.10,
        }
    }

    fn news(score: f64, breaking_count: usize) -> NewsSignal {
        NewsSignal {
            cycle_id: 1,
            timestamp: Utc::now(),
            article_count: 10,
            score,
            crisis_type: CrisisType::MarketCorrection,
            sentiment: SentimentDist {
                bearish: 0.5,
                bullish: 0.2,
                neutral: 0.3,
            },
            top_articles: Vec::new(),
            breaking_count,
        }
    }

    fn market(vix: f64, yield_10y: f64, sp500_pct: f64) -> MarketSnapshot {
        MarketSnapshot {
            timestamp: Utc::now(),
            vix,
            bond_yield_10y: yield_10y,
            sp500_change_pct: sp500_pct,
            per_symbol_price: HashMap::new(),
            stale: false,
        }
    }

    #[test]
    fn test_calm_conditions_score_low() {
        let scorer = SignalScorer::new(weights());
        let breakdown = scorer.score(&news(0.0, 0), &market(15.0, 3.5, 0.0));
        assert_eq!(breakdown.total, 0.0);
        assert_eq!(DefconLevel::from_score(breakdown.total), DefconLevel::Five);
    }

    #[test]
    fn test_maximum_stress_scores_one_hundred() {
        let scorer = SignalScorer::new(weights());
        let breakdown = scorer.score(&news(100.0, 5), &market(45.0, 6.0, -5.0));
        assert!((breakdown.total - 100.0).abs() < 1e-9);
        assert_eq!(DefconLevel::from_score(breakdown.total), DefconLevel::One);
    }

    #[test]
    fn test_normalizations() {
        let scorer = SignalScorer::new(weights());
        // VIX 27.5 is halfway through the 15..40 band
        let breakdown = scorer.score(&news(0.0, 0), &market(27.5, 3.5, 0.0));
        let vix = breakdown
            .components
            .iter()
            .find(|(c, _)| *c == ReasonCode::VixComponent)
            .unwrap()
            .1;
        assert!((vix - 0.20 * 50.0).abs() < 1e-9);

        // 1.5% S&P drop is half the 3% drawdown band
        let breakdown = scorer.score(&news(0.0, 0), &market(15.0, 3.5, -1.5));
        let dd = breakdown
            .components
            .iter()
            .find(|(c, _)| *c == ReasonCode::Sp500Drawdown)
            .unwrap()
            .1;
        assert!((dd - 0.15 * 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_bounded_for_extreme_inputs() {
        let scorer = SignalScorer::new(weights());
        for (vix, y, pct, score, breaking) in [
            (-10.0, -5.0, 50.0, 0.0, 0usize),
            (500.0, 50.0, -90.0, 100.0, 1000),
            (0.0, 0.0, 0.0, 55.0, 2),
        ] {
            let breakdown = scorer.score(&news(score, breaking), &market(vix, y, pct));
            assert!((0.0..=100.0).contains(&breakdown.total));
        }
    }

    #[test]
    fn test_reason_code_is_dominant_component() {
        let scorer = SignalScorer::new(weights());
        // Only the VIX is elevated
        let breakdown = scorer.score(&news(0.0, 0), &market(40.0, 3.5, 0.0));
        assert_eq!(breakdown.dominant(), ReasonCode::VixComponent);
    }

    #[test]
    fn test_transition_flag_only_on_change() {
        let scorer = SignalScorer::new(weights());
        let quiet = news(0.0, 0);
        let calm = market(15.0, 3.5, 0.0);
        let eval = scorer.evaluate(DefconLevel::Five, &quiet, &calm, Utc::now());
        assert!(!eval.changed);

        let eval = scorer.evaluate(DefconLevel::Four, &quiet, &calm, Utc::now());
        assert!(eval.changed);
        assert_eq!(eval.state.level, DefconLevel::Five);
    }

    #[test]
    fn test_news_override_forces_severe_level() {
        // Bearish, high score, three breaking articles: DEFCON 1
        let signal = news(95.0, 3);
        assert_eq!(news_override(&signal), Some(DefconLevel::One));

        // High score, bearish, but not enough breaking coverage: DEFCON 2
        let signal = news(85.0, 1);
        assert_eq!(news_override(&signal), Some(DefconLevel::Two));

        // Bullish batches never override
        let mut signal = news(95.0, 3);
        signal.sentiment = SentimentDist {
            bearish: 0.1,
            bullish: 0.8,
            neutral: 0.1,
        };
        assert_eq!(news_override(&signal), None);
    }

    #[test]
    fn test_override_never_relaxes_scored_level() {
        let scorer = SignalScorer::new(weights());
        // Composite already at DEFCON 1; a DEFCON 2 override must not lift it
        let signal = news(100.0, 2); // score >= 80, bearish -> override Two
        let stressed = market(45.0, 6.0, -5.0);
        let eval = scorer.evaluate(DefconLevel::Five, &signal, &stressed, Utc::now());
        assert_eq!(eval.state.level, DefconLevel::One);
        assert_ne!(eval.state.reason_code, ReasonCode::NewsOverride);
    }
}
