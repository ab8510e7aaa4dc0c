//! Alert routing
//!
//! Typed events fan out to two webhook channels: urgent (escalations,
//! approvals, protective exits, command responses) and silent (the
//! audit trail). Transport failures are counted, logged and dropped;
//! delivery is at most once and never blocks the cycle.

use reqwest::Client;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AlertsConfig;
use crate::types::{DefconLevel, ExitReason, NewsSignal, Urgency};
use crate::news::Novelty;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const TITLE_LIMIT: usize = 80;

/// Headline entry in a news update
#[derive(Debug, Clone, Serialize)]
pub struct NewsTopItem {
    pub source: String,
    pub title: String,
    pub urgency: Urgency,
}

/// Outbound alert payloads; field names are stable
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    CycleSummary {
        defcon: u8,
        signal_score: f64,
        vix: f64,
        yield_10y: f64,
        sp500_pct: f64,
        holdings: Vec<String>,
    },
    DefconChange {
        from: u8,
        to: u8,
        signal_score: f64,
        reason_code: String,
    },
    TradeEntry {
        symbols: Vec<String>,
        size: f64,
        defcon: u8,
        pending: bool,
    },
    TradeExit {
        symbol: String,
        reason: String,
        pnl_pct: f64,
    },
    NewsUpdate {
        score: f64,
        crisis_type: String,
        sentiment_label: String,
        article_count: usize,
        new_article_count: usize,
        breaking_count: usize,
        top: Vec<NewsTopItem>,
    },
    CommandResponse {
        verb: String,
        ok: bool,
        message: String,
    },
}

impl AlertEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertEvent::CycleSummary { .. } => "cycle_summary",
            AlertEvent::DefconChange { .. } => "defcon_change",
            AlertEvent::TradeEntry { .. } => "trade_entry",
            AlertEvent::TradeExit { .. } => "trade_exit",
            AlertEvent::NewsUpdate { .. } => "news_update",
            AlertEvent::CommandResponse { .. } => "command_response",
        }
    }

    /// Build a news update from a signal and its novelty verdict.
    /// Returns None when there is nothing new to say.
    pub fn news_update(
        signal: &NewsSignal,
        novelty: Novelty,
        top: Vec<NewsTopItem>,
    ) -> Option<AlertEvent> {
        if novelty.new_count == 0 && signal.breaking_count == 0 {
            return None;
        }
        Some(AlertEvent::NewsUpdate {
            score: signal.score,
            crisis_type: signal.crisis_type.as_str().to_string(),
            sentiment_label: signal.sentiment.label().to_string(),
            article_count: signal.article_count,
            new_article_count: novelty.new_count,
            breaking_count: signal.breaking_count,
            top: top
                .into_iter()
                .map(|mut item| {
                    item.title = truncate(&item.title, TITLE_LIMIT);
                    item
                })
                .collect(),
        })
    }

    /// Urgent-channel membership
    fn is_urgent(&self) -> bool {
        match self {
            AlertEvent::DefconChange { from, to, .. } => to < from,
            AlertEvent::TradeEntry { pending, .. } => *pending,
            AlertEvent::TradeExit { reason, .. } => {
                matches!(
                    ExitReason::parse(reason),
                    Some(ExitReason::StopLoss) | Some(ExitReason::DefconRevert)
                )
            }
            AlertEvent::CommandResponse { .. } => true,
            _ => false,
        }
    }
}

pub fn defcon_change(from: DefconLevel, to: DefconLevel, score: f64, reason: &str) -> AlertEvent {
    AlertEvent::DefconChange {
        from: from.as_u8(),
        to: to.as_u8(),
        signal_score: score,
        reason_code: reason.to_string(),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        text.chars().take(limit).collect()
    }
}

/// Event fanout to the configured channels
pub struct AlertRouter {
    client: Client,
    urgent_endpoint: Option<String>,
    silent_endpoint: Option<String>,
    silent_events: HashSet<String>,
    transport_errors: AtomicU64,
}

impl AlertRouter {
    pub fn new(client: Client, config: &AlertsConfig) -> Self {
        let endpoint = |url: &str| {
            let trimmed = url.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };
        Self {
            client,
            urgent_endpoint: endpoint(&config.urgent.endpoint),
            silent_endpoint: endpoint(&config.silent.endpoint),
            silent_events: config.silent.events.iter().cloned().collect(),
            transport_errors: AtomicU64::new(0),
        }
    }

    /// Fan an event out. Transport problems never propagate.
    pub async fn route(&self, event: &AlertEvent) {
        if event.is_urgent() {
            if let Some(endpoint) = self.urgent_endpoint.clone() {
                self.send(&endpoint, "urgent", event).await;
            }
        }
        if self.silent_events.contains(event.kind()) {
            if let Some(endpoint) = self.silent_endpoint.clone() {
                self.send(&endpoint, "silent", event).await;
            }
        }
    }

    async fn send(&self, endpoint: &str, channel: &str, event: &AlertEvent) {
        let result = self
            .client
            .post(endpoint)
            .timeout(SEND_TIMEOUT)
            .json(event)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(_) => debug!(channel, kind = event.kind(), "alert delivered"),
            Err(err) => {
                self.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel,
                    kind = event.kind(),
                    error = %err,
                    "alert dropped after transport failure"
                );
            }
        }
    }

    pub fn transport_error_count(&self) -> u64 {
        self.transport_errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrisisType, SentimentDist};
    use chrono::Utc;

    fn signal(breaking_count: usize) -> NewsSignal {
        NewsSignal {
            cycle_id: 1,
            timestamp: Utc::now(),
            article_count: 4,
            score: 42.0,
            crisis_type: CrisisType::MarketCorrection,
            sentiment: SentimentDist {
                bearish: 0.5,
                bullish: 0.25,
                neutral: 0.25,
            },
            top_articles: Vec::new(),
            breaking_count,
        }
    }

    #[test]
    fn test_escalations_are_urgent_relaxations_are_not() {
        let escalation = defcon_change(DefconLevel::Four, DefconLevel::Two, 75.0, "news_score");
        assert!(escalation.is_urgent());

        let relaxation = defcon_change(DefconLevel::Two, DefconLevel::Four, 30.0, "news_score");
        assert!(!relaxation.is_urgent());
    }

    #[test]
    fn test_pending_entries_and_protective_exits_are_urgent() {
        let pending = AlertEvent::TradeEntry {
            symbols: vec!["SPY".to_string()],
            size: 10_000.0,
            defcon: 2,
            pending: true,
        };
        assert!(pending.is_urgent());

        let executed = AlertEvent::TradeEntry {
            symbols: vec!["SPY".to_string()],
            size: 10_000.0,
            defcon: 2,
            pending: false,
        };
        assert!(!executed.is_urgent());

        for (reason, urgent) in [
            ("stop_loss", true),
            ("defcon_revert", true),
            ("profit_target", false),
            ("trailing_stop", false),
            ("time_limit", false),
        ] {
            let exit = AlertEvent::TradeExit {
                symbol: "SPY".to_string(),
                reason: reason.to_string(),
                pnl_pct: 0.0,
            };
            assert_eq!(exit.is_urgent(), urgent, "reason {}", reason);
        }
    }

    #[test]
    fn test_news_update_suppressed_without_novelty() {
        let quiet = Novelty {
            new_count: 0,
            novel: false,
        };
        assert!(AlertEvent::news_update(&signal(0), quiet, Vec::new()).is_none());

        // Breaking coverage forces the update through
        assert!(AlertEvent::news_update(&signal(1), quiet, Vec::new()).is_some());

        let fresh = Novelty {
            new_count: 2,
            novel: true,
        };
        assert!(AlertEvent::news_update(&signal(0), fresh, Vec::new()).is_some());
    }

    #[test]
    fn test_payload_field_names_are_stable() {
        let event = AlertEvent::CycleSummary {
            defcon: 3,
            signal_score: 55.5,
            vix: 28.0,
            yield_10y: 4.4,
            sp500_pct: -1.2,
            holdings: vec!["SPY".to_string()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "cycle_summary");
        assert_eq!(json["defcon"], 3);
        assert_eq!(json["signal_score"], 55.5);
        assert_eq!(json["yield_10y"], 4.4);
        assert_eq!(json["holdings"][0], "SPY");

        let exit = AlertEvent::TradeExit {
            symbol: "QQQ".to_string(),
            reason: "trailing_stop".to_string(),
            pnl_pct: 0.077,
        };
        let json = serde_json::to_value(&exit).unwrap();
        assert_eq!(json["event"], "trade_exit");
        assert_eq!(json["reason"], "trailing_stop");
    }

    #[test]
    fn test_news_update_titles_truncated() {
        let long_title = "x".repeat(200);
        let fresh = Novelty {
            new_count: 1,
            novel: true,
        };
        let event = AlertEvent::news_update(
            &signal(0),
            fresh,
            vec![NewsTopItem {
                source: "rss".to_string(),
                title: long_title,
                urgency: Urgency::High,
            }],
        )
        .unwrap();
        if let AlertEvent::NewsUpdate { top, .. } = event {
            assert_eq!(top[0].title.len(), 80);
        } else {
            panic!("expected news update");
        }
    }
}
