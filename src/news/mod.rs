//! News aggregation pipeline
//!
//! Fetches from every enabled source in parallel, labels urgency and
//! relevance, runs two-phase deduplication, caches the deduped batch
//! per cycle, builds the cycle's NewsSignal and detects novelty against
//! the last persisted signal.

pub mod dedup;
pub mod sentiment;
pub mod sources;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use crate::persistence::Store;
use crate::rate_limit::{Outcome, RateLimiter};
use crate::types::{hex_prefix, Article, NewsSignal, Urgency};
use dedup::Deduplicator;
use sentiment::SentimentAnalyzer;
use sources::NewsSource;

/// Hard bound on a single source round-trip
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Rate-limited attempts per source per cycle before skipping
const MAX_FETCH_ATTEMPTS: u32 = 3;
/// Deduped batch cache lifetime
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Novelty verdict for a cycle's batch
#[derive(Debug, Clone, Copy)]
pub struct Novelty {
    /// Articles not present in the previous persisted signal
    pub new_count: usize,
    pub novel: bool,
}

struct CachedBatch {
    stored_at: Instant,
    articles: Vec<Article>,
}

/// Multi-source news aggregator
pub struct NewsAggregator {
    sources: Vec<Arc<dyn NewsSource>>,
    rate_limiter: Arc<RateLimiter>,
    deduplicator: Deduplicator,
    analyzer: SentimentAnalyzer,
    store: Arc<Store>,
    cache: Mutex<HashMap<(u64, String), CachedBatch>>,
    /// Identifies the enabled source set for cache keying
    source_set_hash: String,
}

impl NewsAggregator {
    pub fn new(
        sources: Vec<Arc<dyn NewsSource>>,
        rate_limiter: Arc<RateLimiter>,
        deduplicator: Deduplicator,
        analyzer: SentimentAnalyzer,
        store: Arc<Store>,
    ) -> Self {
        let mut names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        let digest = Sha256::digest(names.join(",").as_bytes());
        let source_set_hash = hex_prefix(&digest, 8);

        Self {
            sources,
            rate_limiter,
            deduplicator,
            analyzer,
            store,
            cache: Mutex::new(HashMap::new()),
            source_set_hash,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Fetch, label and dedupe this cycle's batch. Source failures are
    /// contained: a failed source contributes an empty slice.
    pub async fn fetch_cycle(&self, cycle_id: u64) -> Vec<Article> {
        let cache_key = (cycle_id, self.source_set_hash.clone());
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&cache_key) {
                if cached.stored_at.elapsed() < CACHE_TTL {
                    return cached.articles.clone();
                }
            }
        }

        let fetches = self
            .sources
            .iter()
            .map(|source| self.fetch_source(Arc::clone(source)));
        let raw: Vec<Article> = join_all(fetches).await.into_iter().flatten().collect();

        let labelled: Vec<Article> = raw
            .into_iter()
            .map(|mut article| {
                article.urgency = self.analyzer.urgency(&article.title, &article.raw_text);
                article.relevance = self.analyzer.relevance(&article.title, &article.raw_text);
                article
            })
            .collect();

        let deduped = self.deduplicator.dedupe(labelled);

        let mut cache = self.cache.lock().await;
        cache.retain(|_, batch| batch.stored_at.elapsed() < CACHE_TTL);
        cache.insert(
            cache_key,
            CachedBatch {
                stored_at: Instant::now(),
                articles: deduped.clone(),
            },
        );
        deduped
    }

    /// One source: acquire, fetch with the hard timeout, record the
    /// outcome; retry rate-limited responses a bounded number of times.
    async fn fetch_source(&self, source: Arc<dyn NewsSource>) -> Vec<Article> {
        let key = source.rate_limiter_key().to_string();
        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            self.rate_limiter.acquire(&key).await;

            let result = match timeout(FETCH_TIMEOUT, source.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(sources::SourceError::Timeout),
            };

            match result {
                Ok(articles) => {
                    self.rate_limiter.record(&key, Outcome::Ok).await;
                    return articles;
                }
                Err(err) => {
                    self.rate_limiter.record(&key, err.outcome()).await;
                    match err {
                        sources::SourceError::RateLimited => {
                            if attempt < MAX_FETCH_ATTEMPTS {
                                warn!(source = source.name(), attempt, "rate limited, retrying");
                            }
                        }
                        other => {
                            warn!(source = source.name(), error = %other, "source skipped this cycle");
                            return Vec::new();
                        }
                    }
                }
            }
        }
        warn!(source = source.name(), "rate limited on every attempt, skipping");
        Vec::new()
    }

    /// Build the cycle's NewsSignal from a deduped batch
    pub fn build_signal(
        &self,
        cycle_id: u64,
        articles: &[Article],
        now: DateTime<Utc>,
    ) -> NewsSignal {
        let batch = self.analyzer.analyze_batch(articles);

        // Per-article contribution: crisis confidence x urgency weight
        // x 24h linear recency decay, bearish news weighted 1.2x.
        let mut score = 0.0;
        let mut ranked: Vec<(f64, &str)> = Vec::with_capacity(articles.len());
        for (article, result) in articles.iter().zip(batch.results.iter()) {
            let age_hours = (now - article.published_at).num_seconds().max(0) as f64 / 3600.0;
            let recency = (1.0 - age_hours / 24.0).max(0.0);
            let sentiment_multiplier = match result.sentiment {
                crate::types::Sentiment::Bearish => 1.2,
                _ => 1.0,
            };
            let weight = result.confidence * article.urgency.score_weight();
            score += weight * recency * sentiment_multiplier;
            ranked.push((weight, article.id.as_str()));
        }
        let score = (score / 10.0).min(100.0);

        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let top_articles: Vec<String> = ranked
            .into_iter()
            .take(5)
            .map(|(_, id)| id.to_string())
            .collect();

        info!(
            cycle_id,
            score = format!("{:.1}", score).as_str(),
            articles = articles.len(),
            breaking = batch.breaking_count,
            crisis = %batch.dominant_crisis,
            "news signal built"
        );

        NewsSignal {
            cycle_id,
            timestamp: now,
            article_count: articles.len(),
            score,
            crisis_type: batch.dominant_crisis,
            sentiment: batch.sentiment,
            top_articles,
            breaking_count: batch.breaking_count,
        }
    }

    /// Compare the current batch against the last persisted signal.
    ///
    /// Breaking articles force novelty; a store read failure fails safe
    /// (notify rather than silently drop).
    pub async fn detect_novelty(&self, articles: &[Article]) -> Novelty {
        let has_breaking = articles.iter().any(|a| a.urgency == Urgency::Breaking);

        let previous = match self.store.latest_news_signal().await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(error = %err, "novelty baseline read failed, assuming novel");
                return Novelty {
                    new_count: articles.len(),
                    novel: true,
                };
            }
        };

        let new_count = match previous {
            None => articles.len(),
            Some(signal) => {
                let known: HashSet<&str> =
                    signal.top_articles.iter().map(String::as_str).collect();
                articles
                    .iter()
                    .filter(|a| !known.contains(a.id.as_str()))
                    .count()
            }
        };

        Novelty {
            new_count,
            novel: new_count > 0 || has_breaking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::types::CrisisType;
    use chrono::Utc;

    async fn aggregator_with_store() -> (NewsAggregator, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            Store::open(dir.path().join("test.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let cfg = AppConfig::load().unwrap();
        let aggregator = NewsAggregator::new(
            Vec::new(),
            Arc::new(RateLimiter::new()),
            Deduplicator::new(0.6, 200),
            SentimentAnalyzer::new(&cfg.news),
            Arc::clone(&store),
        );
        (aggregator, store, dir)
    }

    fn make_article(id: &str, urgency: Urgency) -> Article {
        let now = Utc::now();
        Article {
            id: id.to_string(),
            source: "test".to_string(),
            title: format!("article {}", id),
            url: format!("http://test/{}", id),
            published_at: now,
            fetched_at: now,
            raw_text: String::new(),
            relevance: 0.5,
            urgency,
        }
    }

    #[tokio::test]
    async fn test_novelty_suppressed_when_batch_unchanged() {
        let (aggregator, store, _dir) = aggregator_with_store().await;

        let articles = vec![
            make_article("a1", Urgency::Routine),
            make_article("a2", Urgency::Routine),
            make_article("a3", Urgency::Routine),
        ];
        let signal = aggregator.build_signal(1, &articles, Utc::now());
        store.insert_news_signal(&signal).await.unwrap();

        let novelty = aggregator.detect_novelty(&articles).await;
        assert_eq!(novelty.new_count, 0);
        assert!(!novelty.novel);
    }

    #[tokio::test]
    async fn test_breaking_forces_novelty() {
        let (aggregator, store, _dir) = aggregator_with_store().await;

        let mut articles = vec![
            make_article("a1", Urgency::Routine),
            make_article("a2", Urgency::Routine),
            make_article("a3", Urgency::Routine),
        ];
        let signal = aggregator.build_signal(1, &articles, Utc::now());
        store.insert_news_signal(&signal).await.unwrap();

        articles[0].urgency = Urgency::Breaking;
        let novelty = aggregator.detect_novelty(&articles).await;
        assert_eq!(novelty.new_count, 0);
        assert!(novelty.novel);
    }

    #[tokio::test]
    async fn test_first_signal_all_articles_new() {
        let (aggregator, _store, _dir) = aggregator_with_store().await;
        let articles = vec![
            make_article("a1", Urgency::Routine),
            make_article("a2", Urgency::Routine),
        ];
        let novelty = aggregator.detect_novelty(&articles).await;
        assert_eq!(novelty.new_count, 2);
        assert!(novelty.novel);
    }

    #[tokio::test]
    async fn test_signal_score_in_range_and_top_capped() {
        let (aggregator, _store, _dir) = aggregator_with_store().await;
        let articles: Vec<Article> = (0..12)
            .map(|i| {
                let mut a = make_article(&format!("a{}", i), Urgency::Breaking);
                a.title = "Markets crash in panic selloff emergency".to_string();
                a
            })
            .collect();
        let signal = aggregator.build_signal(7, &articles, Utc::now());
        assert!((0.0..=100.0).contains(&signal.score));
        assert!(signal.top_articles.len() <= 5);
        assert_eq!(signal.breaking_count, 12);
        assert_ne!(signal.crisis_type, CrisisType::InflationRate);
    }

    #[tokio::test]
    async fn test_empty_batch_signal() {
        let (aggregator, _store, _dir) = aggregator_with_store().await;
        let signal = aggregator.build_signal(3, &[], Utc::now());
        assert_eq!(signal.score, 0.0);
        assert_eq!(signal.article_count, 0);
        assert_eq!(signal.crisis_type, CrisisType::None);
        assert!(signal.top_articles.is_empty());
    }
}
