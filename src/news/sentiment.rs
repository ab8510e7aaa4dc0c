//! Keyword-driven article classification
//!
//! Assigns sentiment, urgency tier, crisis family and relevance to each
//! article from configurable lexicons, and aggregates a batch into a
//! sentiment distribution with a dominant crisis type.

use std::collections::HashMap;

use crate::config::NewsConfig;
use crate::types::{Article, CrisisType, Sentiment, SentimentDist, Urgency};

/// Per-article classification result
#[derive(Debug, Clone)]
pub struct ArticleAnalysis {
    pub crisis_type: CrisisType,
    pub sentiment: Sentiment,
    pub urgency: Urgency,
    /// Crisis-match confidence in [0, 100]
    pub confidence: f64,
    pub sentiment_score: f64,
}

/// Batch-level aggregate
#[derive(Debug, Clone)]
pub struct BatchAnalysis {
    pub results: Vec<ArticleAnalysis>,
    pub sentiment: SentimentDist,
    pub dominant_crisis: CrisisType,
    pub breaking_count: usize,
    pub avg_confidence: f64,
}

impl BatchAnalysis {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            sentiment: SentimentDist::default(),
            dominant_crisis: CrisisType::None,
            breaking_count: 0,
            avg_confidence: 0.0,
        }
    }
}

/// Lexicon-based analyzer; all keyword sets come from configuration
pub struct SentimentAnalyzer {
    breaking_keywords: Vec<String>,
    high_keywords: Vec<String>,
    relevance_lexicon: Vec<String>,
    bearish_keywords: Vec<String>,
    bullish_keywords: Vec<String>,
    crisis_patterns: Vec<(CrisisType, Vec<String>)>,
}

impl SentimentAnalyzer {
    pub fn new(config: &NewsConfig) -> Self {
        let lower = |v: &[String]| -> Vec<String> { v.iter().map(|s| s.to_lowercase()).collect() };

        let mut crisis_patterns = Vec::new();
        for (name, keywords) in &config.crisis_patterns {
            if let Some(crisis_type) = CrisisType::parse(name) {
                crisis_patterns.push((crisis_type, lower(keywords)));
            }
        }
        // Stable iteration order for deterministic tie-breaks
        crisis_patterns.sort_by_key(|(t, _)| t.as_str());

        Self {
            breaking_keywords: lower(&config.keywords.breaking),
            high_keywords: lower(&config.keywords.high),
            relevance_lexicon: lower(&config.relevance_lexicon),
            bearish_keywords: lower(&config.bearish_keywords),
            bullish_keywords: lower(&config.bullish_keywords),
            crisis_patterns,
        }
    }

    /// Relevance in [0, 1] from lexicon overlap
    pub fn relevance(&self, title: &str, body: &str) -> f64 {
        let text = format!("{} {}", title.to_lowercase(), body.to_lowercase());
        let hits = self
            .relevance_lexicon
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .count();
        (hits as f64 / 5.0).min(1.0)
    }

    /// Urgency tier by keyword match
    pub fn urgency(&self, title: &str, body: &str) -> Urgency {
        let text = format!("{} {}", title.to_lowercase(), body.to_lowercase());
        if self.breaking_keywords.iter().any(|kw| text.contains(kw.as_str())) {
            Urgency::Breaking
        } else if self.high_keywords.iter().any(|kw| text.contains(kw.as_str())) {
            Urgency::High
        } else {
            Urgency::Routine
        }
    }

    /// Classify one article. The title is weighted three times against
    /// the body so headline keywords dominate.
    pub fn analyze_article(&self, article: &Article) -> ArticleAnalysis {
        let title = article.title.to_lowercase();
        let body = article.raw_text.to_lowercase();
        let combined = format!("{} {} {} {}", title, title, title, body);

        let (crisis_type, confidence) = self.match_crisis(&combined);
        let (sentiment, sentiment_score) = self.sentiment(&combined);

        ArticleAnalysis {
            crisis_type,
            sentiment,
            urgency: article.urgency,
            confidence,
            sentiment_score,
        }
    }

    /// Aggregate a batch: normalized sentiment distribution, dominant
    /// crisis family, breaking count.
    pub fn analyze_batch(&self, articles: &[Article]) -> BatchAnalysis {
        if articles.is_empty() {
            return BatchAnalysis::empty();
        }

        let results: Vec<ArticleAnalysis> =
            articles.iter().map(|a| self.analyze_article(a)).collect();

        let total = results.len() as f64;
        let mut bearish = 0usize;
        let mut bullish = 0usize;
        let mut neutral = 0usize;
        let mut crisis_counts: HashMap<CrisisType, usize> = HashMap::new();
        let mut breaking_count = 0usize;
        let mut confidence_sum = 0.0;

        for result in &results {
            match result.sentiment {
                Sentiment::Bearish => bearish += 1,
                Sentiment::Bullish => bullish += 1,
                Sentiment::Neutral => neutral += 1,
            }
            if result.crisis_type != CrisisType::None {
                *crisis_counts.entry(result.crisis_type).or_insert(0) += 1;
            }
            if result.urgency == Urgency::Breaking {
                breaking_count += 1;
            }
            confidence_sum += result.confidence;
        }

        let dominant_crisis = crisis_counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.as_str().cmp(a.0.as_str())))
            .map(|(t, _)| t)
            .unwrap_or(CrisisType::None);

        BatchAnalysis {
            sentiment: SentimentDist {
                bearish: bearish as f64 / total,
                bullish: bullish as f64 / total,
                neutral: neutral as f64 / total,
            },
            dominant_crisis,
            breaking_count,
            avg_confidence: confidence_sum / total,
            results,
        }
    }

    /// Best-matching crisis family and a confidence in [0, 100]
    fn match_crisis(&self, text: &str) -> (CrisisType, f64) {
        let mut best = (CrisisType::None, 0.0);
        for (crisis_type, keywords) in &self.crisis_patterns {
            let matched = keywords
                .iter()
                .filter(|kw| text.contains(kw.as_str()))
                .count();
            if matched == 0 {
                continue;
            }
            // Repeated headline weighting means every hit counts thrice;
            // score on distinct keyword families instead
            let score = ((matched * 25) as f64).min(100.0);
            if score > best.1 {
                best = (*crisis_type, score);
            }
        }
        best
    }

    /// Sentiment score in [-100, 100] and its label; ±20 neutral band
    fn sentiment(&self, text: &str) -> (Sentiment, f64) {
        let bearish = self
            .bearish_keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .count() as f64;
        let bullish = self
            .bullish_keywords
            .iter()
            .filter(|kw| text.contains(kw.as_str()))
            .count() as f64;

        let word_count = text.split_whitespace().count();
        if word_count == 0 {
            return (Sentiment::Neutral, 0.0);
        }

        let score = ((bullish - bearish) / (word_count as f64 * 0.01).max(1.0)) * 100.0;
        let score = score.clamp(-100.0, 100.0);

        let label = if score < -20.0 {
            Sentiment::Bearish
        } else if score > 20.0 {
            Sentiment::Bullish
        } else {
            Sentiment::Neutral
        };
        (label, score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use chrono::Utc;

    fn analyzer() -> SentimentAnalyzer {
        let cfg = AppConfig::load().unwrap();
        SentimentAnalyzer::new(&cfg.news)
    }

    fn make_article(title: &str, body: &str, urgency: Urgency) -> Article {
        let now = Utc::now();
        Article {
            id: Article::stable_id(title),
            source: "test".to_string(),
            title: title.to_string(),
            url: format!("http://test/{}", title.len()),
            published_at: now,
            fetched_at: now,
            raw_text: body.to_string(),
            relevance: 0.5,
            urgency,
        }
    }

    #[test]
    fn test_urgency_tiers() {
        let a = analyzer();
        assert_eq!(a.urgency("Markets crash on emergency Fed move", ""), Urgency::Breaking);
        assert_eq!(a.urgency("Analysts issue recession warning", ""), Urgency::High);
        assert_eq!(a.urgency("Quarterly dividend declared", ""), Urgency::Routine);
    }

    #[test]
    fn test_relevance_from_lexicon_overlap() {
        let a = analyzer();
        let high = a.relevance(
            "Fed inflation fears push treasury yield higher",
            "market stocks economy recession",
        );
        let low = a.relevance("Local bakery wins award", "pastries were delicious");
        assert!(high > low);
        assert!(low < 0.2);
        assert!((0.0..=1.0).contains(&high));
    }

    #[test]
    fn test_crisis_family_matching() {
        let a = analyzer();
        let article = make_article(
            "Fed tightening sparks inflation and rate fears",
            "cpi print forces the fed toward faster tightening",
            Urgency::High,
        );
        let result = a.analyze_article(&article);
        assert_eq!(result.crisis_type, CrisisType::InflationRate);
        assert!(result.confidence > 0.0);
    }

    #[test]
    fn test_bearish_sentiment_detected() {
        let a = analyzer();
        let article = make_article(
            "Markets plunge as panic selling accelerates",
            "crash fears deepen the selloff and the decline",
            Urgency::Breaking,
        );
        let result = a.analyze_article(&article);
        assert_eq!(result.sentiment, Sentiment::Bearish);
        assert!(result.sentiment_score < 0.0);
    }

    #[test]
    fn test_batch_distribution_sums_to_one() {
        let a = analyzer();
        let batch = vec![
            make_article("Markets plunge in panic crash", "selloff decline fear", Urgency::Breaking),
            make_article("Stocks rally on strong growth", "surge gain optimism", Urgency::Routine),
            make_article("Index unchanged in quiet session", "volumes were average", Urgency::Routine),
        ];
        let result = a.analyze_batch(&batch);
        let sum = result.sentiment.bearish + result.sentiment.bullish + result.sentiment.neutral;
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(result.breaking_count, 1);
    }

    #[test]
    fn test_empty_batch() {
        let a = analyzer();
        let result = a.analyze_batch(&[]);
        assert_eq!(result.dominant_crisis, CrisisType::None);
        assert_eq!(result.breaking_count, 0);
    }
}
