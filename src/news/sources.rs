//! News source clients
//!
//! Each source fetches raw articles over HTTP; urgency and relevance
//! labelling happens in the aggregator after parsing. Malformed entries
//! are dropped individually so one bad item never sinks a batch.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::rate_limit::Outcome;
use crate::types::{Article, Urgency};

/// Why a source fetch failed
#[derive(Debug)]
pub enum SourceError {
    RateLimited,
    Timeout,
    Transport(String),
    Malformed(String),
}

impl SourceError {
    /// Classification for the rate limiter
    pub fn outcome(&self) -> Outcome {
        match self {
            SourceError::RateLimited => Outcome::RateLimited,
            _ => Outcome::OtherError,
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::RateLimited => write!(f, "rate limited"),
            SourceError::Timeout => write!(f, "timed out"),
            SourceError::Transport(e) => write!(f, "transport: {}", e),
            SourceError::Malformed(e) => write!(f, "malformed payload: {}", e),
        }
    }
}

fn classify(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
        SourceError::RateLimited
    } else {
        SourceError::Transport(err.to_string())
    }
}

/// A single configurable news source
#[async_trait]
pub trait NewsSource: Send + Sync {
    fn name(&self) -> &str;
    /// Key under which this source is paced by the rate limiter
    fn rate_limiter_key(&self) -> &str;
    async fn fetch(&self) -> Result<Vec<Article>, SourceError>;
}

// ── Alpha Vantage ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AvResponse {
    #[serde(default)]
    feed: Vec<AvItem>,
    /// Present when the free tier throttles the key
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AvItem {
    title: Option<String>,
    url: Option<String>,
    time_published: Option<String>,
    summary: Option<String>,
}

/// Alpha Vantage NEWS_SENTIMENT client
pub struct AlphaVantageSource {
    client: Client,
    endpoint: String,
    api_key: String,
    topics: String,
}

impl AlphaVantageSource {
    pub fn new(client: Client, endpoint: &str, api_key: &str, topics: &[String]) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            topics: topics.join(","),
        }
    }

    fn parse_item(item: AvItem, fetched_at: DateTime<Utc>) -> Option<Article> {
        let title = item.title?;
        let url = item.url?;
        if title.trim().is_empty() || url.trim().is_empty() {
            return None;
        }
        let published_at = item
            .time_published
            .as_deref()
            .and_then(|t| NaiveDateTime::parse_from_str(t, "%Y%m%dT%H%M%S").ok())
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(fetched_at);

        Some(Article {
            id: Article::stable_id(&url),
            source: "alpha_vantage".to_string(),
            title,
            url,
            published_at,
            fetched_at,
            raw_text: item.summary.unwrap_or_default(),
            relevance: 0.0,
            urgency: Urgency::Routine,
        })
    }
}

#[async_trait]
impl NewsSource for AlphaVantageSource {
    fn name(&self) -> &str {
        "alpha_vantage"
    }

    fn rate_limiter_key(&self) -> &str {
        "alpha_vantage"
    }

    async fn fetch(&self) -> Result<Vec<Article>, SourceError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("function", "NEWS_SENTIMENT"),
                ("topics", self.topics.as_str()),
                ("apikey", self.api_key.as_str()),
                ("limit", "50"),
            ])
            .send()
            .await
            .map_err(classify)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited);
        }
        let response = response.error_for_status().map_err(classify)?;

        let body: AvResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        if body.note.is_some() {
            // The free tier signals throttling with HTTP 200 + "Note"
            return Err(SourceError::RateLimited);
        }
        if let Some(message) = body.error_message {
            return Err(SourceError::Malformed(message));
        }

        let fetched_at = Utc::now();
        let articles: Vec<Article> = body
            .feed
            .into_iter()
            .filter_map(|item| Self::parse_item(item, fetched_at))
            .collect();
        info!(count = articles.len(), "fetched Alpha Vantage articles");
        Ok(articles)
    }
}

// ── RSS feeds ───────────────────────────────────────────────────

/// Single RSS feed client.
///
/// No XML dependency: a lenient tag scanner pulls
/// `<item>` / `<title>` / `<link>` / `<pubDate>` / `<description>`,
/// and entries missing a title or link are dropped like any other
/// malformed upstream payload.
pub struct RssFeedSource {
    client: Client,
    feed_url: String,
    label: String,
}

impl RssFeedSource {
    pub fn new(client: Client, feed_url: &str) -> Self {
        let label = feed_url
            .split('/')
            .find(|part| part.contains('.'))
            .unwrap_or("feed")
            .to_string();
        Self {
            client,
            feed_url: feed_url.to_string(),
            label: format!("rss-{}", label),
        }
    }

    fn parse_feed(&self, body: &str, fetched_at: DateTime<Utc>) -> Vec<Article> {
        let mut articles = Vec::new();
        let mut rest = body;

        while let Some(start) = rest.find("<item") {
            let Some(offset) = rest[start..].find('>') else {
                break;
            };
            let after_open = &rest[start + offset + 1..];
            let Some(end) = after_open.find("</item>") else {
                break;
            };
            let block = &after_open[..end];
            rest = &after_open[end + 7..];

            let title = tag_text(block, "title");
            let link = tag_text(block, "link");
            let (Some(title), Some(url)) = (title, link) else {
                debug!(feed = %self.feed_url, "skipping RSS item without title/link");
                continue;
            };
            if title.trim().is_empty() || url.trim().is_empty() {
                continue;
            }

            let published_at = tag_text(block, "pubDate")
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(fetched_at);

            articles.push(Article {
                id: Article::stable_id(&url),
                source: self.label.clone(),
                title,
                url,
                published_at,
                fetched_at,
                raw_text: tag_text(block, "description").unwrap_or_default(),
                relevance: 0.0,
                urgency: Urgency::Routine,
            });
        }
        articles
    }
}

#[async_trait]
impl NewsSource for RssFeedSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn rate_limiter_key(&self) -> &str {
        "rss"
    }

    async fn fetch(&self) -> Result<Vec<Article>, SourceError> {
        let response = self
            .client
            .get(&self.feed_url)
            .send()
            .await
            .map_err(classify)?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited);
        }
        let response = response.error_for_status().map_err(classify)?;
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        let articles = self.parse_feed(&body, Utc::now());
        info!(feed = %self.feed_url, count = articles.len(), "fetched RSS articles");
        Ok(articles)
    }
}

/// Extract the text of the first `<tag>...</tag>` in a block,
/// unwrapping CDATA and decoding the common entities.
fn tag_text(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let start = block.find(&open)?;
    let content_start = start + block[start..].find('>')? + 1;
    let content_end = content_start + block[content_start..].find(&close)?;
    let raw = block[content_start..content_end].trim();

    let inner = raw
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .unwrap_or(raw);

    Some(
        inner
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .trim()
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rss_item_extraction() {
        let feed = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>Test Feed</title>
<item>
  <title><![CDATA[Markets plunge on rate fears]]></title>
  <link>https://example.com/a</link>
  <pubDate>Mon, 10 Feb 2026 10:00:00 GMT</pubDate>
  <description>Stocks fell sharply &amp; yields spiked.</description>
</item>
<item>
  <title>Second story</title>
  <link>https://example.com/b</link>
</item>
<item>
  <link>https://example.com/missing-title</link>
</item>
</channel></rss>"#;

        let source = RssFeedSource::new(Client::new(), "https://example.com/rss");
        let articles = source.parse_feed(feed, Utc::now());
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "Markets plunge on rate fears");
        assert_eq!(articles[0].raw_text, "Stocks fell sharply & yields spiked.");
        assert_eq!(articles[0].published_at.to_rfc3339(), "2026-02-10T10:00:00+00:00");
        assert_eq!(articles[1].title, "Second story");
    }

    #[test]
    fn test_rss_garbage_yields_empty() {
        let source = RssFeedSource::new(Client::new(), "https://example.com/rss");
        assert!(source.parse_feed("not xml at all", Utc::now()).is_empty());
        assert!(source.parse_feed("<item><title>unclosed", Utc::now()).is_empty());
    }

    #[test]
    fn test_alpha_vantage_item_parsing() {
        let fetched = Utc::now();
        let item = AvItem {
            title: Some("Fed hikes".to_string()),
            url: Some("https://example.com/fed".to_string()),
            time_published: Some("20260210T100000".to_string()),
            summary: Some("The Fed raised rates.".to_string()),
        };
        let article = AlphaVantageSource::parse_item(item, fetched).unwrap();
        assert_eq!(article.source, "alpha_vantage");
        assert_eq!(article.published_at.to_rfc3339(), "2026-02-10T10:00:00+00:00");

        let missing_url = AvItem {
            title: Some("x".to_string()),
            url: None,
            time_published: None,
            summary: None,
        };
        assert!(AlphaVantageSource::parse_item(missing_url, fetched).is_none());
    }
}
