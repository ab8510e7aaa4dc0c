//! Two-phase article deduplication
//!
//! Phase 1 drops exact duplicates by normalized URL or title. Phase 2
//! builds batch-local TF-IDF vectors over `title + leading body tokens`,
//! clusters pairs with cosine similarity at or above the threshold by
//! transitive closure, and keeps one article per cluster. Transitive
//! closure makes the pass idempotent: no two retained articles can sit
//! at or above the threshold.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::types::Article;

/// Content-similarity deduplicator
pub struct Deduplicator {
    similarity_threshold: f64,
    body_token_limit: usize,
    stopwords: HashSet<&'static str>,
}

impl Deduplicator {
    pub fn new(similarity_threshold: f64, body_token_limit: usize) -> Self {
        Self {
            similarity_threshold,
            body_token_limit,
            stopwords: stopwords(),
        }
    }

    /// Run both phases. Output is a subset of input in input order.
    /// Degenerate batches (zero or one article) pass through unchanged.
    pub fn dedupe(&self, articles: Vec<Article>) -> Vec<Article> {
        if articles.len() < 2 {
            return articles;
        }
        let input_len = articles.len();
        let hashed = self.dedupe_exact(articles);
        let after_hash = hashed.len();
        let retained = self.dedupe_content(hashed);
        if retained.len() < input_len {
            info!(
                input = input_len,
                after_hash,
                retained = retained.len(),
                "deduplication pass"
            );
        }
        retained
    }

    /// Phase 1: drop articles whose normalized URL or normalized title
    /// exactly matches a previously retained article in the batch.
    pub fn dedupe_exact(&self, articles: Vec<Article>) -> Vec<Article> {
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut seen_titles: HashSet<String> = HashSet::new();
        let mut retained = Vec::with_capacity(articles.len());

        for article in articles {
            let url_key = normalize(&article.url);
            let title_key = normalize(&article.title);
            if seen_urls.contains(&url_key) || seen_titles.contains(&title_key) {
                debug!(id = %article.id, title = %article.title, "dropped exact duplicate");
                continue;
            }
            seen_urls.insert(url_key);
            seen_titles.insert(title_key);
            retained.push(article);
        }
        retained
    }

    /// Phase 2: TF-IDF cosine clustering with per-cluster keeper choice.
    pub fn dedupe_content(&self, articles: Vec<Article>) -> Vec<Article> {
        let n = articles.len();
        if n < 2 {
            return articles;
        }

        let vectors: Vec<HashMap<String, f64>> = {
            let token_lists: Vec<Vec<String>> = articles
                .iter()
                .map(|a| self.document_tokens(a))
                .collect();
            tf_idf(&token_lists)
        };

        let mut uf = UnionFind::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                let sim = cosine(&vectors[i], &vectors[j]);
                if sim >= self.similarity_threshold {
                    uf.union(i, j);
                }
            }
        }

        // One keeper per cluster: max relevance, then earliest published,
        // then lexicographic id.
        let mut keeper_of_root: HashMap<usize, usize> = HashMap::new();
        for (idx, article) in articles.iter().enumerate() {
            let root = uf.find(idx);
            match keeper_of_root.get(&root) {
                None => {
                    keeper_of_root.insert(root, idx);
                }
                Some(&best) => {
                    if better_keeper(article, &articles[best]) {
                        keeper_of_root.insert(root, idx);
                    }
                }
            }
        }

        let keep: HashSet<usize> = keeper_of_root.values().copied().collect();
        articles
            .into_iter()
            .enumerate()
            .filter_map(|(idx, a)| if keep.contains(&idx) { Some(a) } else { None })
            .collect()
    }

    /// Title tokens plus the leading body tokens
    fn document_tokens(&self, article: &Article) -> Vec<String> {
        let mut tokens = self.tokenize(&article.title);
        let body: Vec<String> = self
            .tokenize(&article.raw_text)
            .into_iter()
            .take(self.body_token_limit)
            .collect();
        tokens.extend(body);
        tokens
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 2 && !self.stopwords.contains(t))
            .map(str::to_string)
            .collect()
    }
}

/// True when `candidate` beats `incumbent` as a cluster keeper
fn better_keeper(candidate: &Article, incumbent: &Article) -> bool {
    if candidate.relevance != incumbent.relevance {
        return candidate.relevance > incumbent.relevance;
    }
    if candidate.published_at != incumbent.published_at {
        return candidate.published_at < incumbent.published_at;
    }
    candidate.id < incumbent.id
}

/// Lowercase, strip punctuation, collapse whitespace
fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// TF-IDF weights per document; IDF is computed over this batch only
fn tf_idf(token_lists: &[Vec<String>]) -> Vec<HashMap<String, f64>> {
    let n = token_lists.len() as f64;

    let mut df: HashMap<&str, usize> = HashMap::new();
    for tokens in token_lists {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for token in unique {
            *df.entry(token).or_insert(0) += 1;
        }
    }

    token_lists
        .iter()
        .map(|tokens| {
            let total = tokens.len() as f64;
            if total == 0.0 {
                return HashMap::new();
            }
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for token in tokens {
                *counts.entry(token.as_str()).or_insert(0) += 1;
            }
            counts
                .into_iter()
                .map(|(token, count)| {
                    let tf = count as f64 / total;
                    let idf = (n / (1.0 + df[token] as f64)).ln() + 1.0;
                    (token.to_string(), tf * idf)
                })
                .collect()
        })
        .collect()
}

/// Cosine similarity between two sparse vectors
fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(token, wa)| large.get(token).map(|wb| wa * wb))
        .sum();
    if dot == 0.0 {
        return 0.0;
    }
    let mag_a: f64 = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let mag_b: f64 = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

fn stopwords() -> HashSet<&'static str> {
    [
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one", "our",
        "out", "has", "had", "have", "been", "being", "this", "that", "these", "those", "with",
        "from", "into", "during", "will", "would", "should", "could", "may", "might", "about",
        "through", "they", "them", "their", "what", "which", "who", "when", "where", "why", "how",
        "each", "every", "both", "few", "more", "most", "some", "such", "nor", "only", "same",
        "than", "too", "very", "just", "now", "after", "before", "over", "under",
    ]
    .into_iter()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Urgency;
    use chrono::{TimeZone, Utc};

    fn make_article(id: &str, title: &str, url: &str, relevance: f64, minute: u32) -> Article {
        let published = Utc.with_ymd_and_hms(2026, 2, 10, 10, minute, 0).unwrap();
        Article {
            id: id.to_string(),
            source: "test".to_string(),
            title: title.to_string(),
            url: url.to_string(),
            published_at: published,
            fetched_at: published,
            raw_text: String::new(),
            relevance,
            urgency: Urgency::Routine,
        }
    }

    #[test]
    fn test_degenerate_batches_pass_through() {
        let dedup = Deduplicator::new(0.6, 200);
        assert!(dedup.dedupe(vec![]).is_empty());

        let single = vec![make_article("a", "Markets rally", "http://x/1", 0.5, 0)];
        assert_eq!(dedup.dedupe(single).len(), 1);
    }

    #[test]
    fn test_exact_url_and_title_dedupe() {
        let dedup = Deduplicator::new(0.6, 200);
        let batch = vec![
            make_article("a", "Fed raises rates", "http://x/1", 0.5, 0),
            // Same URL modulo case and punctuation
            make_article("b", "Totally different words here", "HTTP://X/1", 0.9, 1),
            // Same title modulo punctuation
            make_article("c", "Fed raises rates!", "http://x/3", 0.9, 2),
            make_article("d", "Oil futures climb on supply data", "http://x/4", 0.4, 3),
        ];
        let out = dedup.dedupe_exact(batch);
        let ids: Vec<&str> = out.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[test]
    fn test_cluster_keeps_max_relevance_then_earliest() {
        let dedup = Deduplicator::new(0.6, 200);
        // Same token multiset in different orders: phase 1 passes them,
        // phase 2 sees pairwise similarity 1.0.
        let batch = vec![
            make_article(
                "a",
                "fed raises interest rates combat surging inflation",
                "http://x/1",
                0.4,
                0,
            ),
            make_article(
                "b",
                "interest rates surging: fed raises combat inflation",
                "http://x/2",
                0.9,
                2,
            ),
            make_article(
                "c",
                "combat inflation surging, fed raises interest rates",
                "http://x/3",
                0.9,
                1,
            ),
        ];
        let out = dedup.dedupe(batch);
        assert_eq!(out.len(), 1);
        // Relevance ties between b and c; earliest published wins
        assert_eq!(out[0].id, "c");
    }

    #[test]
    fn test_dissimilar_articles_untouched_and_ordered() {
        let dedup = Deduplicator::new(0.6, 200);
        let batch = vec![
            make_article("a", "Fed raises interest rates again", "http://x/1", 0.5, 0),
            make_article("b", "Tesla shares jump on earnings beat", "http://x/2", 0.6, 1),
            make_article("c", "Oil futures climb amid supply cuts", "http://x/3", 0.7, 2),
        ];
        let out = dedup.dedupe(batch);
        let ids: Vec<&str> = out.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let dedup = Deduplicator::new(0.6, 200);
        let batch = vec![
            make_article(
                "a",
                "fed raises interest rates combat surging inflation",
                "http://x/1",
                0.4,
                0,
            ),
            make_article(
                "b",
                "interest rates surging: fed raises combat inflation",
                "http://x/2",
                0.9,
                2,
            ),
            make_article("c", "Tesla shares jump on earnings beat", "http://x/3", 0.6, 1),
            make_article("d", "Oil futures climb amid supply cuts", "http://x/4", 0.7, 2),
        ];
        let once = dedup.dedupe(batch);
        let twice = dedup.dedupe(once.clone());
        let once_ids: Vec<&str> = once.iter().map(|a| a.id.as_str()).collect();
        let twice_ids: Vec<&str> = twice.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(once_ids, twice_ids);
    }

    #[test]
    fn test_normalize_collapses_whitespace_and_punctuation() {
        assert_eq!(normalize("  Fed,   raises RATES! "), "fed raises rates");
    }
}
