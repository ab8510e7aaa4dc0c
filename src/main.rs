//! HighTrade orchestrator daemon
//!
//! Boots the store, recovers orphaned commands, wires every component
//! together and runs the monitoring loop until shutdown.

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use hightrade::alerts::AlertRouter;
use hightrade::command::{CommandBus, CommandQueue, ORPHAN_MAX_AGE};
use hightrade::config::AppConfig;
use hightrade::ledger::PaperLedger;
use hightrade::market::MarketDataClient;
use hightrade::news::dedup::Deduplicator;
use hightrade::news::sentiment::SentimentAnalyzer;
use hightrade::news::sources::{AlphaVantageSource, NewsSource, RssFeedSource};
use hightrade::news::NewsAggregator;
use hightrade::orchestrator::Orchestrator;
use hightrade::persistence::Store;
use hightrade::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hightrade=info".into()),
        )
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    let data_dir = Path::new(&config.orchestrator.data_dir).to_path_buf();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    // One orchestrator instance per data dir
    let pid_file = data_dir.join("hightrade.pid");
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .with_context(|| format!("writing PID file {}", pid_file.display()))?;

    let store = Arc::new(
        Store::open(
            data_dir
                .join("hightrade.db")
                .to_str()
                .context("data dir path is not valid UTF-8")?,
        )
        .await?,
    );

    let client = Client::builder()
        .timeout(Duration::from_secs(5))
        .user_agent(format!("hightrade/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")?;

    // Rate limits from configuration
    let rate_limiter = Arc::new(RateLimiter::new());
    for (source, limits) in &config.rate_limits {
        rate_limiter
            .configure(source, limits.rpm, limits.min_ms)
            .await;
    }

    // News sources
    let mut sources: Vec<Arc<dyn NewsSource>> = Vec::new();
    if config.sources.alpha_vantage.enabled {
        sources.push(Arc::new(AlphaVantageSource::new(
            client.clone(),
            &config.sources.alpha_vantage.endpoint,
            &config.sources.alpha_vantage.api_key,
            &config.sources.alpha_vantage.topics,
        )));
    }
    if config.sources.rss.enabled {
        for feed in &config.sources.rss.feeds {
            sources.push(Arc::new(RssFeedSource::new(client.clone(), feed)));
        }
    }
    info!(sources = sources.len(), "news sources enabled");

    let aggregator = Arc::new(NewsAggregator::new(
        sources,
        Arc::clone(&rate_limiter),
        Deduplicator::new(
            config.dedup.similarity_threshold,
            config.dedup.body_token_limit,
        ),
        SentimentAnalyzer::new(&config.news),
        Arc::clone(&store),
    ));

    let market = Arc::new(MarketDataClient::new(
        client.clone(),
        config.market.clone(),
        Arc::clone(&rate_limiter),
    ));

    let router = Arc::new(AlertRouter::new(client, &config.alerts));

    let ledger = Arc::new(
        PaperLedger::restore(Arc::clone(&store))
            .await?
            .with_trades_csv(data_dir.join("trades.csv")),
    );

    // Command queue with crash recovery, pumped on its own task
    let queue = CommandQueue::new(&data_dir.join("commands"))?;
    queue.recover_orphans(ORPHAN_MAX_AGE)?;
    let commands = CommandBus::new(queue);
    let poller = Arc::clone(&commands).start_file_poller(Duration::from_millis(
        config.orchestrator.command_tick_ms.max(50),
    ));

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        ledger,
        aggregator,
        market,
        router,
        commands,
    )
    .await?;

    let result = orchestrator.run().await;

    poller.abort();
    let _ = std::fs::remove_file(&pid_file);
    result
}
