//! Monitoring scheduler and lifecycle controller
//!
//! Drives the cycle loop: market snapshot + news fetch in parallel,
//! signal scoring, persistence, alert fanout, exit evaluation and entry
//! proposals, then an interruptible sleep until the next cycle. The
//! command bus is polled between phases and at sleep boundaries; the
//! in-cycle fetches are additionally raced against the emergency-stop
//! signal raised at command intake, so an estop cancels in-flight HTTP
//! instead of waiting it out.
//!
//! Cycle ordering: snapshot and news signal are persisted before the
//! DEFCON transition, the transition before exits are evaluated, and
//! exit applications before their alerts go out. The cycle is the
//! atomic failure unit; an error inside one never reaches the loop.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::alerts::{AlertEvent, AlertRouter, NewsTopItem};
use crate::command::{Command, CommandBus, CommandResponse, CommandVerb, ConsumedCommand};
use crate::config::AppConfig;
use crate::defcon::SignalScorer;
use crate::exits::ExitEvaluator;
use crate::ledger::{position_size_dollars, PaperLedger};
use crate::market::MarketDataClient;
use crate::news::NewsAggregator;
use crate::persistence::Store;
use crate::types::{
    Article, BrokerMode, DecisionKind, DecisionStatus, DefconLevel, MarketSnapshot, NewsSignal,
    OrchestratorMode, OrchestratorState, PendingDecision,
};

/// Serialized into the pending decision's subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryProposal {
    pub symbols: Vec<String>,
    pub size_dollars: f64,
    pub defcon: u8,
}

/// Effects of a command batch on the loop
#[derive(Debug, Default, Clone, Copy)]
struct CommandEffects {
    refresh: bool,
}

/// The always-on monitoring orchestrator. Every collaborator is passed
/// in by construction.
pub struct Orchestrator {
    config: AppConfig,
    state: OrchestratorState,
    store: Arc<Store>,
    ledger: Arc<PaperLedger>,
    aggregator: Arc<NewsAggregator>,
    market: Arc<MarketDataClient>,
    scorer: SignalScorer,
    exits: ExitEvaluator,
    router: Arc<AlertRouter>,
    commands: Arc<CommandBus>,
    current_defcon: DefconLevel,
    last_snapshot: Option<MarketSnapshot>,
}

impl Orchestrator {
    /// Build the orchestrator, restoring broker mode, interval, cycle
    /// counter and DEFCON level from the store.
    pub async fn new(
        config: AppConfig,
        store: Arc<Store>,
        ledger: Arc<PaperLedger>,
        aggregator: Arc<NewsAggregator>,
        market: Arc<MarketDataClient>,
        router: Arc<AlertRouter>,
        commands: Arc<CommandBus>,
    ) -> Result<Self> {
        let configured_mode = BrokerMode::parse(&config.orchestrator.broker_mode)
            .unwrap_or(BrokerMode::Disabled);
        let mut state =
            OrchestratorState::new(configured_mode, config.orchestrator.cycle_interval_sec);

        if let Some((broker_mode, interval, cycle_count)) =
            store.load_orchestrator_state().await?
        {
            state.broker_mode = broker_mode;
            state.cycle_interval_sec = interval;
            state.cycle_count = cycle_count;
            info!(
                broker_mode = %broker_mode,
                interval,
                cycle_count,
                "orchestrator state restored"
            );
        }

        let current_defcon = store
            .latest_defcon_state()
            .await?
            .map(|d| d.level)
            .unwrap_or(DefconLevel::Five);

        let scorer = SignalScorer::new(config.defcon.weights);
        let exits = ExitEvaluator::new(config.exit);

        Ok(Self {
            config,
            state,
            store,
            ledger,
            aggregator,
            market,
            scorer,
            exits,
            router,
            commands,
            current_defcon,
            last_snapshot: None,
        })
    }

    pub fn mode(&self) -> OrchestratorMode {
        self.state.mode
    }

    /// Main loop. Returns when a shutdown command drains the current
    /// cycle.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            interval_sec = self.state.cycle_interval_sec,
            broker_mode = %self.state.broker_mode,
            defcon = %self.current_defcon,
            sources = self.aggregator.source_count(),
            "orchestrator started"
        );

        loop {
            self.apply_commands().await;
            match self.state.mode {
                OrchestratorMode::ShuttingDown => break,
                OrchestratorMode::EStopped => {
                    self.idle_tick().await;
                    continue;
                }
                OrchestratorMode::Running | OrchestratorMode::Held => {
                    let held = self.state.mode == OrchestratorMode::Held;
                    self.state.last_cycle_start = Some(Utc::now());
                    self.state.cycle_count += 1;
                    let cycle_id = self.state.cycle_count;

                    if let Err(err) = self.run_cycle(cycle_id, held).await {
                        // The cycle is the atomic failure unit
                        error!(cycle_id, error = %err, "cycle failed, next cycle starts clean");
                    }
                    self.persist_state().await;
                }
            }

            if self.state.mode == OrchestratorMode::ShuttingDown {
                break;
            }
            self.sleep_between_cycles().await;
        }

        self.persist_state().await;
        info!(cycles = self.state.cycle_count, "orchestrator stopped");
        Ok(())
    }

    /// One monitoring cycle. `held` skips entry proposals only.
    ///
    /// The fetch join races the emergency-stop signal raised at command
    /// intake: an estop arriving mid-fetch drops the join future, which
    /// cancels the in-flight HTTP, and the cycle's partial results never
    /// reach the store. A shutdown is cooperative and lets the cycle
    /// drain normally.
    async fn run_cycle(&mut self, cycle_id: u64, held: bool) -> Result<()> {
        info!(cycle_id, held, "cycle start");

        // Independent external I/O joins before scoring begins
        let mut estop_signal = self.commands.estop_signal();
        let fetched = tokio::select! {
            biased;
            _ = estop_signal.wait_for(|stop| *stop) => None,
            fetched = async {
                tokio::join!(
                    self.market.snapshot(),
                    self.aggregator.fetch_cycle(cycle_id),
                )
            } => Some(fetched),
        };

        self.apply_commands().await;
        let Some((snapshot, articles)) = fetched else {
            warn!(cycle_id, "emergency stop: in-flight fetches cancelled, cycle dropped");
            return Ok(());
        };
        if self.estopped() {
            return Ok(());
        }

        let now = Utc::now();
        let signal = self.aggregator.build_signal(cycle_id, &articles, now);

        // Novelty compares against the previous persisted signal, so it
        // runs before this cycle's row lands
        let novelty = self.aggregator.detect_novelty(&articles).await;

        self.store.insert_market_snapshot(cycle_id, &snapshot).await?;
        self.store.insert_news_signal(&signal).await?;

        let evaluation = self.scorer.evaluate(self.current_defcon, &signal, &snapshot, now);
        let previous_defcon = self.current_defcon;
        if evaluation.changed {
            self.store.insert_defcon_state(&evaluation.state).await?;
            self.current_defcon = evaluation.state.level;
        }
        self.last_snapshot = Some(snapshot.clone());

        // Alert fanout (after persistence, per the ordering contract)
        if evaluation.changed {
            self.router
                .route(&crate::alerts::defcon_change(
                    previous_defcon,
                    self.current_defcon,
                    evaluation.state.signal_score,
                    evaluation.state.reason_code.as_str(),
                ))
                .await;
        }
        if let Some(event) =
            AlertEvent::news_update(&signal, novelty, top_items(&signal, &articles))
        {
            self.router.route(&event).await;
        }
        self.router
            .route(&AlertEvent::CycleSummary {
                defcon: self.current_defcon.as_u8(),
                signal_score: evaluation.state.signal_score,
                vix: snapshot.vix,
                yield_10y: snapshot.bond_yield_10y,
                sp500_pct: snapshot.sp500_change_pct,
                holdings: self.ledger.list_open().iter().map(|p| p.symbol.clone()).collect(),
            })
            .await;

        self.apply_commands().await;
        if self.estopped() {
            // Pending exits are cancelled; positions stay open unmanaged
            return Ok(());
        }

        // Mark to market, then evaluate exits over the refreshed book
        self.mark_positions(&snapshot).await;
        self.apply_exits(now).await;

        if !held {
            self.propose_entries(&signal, &snapshot).await;
        }
        self.expire_stale_decisions(now).await;

        info!(
            cycle_id,
            defcon = %self.current_defcon,
            score = format!("{:.1}", evaluation.state.signal_score).as_str(),
            articles = articles.len(),
            new_articles = novelty.new_count,
            open_positions = self.ledger.list_open().len(),
            "cycle complete"
        );
        Ok(())
    }

    fn halted(&self) -> bool {
        matches!(
            self.state.mode,
            OrchestratorMode::EStopped | OrchestratorMode::ShuttingDown
        )
    }

    fn estopped(&self) -> bool {
        self.state.mode == OrchestratorMode::EStopped
    }

    /// Refresh every open position's mark from the snapshot, falling
    /// back to an individual quote for symbols outside the watchlist.
    async fn mark_positions(&self, snapshot: &MarketSnapshot) {
        for position in self.ledger.list_open() {
            let price = match snapshot.per_symbol_price.get(&position.symbol) {
                Some(price) => *price,
                None => self.market.quote(&position.symbol).await.price,
            };
            if let Err(err) = self.ledger.mark(position.id, price).await {
                warn!(position_id = position.id, error = %err, "mark failed");
            }
        }
    }

    /// Evaluate the exit chain and apply at most one exit per position.
    /// Applications persist before their alerts are emitted.
    async fn apply_exits(&self, now: chrono::DateTime<Utc>) {
        for position in self.ledger.list_open() {
            let Some(decision) = self.exits.evaluate(&position, self.current_defcon, now) else {
                continue;
            };
            match self
                .ledger
                .close(decision.position_id, decision.exit_price, decision.reason)
                .await
            {
                Ok(closed) => {
                    self.router
                        .route(&AlertEvent::TradeExit {
                            symbol: closed.symbol.clone(),
                            reason: decision.reason.as_str().to_string(),
                            pnl_pct: decision.pnl_pct,
                        })
                        .await;
                }
                Err(err) => {
                    // Invariant violation surfaces in the log, cycle continues
                    error!(position_id = decision.position_id, error = %err, "exit failed");
                }
            }
        }
    }

    /// File or execute an entry proposal when the DEFCON entry band is
    /// reached. Stale snapshots never open positions.
    async fn propose_entries(&mut self, signal: &NewsSignal, snapshot: &MarketSnapshot) {
        if self.current_defcon.as_u8() > 2 {
            return;
        }
        if snapshot.stale {
            warn!("entry window open but snapshot is stale, no proposal");
            return;
        }
        if self.ledger.list_open().len() >= self.config.entry.max_positions {
            return;
        }
        match self.store.awaiting_entry_decision().await {
            Ok(Some(_)) => return, // single active entry decision
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "pending decision lookup failed, skipping proposal");
                return;
            }
        }

        let playbook_key = signal.crisis_type.as_str();
        let Some(symbols) = self.config.playbook.get(playbook_key).filter(|s| !s.is_empty())
        else {
            return;
        };

        let held: std::collections::HashSet<String> = self
            .ledger
            .list_open()
            .iter()
            .map(|p| p.symbol.clone())
            .collect();
        let symbols: Vec<String> = symbols
            .iter()
            .filter(|s| !held.contains(*s))
            .take(3)
            .cloned()
            .collect();
        if symbols.is_empty() {
            return;
        }

        let proposal = EntryProposal {
            symbols,
            size_dollars: position_size_dollars(&self.config.entry, snapshot.vix),
            defcon: self.current_defcon.as_u8(),
        };

        match self.state.broker_mode {
            BrokerMode::Disabled => {
                let decision = PendingDecision {
                    id: format!("entry-{}", signal.cycle_id),
                    kind: DecisionKind::Entry,
                    subject: serde_json::to_string(&proposal).unwrap_or_default(),
                    created_at: Utc::now(),
                    expires_at: Utc::now()
                        + ChronoDuration::minutes(self.config.entry.decision_ttl_min as i64),
                    status: DecisionStatus::Awaiting,
                };
                if let Err(err) = self.store.save_decision(&decision).await {
                    warn!(error = %err, "pending decision save failed");
                    return;
                }
                info!(symbols = ?proposal.symbols, size = proposal.size_dollars, "entry filed for approval");
                self.router
                    .route(&AlertEvent::TradeEntry {
                        symbols: proposal.symbols,
                        size: proposal.size_dollars,
                        defcon: proposal.defcon,
                        pending: true,
                    })
                    .await;
            }
            BrokerMode::SemiAuto | BrokerMode::FullAuto => {
                let executed = self.execute_entries(&proposal).await;
                if executed {
                    self.router
                        .route(&AlertEvent::TradeEntry {
                            symbols: proposal.symbols,
                            size: proposal.size_dollars,
                            defcon: proposal.defcon,
                            pending: false,
                        })
                        .await;
                }
            }
        }
    }

    /// Open one position per proposed symbol at the current mark
    async fn execute_entries(&self, proposal: &EntryProposal) -> bool {
        let per_symbol = proposal.size_dollars / proposal.symbols.len().max(1) as f64;
        let entry_defcon =
            DefconLevel::from_u8(proposal.defcon).unwrap_or(self.current_defcon);
        let mut any = false;

        for symbol in &proposal.symbols {
            let price = match self
                .last_snapshot
                .as_ref()
                .and_then(|s| s.per_symbol_price.get(symbol).copied())
            {
                Some(price) => price,
                None => {
                    let quote = self.market.quote(symbol).await;
                    if quote.stale {
                        warn!(symbol, "no live quote, entry skipped");
                        continue;
                    }
                    quote.price
                }
            };
            if price <= 0.0 {
                continue;
            }
            let qty = per_symbol / price;
            match self
                .ledger
                .open(symbol, qty, price, entry_defcon)
                .await
            {
                Ok(_) => any = true,
                Err(err) => warn!(symbol, error = %err, "entry rejected"),
            }
        }
        any
    }

    /// Time out the active entry decision when its TTL lapses
    async fn expire_stale_decisions(&self, now: chrono::DateTime<Utc>) {
        let awaiting = match self.store.awaiting_entry_decision().await {
            Ok(Some(decision)) => decision,
            _ => return,
        };
        if awaiting.expires_at <= now {
            let mut expired = awaiting;
            expired.status = DecisionStatus::Expired;
            info!(id = %expired.id, "entry decision expired");
            if let Err(err) = self.store.save_decision(&expired).await {
                warn!(error = %err, "decision expiry save failed");
            }
        }
    }

    // ── Command handling ────────────────────────────────────────

    /// Drain and apply everything on the bus. State mutation is atomic
    /// with respect to the loop: commands apply between phases only.
    async fn apply_commands(&mut self) -> CommandEffects {
        let mut effects = CommandEffects::default();
        for consumed in self.commands.drain().await {
            let ConsumedCommand { command, delivery } = consumed;
            let response = self.dispatch(&command).await;
            info!(
                verb = %command.verb,
                ok = response.ok,
                code = response.code,
                "command processed"
            );
            if let Some(verb) = command.verb() {
                if verb == CommandVerb::Refresh && response.ok {
                    effects.refresh = true;
                }
                if is_mutator(verb) {
                    self.router
                        .route(&AlertEvent::CommandResponse {
                            verb: verb.as_str().to_string(),
                            ok: response.ok,
                            message: response.message.clone(),
                        })
                        .await;
                }
            }
            self.commands.respond(&command.id, &response);
            ConsumedCommand { command, delivery }.complete();
        }
        effects
    }

    async fn dispatch(&mut self, command: &Command) -> CommandResponse {
        let Some(verb) = command.verb() else {
            return CommandResponse::unknown_verb(&command.verb);
        };

        match verb {
            CommandVerb::Status => CommandResponse::with_data(
                "status",
                serde_json::json!({
                    "mode": self.state.mode.as_str(),
                    "broker_mode": self.state.broker_mode.as_str(),
                    "defcon": self.current_defcon.as_u8(),
                    "cycle_count": self.state.cycle_count,
                    "cycle_interval_sec": self.state.cycle_interval_sec,
                    "last_cycle_start": self.state.last_cycle_start.map(|t| t.to_rfc3339()),
                }),
            ),
            CommandVerb::Portfolio => {
                let summary = self.ledger.portfolio_summary();
                CommandResponse::with_data(
                    "portfolio",
                    serde_json::to_value(summary).unwrap_or(serde_json::Value::Null),
                )
            }
            CommandVerb::Defcon => {
                let latest = self.store.latest_defcon_state().await.ok().flatten();
                CommandResponse::with_data(
                    "defcon",
                    serde_json::json!({
                        "level": self.current_defcon.as_u8(),
                        "signal_score": latest.as_ref().map(|d| d.signal_score),
                        "reason_code": latest.as_ref().map(|d| d.reason_code.as_str()),
                        "entered_at": latest.map(|d| d.entered_at.to_rfc3339()),
                    }),
                )
            }
            CommandVerb::Hold => match self.state.mode {
                OrchestratorMode::Running | OrchestratorMode::Held => {
                    self.state.mode = OrchestratorMode::Held;
                    CommandResponse::accepted("holding: monitoring continues, no new entries")
                }
                _ => CommandResponse::invalid_state(format!(
                    "cannot hold from {}",
                    self.state.mode
                )),
            },
            CommandVerb::Resume => match self.state.mode {
                OrchestratorMode::Held | OrchestratorMode::EStopped => {
                    self.state.mode = OrchestratorMode::Running;
                    CommandResponse::accepted("resumed")
                }
                OrchestratorMode::Running => CommandResponse::accepted("already running"),
                OrchestratorMode::ShuttingDown => {
                    CommandResponse::invalid_state("shutting down")
                }
            },
            CommandVerb::Yes => self.approve_pending().await,
            CommandVerb::No => self.reject_pending().await,
            CommandVerb::Refresh => {
                if self.halted() {
                    CommandResponse::invalid_state(format!(
                        "cannot refresh from {}",
                        self.state.mode
                    ))
                } else {
                    CommandResponse::accepted("refreshing on next tick")
                }
            }
            CommandVerb::Shutdown => {
                self.state.mode = OrchestratorMode::ShuttingDown;
                CommandResponse::accepted("shutting down after current cycle")
            }
            CommandVerb::Estop => {
                self.state.mode = OrchestratorMode::EStopped;
                // Lower the intake signal so the next cycle after a
                // manual resume is not cancelled by a stale flag
                self.commands.clear_estop();
                warn!("emergency stop: loop frozen, manual resume required");
                CommandResponse::accepted("emergency stop engaged")
            }
            CommandVerb::Mode => match command.args.first().and_then(|m| BrokerMode::parse(m)) {
                Some(mode) => {
                    self.state.broker_mode = mode;
                    self.persist_state().await;
                    CommandResponse::accepted(format!("broker mode set to {}", mode))
                }
                None => CommandResponse::invalid_state(
                    "usage: mode <disabled|semi_auto|full_auto>",
                ),
            },
            CommandVerb::Interval => {
                match command.args.first().and_then(|m| m.parse::<u64>().ok()) {
                    Some(minutes) if minutes > 0 => {
                        self.state.cycle_interval_sec = minutes * 60;
                        self.persist_state().await;
                        CommandResponse::accepted(format!("interval set to {} min", minutes))
                    }
                    _ => CommandResponse::invalid_state("usage: interval <minutes>"),
                }
            }
        }
    }

    /// Approve the awaiting entry decision and execute it
    async fn approve_pending(&mut self) -> CommandResponse {
        let awaiting = match self.store.awaiting_entry_decision().await {
            Ok(Some(decision)) => decision,
            Ok(None) => return CommandResponse::invalid_state("nothing pending"),
            Err(err) => return CommandResponse::invalid_state(format!("store error: {}", err)),
        };

        let proposal: EntryProposal = match serde_json::from_str(&awaiting.subject) {
            Ok(p) => p,
            Err(err) => {
                return CommandResponse::invalid_state(format!("proposal unreadable: {}", err))
            }
        };

        if self.last_snapshot.as_ref().map(|s| s.stale).unwrap_or(true) {
            return CommandResponse::invalid_state("market data stale, approve again next cycle");
        }

        let executed = self.execute_entries(&proposal).await;
        let mut decision = awaiting;
        decision.status = DecisionStatus::Approved;
        if let Err(err) = self.store.save_decision(&decision).await {
            warn!(error = %err, "approval save failed");
        }

        if executed {
            CommandResponse::accepted(format!("approved: opened {:?}", proposal.symbols))
        } else {
            CommandResponse::invalid_state("approved but no entry could be executed")
        }
    }

    async fn reject_pending(&mut self) -> CommandResponse {
        match self.store.awaiting_entry_decision().await {
            Ok(Some(mut decision)) => {
                decision.status = DecisionStatus::Rejected;
                if let Err(err) = self.store.save_decision(&decision).await {
                    warn!(error = %err, "rejection save failed");
                }
                CommandResponse::accepted("rejected")
            }
            Ok(None) => CommandResponse::invalid_state("nothing pending"),
            Err(err) => CommandResponse::invalid_state(format!("store error: {}", err)),
        }
    }

    // ── Sleeping ────────────────────────────────────────────────

    /// Sleep until the next cycle is due, polling the command bus at
    /// the tick rate. Refresh, shutdown and estop cut the sleep short.
    async fn sleep_between_cycles(&mut self) {
        let tick = Duration::from_millis(self.config.orchestrator.command_tick_ms.max(50));
        let interval = ChronoDuration::seconds(self.state.cycle_interval_sec as i64);
        let sleep_until = self
            .state
            .last_cycle_start
            .map(|start| start + interval)
            .unwrap_or_else(Utc::now);

        loop {
            let now = Utc::now();
            if now >= sleep_until {
                return;
            }
            let effects = self.apply_commands().await;
            if effects.refresh {
                info!("refresh requested, cutting sleep short");
                return;
            }
            if self.halted() {
                return;
            }
            let remaining = (sleep_until - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            sleep(tick.min(remaining)).await;
        }
    }

    /// E-stopped: nothing runs, commands are still served
    async fn idle_tick(&mut self) {
        let tick = Duration::from_millis(self.config.orchestrator.command_tick_ms.max(50));
        sleep(tick).await;
    }

    async fn persist_state(&self) {
        if let Err(err) = self
            .store
            .save_orchestrator_state(
                self.state.broker_mode,
                self.state.cycle_interval_sec,
                self.state.cycle_count,
            )
            .await
        {
            warn!(error = %err, "orchestrator state save failed");
        }
    }
}

fn is_mutator(verb: CommandVerb) -> bool {
    !matches!(
        verb,
        CommandVerb::Status | CommandVerb::Portfolio | CommandVerb::Defcon
    )
}

/// Headline entries for the news update, in top-article order
fn top_items(signal: &NewsSignal, articles: &[Article]) -> Vec<NewsTopItem> {
    signal
        .top_articles
        .iter()
        .filter_map(|id| articles.iter().find(|a| &a.id == id))
        .map(|a| NewsTopItem {
            source: a.source.clone(),
            title: a.title.clone(),
            urgency: a.urgency,
        })
        .collect()
}
