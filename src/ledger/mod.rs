//! Paper trade ledger
//!
//! Owns the open-position map: open, mark-to-market, close, list.
//! Invariants live at this boundary: positive quantities only, NaN and
//! non-positive marks are ignored, peaks never decrease while open, and
//! a closed position is frozen (no double close). Closed trades are
//! appended to a CSV analytics file alongside the relational store.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::EntryConfig;
use crate::persistence::Store;
use crate::types::{DefconLevel, ExitReason, Position, PositionStatus};

/// One row per closed trade in the analytics CSV
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub position_id: i64,
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: String,
    pub hold_hours: f64,
    pub entry_defcon: u8,
}

/// Running realized-trade statistics
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub realized_pnl: f64,
    pub exits_stop_loss: u32,
    pub exits_profit_target: u32,
    pub exits_trailing_stop: u32,
    pub exits_defcon_revert: u32,
    pub exits_time_limit: u32,
    pub exits_manual: u32,
}

impl LedgerStats {
    fn record_exit(&mut self, reason: ExitReason, pnl: f64) {
        self.total_trades += 1;
        self.realized_pnl += pnl;
        if pnl >= 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        match reason {
            ExitReason::StopLoss => self.exits_stop_loss += 1,
            ExitReason::ProfitTarget => self.exits_profit_target += 1,
            ExitReason::TrailingStop => self.exits_trailing_stop += 1,
            ExitReason::DefconRevert => self.exits_defcon_revert += 1,
            ExitReason::TimeLimit => self.exits_time_limit += 1,
            ExitReason::Manual => self.exits_manual += 1,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.wins as f64 / self.total_trades as f64
    }
}

/// Snapshot for the portfolio command and cycle summaries
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub open_positions: usize,
    pub open_exposure: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub total_trades: u32,
    pub win_rate: f64,
    pub holdings: Vec<String>,
}

/// Position book with persistence hookup
pub struct PaperLedger {
    positions: RwLock<HashMap<i64, Position>>,
    stats: RwLock<LedgerStats>,
    next_id: AtomicI64,
    store: Arc<Store>,
    trades_csv: Option<PathBuf>,
}

impl PaperLedger {
    /// Restore the open book from the store
    pub async fn restore(store: Arc<Store>) -> Result<Self> {
        let open = store.load_open_positions().await?;
        let next_id = store.max_position_id().await? + 1;
        info!(restored = open.len(), "ledger restored from store");

        let positions: HashMap<i64, Position> =
            open.into_iter().map(|p| (p.id, p)).collect();
        Ok(Self {
            positions: RwLock::new(positions),
            stats: RwLock::new(LedgerStats::default()),
            next_id: AtomicI64::new(next_id),
            store,
            trades_csv: None,
        })
    }

    /// Attach the closed-trade analytics CSV
    pub fn with_trades_csv(mut self, path: PathBuf) -> Self {
        self.trades_csv = Some(path);
        self
    }

    /// Open a new position
    pub async fn open(
        &self,
        symbol: &str,
        qty: f64,
        entry_price: f64,
        entry_defcon: DefconLevel,
    ) -> Result<Position> {
        if !(qty.is_finite() && qty > 0.0) {
            bail!("refusing to open {}: qty must be positive, got {}", symbol, qty);
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            bail!(
                "refusing to open {}: entry price must be positive, got {}",
                symbol,
                entry_price
            );
        }

        let position = Position {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            symbol: symbol.to_string(),
            qty,
            entry_price,
            entry_time: Utc::now(),
            entry_defcon,
            peak_price: entry_price,
            current_price: entry_price,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        };

        self.positions
            .write()
            .unwrap()
            .insert(position.id, position.clone());
        self.store.save_position(&position).await?;
        info!(
            id = position.id,
            symbol,
            qty,
            entry_price,
            defcon = entry_defcon.as_u8(),
            "position opened"
        );
        Ok(position)
    }

    /// Mark a position to market. NaN and non-positive prices are
    /// ignored; the peak only ever rises while the position is open.
    pub async fn mark(&self, position_id: i64, price: f64) -> Result<()> {
        if !(price.is_finite() && price > 0.0) {
            warn!(position_id, price, "ignoring bad mark");
            return Ok(());
        }

        let updated = {
            let mut positions = self.positions.write().unwrap();
            match positions.get_mut(&position_id) {
                Some(position) if position.status != PositionStatus::Closed => {
                    position.current_price = price;
                    if price > position.peak_price {
                        position.peak_price = price;
                    }
                    Some(position.clone())
                }
                _ => None,
            }
        };

        if let Some(position) = updated {
            self.store.save_position(&position).await?;
        }
        Ok(())
    }

    /// Close an open position. Double closes are invariant violations:
    /// the operation fails and the caller's cycle continues.
    pub async fn close(
        &self,
        position_id: i64,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<Position> {
        let closed = {
            let mut positions = self.positions.write().unwrap();
            let position = match positions.get_mut(&position_id) {
                Some(p) => p,
                None => bail!("close rejected: position {} not found", position_id),
            };
            if position.status == PositionStatus::Closed {
                bail!("close rejected: position {} already closed", position_id);
            }

            position.status = PositionStatus::Closed;
            position.exit_price = Some(exit_price);
            position.exit_time = Some(Utc::now());
            position.exit_reason = Some(reason);
            if exit_price.is_finite() && exit_price > 0.0 {
                position.current_price = exit_price;
            }
            let closed = position.clone();
            positions.remove(&position_id);
            closed
        };

        let pnl = (exit_price - closed.entry_price) * closed.qty;
        self.stats.write().unwrap().record_exit(reason, pnl);
        self.store.save_position(&closed).await?;
        self.append_trade_record(&closed, pnl);

        info!(
            id = closed.id,
            symbol = %closed.symbol,
            exit_price,
            pnl = format!("{:+.2}", pnl).as_str(),
            reason = %reason,
            "position closed"
        );
        Ok(closed)
    }

    /// Open positions ordered by id
    pub fn list_open(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .unwrap()
            .values()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|p| p.id);
        open
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats.read().unwrap().clone()
    }

    pub fn portfolio_summary(&self) -> PortfolioSummary {
        let open = self.list_open();
        let stats = self.stats();
        PortfolioSummary {
            open_positions: open.len(),
            open_exposure: open.iter().map(|p| p.current_price * p.qty).sum(),
            unrealized_pnl: open
                .iter()
                .map(|p| (p.current_price - p.entry_price) * p.qty)
                .sum(),
            realized_pnl: stats.realized_pnl,
            total_trades: stats.total_trades,
            win_rate: stats.win_rate(),
            holdings: open.iter().map(|p| p.symbol.clone()).collect(),
        }
    }

    fn append_trade_record(&self, closed: &Position, pnl: f64) {
        let Some(path) = &self.trades_csv else {
            return;
        };
        let record = TradeRecord {
            timestamp: Utc::now().timestamp_millis(),
            position_id: closed.id,
            symbol: closed.symbol.clone(),
            qty: closed.qty,
            entry_price: closed.entry_price,
            exit_price: closed.exit_price.unwrap_or(closed.current_price),
            pnl,
            pnl_pct: closed.pnl_pct(),
            exit_reason: closed
                .exit_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            hold_hours: closed.hold_duration(Utc::now()).num_seconds() as f64 / 3600.0,
            entry_defcon: closed.entry_defcon.as_u8(),
        };

        let needs_header = !path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path);
        match file {
            Ok(file) => {
                let mut writer = csv::WriterBuilder::new()
                    .has_headers(needs_header)
                    .from_writer(file);
                if let Err(err) = writer.serialize(&record).and_then(|_| Ok(writer.flush()?)) {
                    warn!(error = %err, "trade record append failed");
                }
            }
            Err(err) => warn!(error = %err, path = %path.display(), "trades CSV unavailable"),
        }
    }
}

/// VIX-adjusted position sizing: full size in calm tape, three quarters
/// once the VIX is elevated, half in real turbulence.
pub fn position_size_dollars(config: &EntryConfig, vix: f64) -> f64 {
    let factor = if vix < 20.0 {
        1.0
    } else if vix <= 30.0 {
        0.75
    } else {
        0.50
    };
    config.total_capital * config.base_position_pct * factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn ledger() -> (PaperLedger, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            Store::open(dir.path().join("t.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let ledger = PaperLedger::restore(store).await.unwrap();
        (ledger, dir)
    }

    #[tokio::test]
    async fn test_peak_monotone_across_marks() {
        let (ledger, _dir) = ledger().await;
        let p = ledger.open("SPY", 10.0, 100.0, DefconLevel::Three).await.unwrap();
        assert_eq!(p.peak_price, 100.0);

        for (mark, expected_peak) in [(103.0, 103.0), (95.0, 103.0), (110.0, 110.0), (99.0, 110.0)]
        {
            ledger.mark(p.id, mark).await.unwrap();
            let open = ledger.list_open();
            assert_eq!(open[0].current_price, mark);
            assert_eq!(open[0].peak_price, expected_peak);
            assert!(open[0].peak_price >= open[0].entry_price);
        }
    }

    #[tokio::test]
    async fn test_bad_marks_are_ignored() {
        let (ledger, _dir) = ledger().await;
        let p = ledger.open("SPY", 10.0, 100.0, DefconLevel::Three).await.unwrap();

        ledger.mark(p.id, f64::NAN).await.unwrap();
        ledger.mark(p.id, 0.0).await.unwrap();
        ledger.mark(p.id, -5.0).await.unwrap();

        let open = ledger.list_open();
        assert_eq!(open[0].current_price, 100.0);
        assert_eq!(open[0].peak_price, 100.0);
    }

    #[tokio::test]
    async fn test_double_close_rejected() {
        let (ledger, _dir) = ledger().await;
        let p = ledger.open("SPY", 10.0, 100.0, DefconLevel::Three).await.unwrap();

        let closed = ledger.close(p.id, 97.0, ExitReason::StopLoss).await.unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));

        assert!(ledger.close(p.id, 99.0, ExitReason::Manual).await.is_err());
        assert!(ledger.list_open().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_bad_inputs() {
        let (ledger, _dir) = ledger().await;
        assert!(ledger.open("SPY", 0.0, 100.0, DefconLevel::Three).await.is_err());
        assert!(ledger.open("SPY", -1.0, 100.0, DefconLevel::Three).await.is_err());
        assert!(ledger.open("SPY", 1.0, f64::NAN, DefconLevel::Three).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_track_realized_trades() {
        let (ledger, _dir) = ledger().await;
        let a = ledger.open("SPY", 10.0, 100.0, DefconLevel::Two).await.unwrap();
        let b = ledger.open("QQQ", 5.0, 200.0, DefconLevel::Two).await.unwrap();

        ledger.close(a.id, 106.0, ExitReason::ProfitTarget).await.unwrap();
        ledger.close(b.id, 190.0, ExitReason::StopLoss).await.unwrap();

        let stats = ledger.stats();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.exits_profit_target, 1);
        assert_eq!(stats.exits_stop_loss, 1);
        assert!((stats.realized_pnl - (60.0 - 50.0)).abs() < 1e-9);
        assert!((stats.win_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_round_trip_restore_preserves_peak_and_defcon() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        let id = {
            let store = Arc::new(Store::open(path.to_str().unwrap()).await.unwrap());
            let ledger = PaperLedger::restore(store).await.unwrap();
            let p = ledger.open("GLD", 3.0, 180.0, DefconLevel::One).await.unwrap();
            ledger.mark(p.id, 195.0).await.unwrap();
            ledger.mark(p.id, 188.0).await.unwrap();
            p.id
        };

        let store = Arc::new(Store::open(path.to_str().unwrap()).await.unwrap());
        let ledger = PaperLedger::restore(store).await.unwrap();
        let open = ledger.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
        assert_eq!(open[0].peak_price, 195.0);
        assert_eq!(open[0].entry_defcon, DefconLevel::One);

        // New ids keep counting upward after restore
        let next = ledger.open("SPY", 1.0, 500.0, DefconLevel::Five).await.unwrap();
        assert!(next.id > id);
    }

    #[test]
    fn test_vix_adjusted_sizing() {
        let config = EntryConfig {
            base_position_pct: 0.10,
            max_positions: 5,
            decision_ttl_min: 60,
            total_capital: 100_000.0,
        };
        assert_eq!(position_size_dollars(&config, 15.0), 10_000.0);
        assert_eq!(position_size_dollars(&config, 25.0), 7_500.0);
        assert_eq!(position_size_dollars(&config, 35.0), 5_000.0);
    }
}
