//! Exit strategy evaluation
//!
//! A priority-ordered set of tagged strategy variants folded over each
//! open position. The first matching strategy wins, so a position can
//! never produce more than one exit per cycle. The evaluator is pure
//! over (position, current DEFCON, now); the ledger applies decisions.
//!
//! No strategy fires inside the minimum hold window.

use chrono::{DateTime, Utc};

use crate::config::ExitConfig;
use crate::types::{DefconLevel, ExitReason, Position, PositionStatus};

/// At most one per position per cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub position_id: i64,
    pub symbol: String,
    pub reason: ExitReason,
    pub exit_price: f64,
    pub pnl_pct: f64,
}

/// Tagged exit strategies. Adding one means adding a variant here and a
/// row in `ALL` below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStrategy {
    StopLoss,
    ProfitTarget,
    TrailingStop,
    DefconReversion,
    TimeBased,
}

impl ExitStrategy {
    /// Descending evaluation order
    pub const ALL: [ExitStrategy; 5] = [
        ExitStrategy::StopLoss,
        ExitStrategy::ProfitTarget,
        ExitStrategy::TrailingStop,
        ExitStrategy::DefconReversion,
        ExitStrategy::TimeBased,
    ];

    pub fn priority(&self) -> u8 {
        match self {
            ExitStrategy::StopLoss => 5,
            ExitStrategy::ProfitTarget => 4,
            ExitStrategy::TrailingStop => 3,
            ExitStrategy::DefconReversion => 2,
            ExitStrategy::TimeBased => 1,
        }
    }

    /// Check this strategy's trigger against a position. Assumes the
    /// caller already enforced the min-hold guard.
    fn evaluate(
        &self,
        position: &Position,
        current_defcon: DefconLevel,
        now: DateTime<Utc>,
        config: &ExitConfig,
    ) -> Option<ExitReason> {
        let pnl = position.pnl_pct();
        match self {
            ExitStrategy::StopLoss => (pnl <= config.stop_loss).then_some(ExitReason::StopLoss),
            ExitStrategy::ProfitTarget => {
                // A winner that has already given back the trailing
                // distance exits as a trailing stop, not a profit target
                let hit = pnl >= config.profit_target && !trailing_breached(position, config);
                hit.then_some(ExitReason::ProfitTarget)
            }
            ExitStrategy::TrailingStop => {
                trailing_breached(position, config).then_some(ExitReason::TrailingStop)
            }
            ExitStrategy::DefconReversion => {
                let entered_in_crisis = position.entry_defcon.as_u8() <= 2;
                let crisis_over = current_defcon.as_u8() >= 3;
                (entered_in_crisis && crisis_over).then_some(ExitReason::DefconRevert)
            }
            ExitStrategy::TimeBased => {
                let hold_hours =
                    position.hold_duration(now).num_seconds() as f64 / 3600.0;
                let max = config.max_hold_hours as f64;
                let expired = hold_hours >= max;
                let fading_loser = hold_hours >= 0.8 * max && pnl < 0.0;
                (expired || fading_loser).then_some(ExitReason::TimeLimit)
            }
        }
    }
}

/// Trailing-stop trigger: a profitable peak that the mark has retreated
/// from by at least the trailing distance
fn trailing_breached(position: &Position, config: &ExitConfig) -> bool {
    if position.peak_price <= position.entry_price || position.peak_price <= 0.0 {
        return false;
    }
    let drawdown_from_peak = (position.current_price - position.peak_price) / position.peak_price;
    drawdown_from_peak <= -config.trailing_stop
}

/// Fold of the priority-ordered strategy set
pub struct ExitEvaluator {
    config: ExitConfig,
    strategies: Vec<ExitStrategy>,
}

impl ExitEvaluator {
    pub fn new(config: ExitConfig) -> Self {
        let mut strategies = ExitStrategy::ALL.to_vec();
        strategies.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { config, strategies }
    }

    /// First matching strategy wins; None inside min-hold or for
    /// positions that are not open.
    pub fn evaluate(
        &self,
        position: &Position,
        current_defcon: DefconLevel,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        if position.status != PositionStatus::Open {
            return None;
        }
        let held_minutes = position.hold_duration(now).num_seconds() as f64 / 60.0;
        if held_minutes < self.config.min_hold_minutes as f64 {
            return None;
        }

        self.strategies.iter().find_map(|strategy| {
            strategy
                .evaluate(position, current_defcon, now, &self.config)
                .map(|reason| ExitDecision {
                    position_id: position.id,
                    symbol: position.symbol.clone(),
                    reason,
                    exit_price: position.current_price,
                    pnl_pct: position.pnl_pct(),
                })
        })
    }
}
