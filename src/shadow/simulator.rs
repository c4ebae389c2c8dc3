//! Counterfactual position replay.
//!
//! Walks forward through the bars that follow a shadow decision and decides
//! how the position it describes would have ended. Bars are processed in
//! time order; within a bar, grid fills are applied first and the stop
//! checked afterwards against the updated average entry. A bar's high (low
//! for shorts) may have printed before its fill, so the target is only
//! checked on bars without a fill. When a bar touches both the stop and the
//! target the stop is assumed to have hit first.
//!
//! Only bars that open at or after the decision timestamp are used. A
//! decision that still has no bars once the horizon and grace period have
//! passed resolves flat as `STILL_OPEN`, so it cannot sit in the queue
//! forever.

use chrono::{DateTime, Duration, Utc};

use crate::types::{Candle, ExitReason, GridPlan, ShadowDecision, TradeSide};

/// Replay settings.
#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    /// Positions still open after this long exit at the last close.
    pub max_hold: Duration,
    /// Extra time past the horizon after which missing data stops blocking
    /// resolution.
    pub stale_grace: Duration,
    /// Round-trip fee in percent, deducted from every filled position.
    pub fee_pct: f64,
}

/// A resolved replay.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedExit {
    pub exit_reason: ExitReason,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub avg_entry_price: f64,
    pub filled_fraction: f64,
    pub pnl_pct: f64,
}

/// Result of one replay attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Replay {
    Resolved(SimulatedExit),
    /// Not enough forward data yet; try again later.
    Pending,
}

// ---------------------------------------------------------------------------
// Position state
// ---------------------------------------------------------------------------

struct Position {
    side: TradeSide,
    filled_weight: f64,
    cost: f64,
    stop: Option<f64>,
    target: Option<f64>,
}

impl Position {
    fn avg_entry(&self) -> Option<f64> {
        (self.filled_weight > 0.0).then(|| self.cost / self.filled_weight)
    }

    /// Exit touched in this bar, stop first. Gaps through a level fill at
    /// the open. `check_target` is false on bars where a grid level filled.
    fn exit_in(&self, bar: &Candle, check_target: bool) -> Option<(ExitReason, f64)> {
        self.avg_entry()?;
        let long = self.side == TradeSide::Long;

        if let Some(stop) = self.stop {
            let touched = if long { bar.low <= stop } else { bar.high >= stop };
            if touched {
                let gapped = if long { bar.open < stop } else { bar.open > stop };
                return Some((ExitReason::StopLoss, if gapped { bar.open } else { stop }));
            }
        }
        if let Some(target) = self.target.filter(|_| check_target) {
            let touched = if long { bar.high >= target } else { bar.low <= target };
            if touched {
                let gapped = if long { bar.open > target } else { bar.open < target };
                return Some((ExitReason::TakeProfit, if gapped { bar.open } else { target }));
            }
        }
        None
    }
}

struct GridState<'a> {
    plan: &'a GridPlan,
    filled: Vec<bool>,
}

impl GridState<'_> {
    /// Fill every unfilled level this bar reaches. Returns true if any filled.
    fn apply_fills(&mut self, bar: &Candle, position: &mut Position) -> bool {
        let mut any = false;
        for (i, level) in self.plan.levels.iter().enumerate() {
            if self.filled[i] {
                continue;
            }
            let reached = match position.side {
                TradeSide::Long => bar.low <= level.price,
                TradeSide::Short => bar.high >= level.price,
            };
            if reached {
                // A bar that opens through the level fills at the open.
                let price = match position.side {
                    TradeSide::Long => bar.open.min(level.price),
                    TradeSide::Short => bar.open.max(level.price),
                };
                self.filled[i] = true;
                position.filled_weight += level.weight;
                position.cost += level.weight * price;
                any = true;
            }
        }
        any
    }

    fn rebracket(&self, position: &mut Position) {
        if let Some(avg) = position.avg_entry() {
            let s = position.side.sign();
            position.stop = Some(avg * (1.0 - s * self.plan.stop_loss_pct / 100.0));
            position.target = Some(avg * (1.0 + s * self.plan.take_profit_pct / 100.0));
        }
    }

    fn total_weight(&self) -> f64 {
        self.plan.levels.iter().map(|l| l.weight).sum()
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Replay `decision` against `candles` (oldest first) as seen at `now`.
pub fn replay(decision: &ShadowDecision, candles: &[Candle], now: DateTime<Utc>, config: &ReplayConfig) -> Replay {
    let start = decision.timestamp;
    let horizon = start + config.max_hold;
    let bars: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.open_time >= start && c.open_time < horizon)
        .collect();

    let mut grid = decision.grid.as_ref().filter(|g| !g.levels.is_empty()).map(|plan| GridState {
        plan,
        filled: vec![false; plan.levels.len()],
    });

    let mut position = match grid {
        Some(_) => Position {
            side: decision.side,
            filled_weight: 0.0,
            cost: 0.0,
            stop: None,
            target: None,
        },
        None => Position {
            side: decision.side,
            filled_weight: 1.0,
            cost: decision.entry_price,
            stop: decision.stop_loss,
            target: decision.take_profit,
        },
    };

    for bar in &bars {
        let mut filled = false;
        if let Some(state) = grid.as_mut() {
            if state.apply_fills(bar, &mut position) {
                state.rebracket(&mut position);
                filled = true;
            }
        }
        if let Some((reason, price)) = position.exit_in(bar, !filled) {
            return Replay::Resolved(close(decision, &position, grid.as_ref(), reason, price, bar.close_time, config));
        }
    }

    let Some(last) = bars.last() else {
        if now >= horizon + config.stale_grace {
            return Replay::Resolved(no_data(decision, horizon));
        }
        return Replay::Pending;
    };

    let reason = if last.close_time >= horizon {
        ExitReason::TimeLimit
    } else if now >= horizon + config.stale_grace {
        ExitReason::StillOpen
    } else {
        return Replay::Pending;
    };
    Replay::Resolved(close(decision, &position, grid.as_ref(), reason, last.close, last.close_time, config))
}

/// Flat exit for a decision whose symbol never produced a bar.
pub fn no_data(decision: &ShadowDecision, horizon: DateTime<Utc>) -> SimulatedExit {
    SimulatedExit {
        exit_reason: ExitReason::StillOpen,
        exit_price: decision.entry_price,
        exit_time: horizon,
        avg_entry_price: decision.entry_price,
        filled_fraction: 0.0,
        pnl_pct: 0.0,
    }
}

fn close(
    decision: &ShadowDecision,
    position: &Position,
    grid: Option<&GridState<'_>>,
    exit_reason: ExitReason,
    exit_price: f64,
    exit_time: DateTime<Utc>,
    config: &ReplayConfig,
) -> SimulatedExit {
    let filled_fraction = match grid {
        Some(state) => {
            let total = state.total_weight();
            if total > 0.0 {
                (position.filled_weight / total).min(1.0)
            } else {
                0.0
            }
        }
        None => 1.0,
    };

    match position.avg_entry() {
        Some(avg) if avg > 0.0 => {
            let gross = position.side.sign() * (exit_price - avg) / avg * 100.0;
            SimulatedExit {
                exit_reason,
                exit_price,
                exit_time,
                avg_entry_price: avg,
                filled_fraction,
                pnl_pct: gross - config.fee_pct,
            }
        }
        // Nothing filled: flat, no fee.
        _ => SimulatedExit {
            exit_reason,
            exit_price,
            exit_time,
            avg_entry_price: decision.entry_price,
            filled_fraction: 0.0,
            pnl_pct: 0.0,
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
