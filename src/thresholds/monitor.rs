//! Post-adjustment rollback triggers.
//!
//! Given an active adjustment and the real trades closed since it was
//! applied, decide whether it must be rolled back and whether it is
//! currently underperforming its baseline.

use chrono::{DateTime, Duration, Utc};
use std::fmt;

use crate::shadow::stats;
use crate::types::{Adjustment, LiveTrade};

#[derive(Debug, Clone)]
pub struct RollbackPolicy {
    /// Drop in win rate, in percentage points, that triggers a rollback.
    pub win_rate_drop_pct: f64,
    /// Win-rate drop is only judged on trades within this window after apply.
    pub win_rate_window: Duration,
    /// Trades needed before the win rate is judged at all.
    pub min_trades_for_win_rate: usize,
    pub max_consecutive_losses: usize,
    /// Continuous underperformance that triggers a rollback.
    pub underperformance_window: Duration,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            win_rate_drop_pct: 15.0,
            win_rate_window: Duration::hours(24),
            min_trades_for_win_rate: 5,
            max_consecutive_losses: 3,
            underperformance_window: Duration::hours(48),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackTrigger {
    WinRateDrop { baseline: f64, current: f64, trades: usize },
    ConsecutiveLosses { count: usize },
    Underperformance { since: DateTime<Utc>, hours: i64 },
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackTrigger::WinRateDrop { baseline, current, trades } => write!(
                f,
                "win rate fell from {baseline:.1}% to {current:.1}% over {trades} trades"
            ),
            RollbackTrigger::ConsecutiveLosses { count } => {
                write!(f, "{count} consecutive live losses")
            }
            RollbackTrigger::Underperformance { since, hours } => write!(
                f,
                "below pre-adjustment baseline for {hours}h (since {})",
                since.format("%Y-%m-%d %H:%M UTC")
            ),
        }
    }
}

/// Result of assessing one adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub trigger: Option<RollbackTrigger>,
    /// New value for `Adjustment::underperforming_since`.
    pub underperforming_since: Option<DateTime<Utc>>,
}

fn longest_losing_run(trades: &[&LiveTrade]) -> usize {
    let mut best = 0;
    let mut run = 0;
    for t in trades {
        if t.is_win() {
            run = 0;
        } else {
            run += 1;
            best = best.max(run);
        }
    }
    best
}

/// Assess `adjustment` against live trades, as of `now`.
pub fn assess(adjustment: &Adjustment, trades: &[LiveTrade], now: DateTime<Utc>, policy: &RollbackPolicy) -> Assessment {
    let mut after: Vec<&LiveTrade> = trades.iter().filter(|t| t.closed_at >= adjustment.applied_at).collect();
    after.sort_by_key(|t| t.closed_at);

    let run = longest_losing_run(&after);
    if policy.max_consecutive_losses > 0 && run >= policy.max_consecutive_losses {
        return Assessment {
            trigger: Some(RollbackTrigger::ConsecutiveLosses { count: run }),
            underperforming_since: adjustment.underperforming_since,
        };
    }

    let Some(baseline) = adjustment.baseline.as_ref() else {
        return Assessment {
            trigger: None,
            underperforming_since: None,
        };
    };

    let window_end = adjustment.applied_at + policy.win_rate_window;
    let early: Vec<f64> = after
        .iter()
        .filter(|t| t.closed_at <= window_end)
        .map(|t| t.pnl_pct)
        .collect();
    if early.len() >= policy.min_trades_for_win_rate {
        let current = stats::win_rate(&early);
        if baseline.win_rate - current > policy.win_rate_drop_pct {
            return Assessment {
                trigger: Some(RollbackTrigger::WinRateDrop {
                    baseline: baseline.win_rate,
                    current,
                    trades: early.len(),
                }),
                underperforming_since: adjustment.underperforming_since,
            };
        }
    }

    if after.is_empty() {
        return Assessment {
            trigger: None,
            underperforming_since: adjustment.underperforming_since,
        };
    }

    let pnl: Vec<f64> = after.iter().map(|t| t.pnl_pct).collect();
    if stats::mean(&pnl) >= baseline.avg_pnl_pct {
        return Assessment {
            trigger: None,
            underperforming_since: None,
        };
    }

    let since = adjustment.underperforming_since.unwrap_or(now);
    let trigger = (now - since >= policy.underperformance_window).then(|| RollbackTrigger::Underperformance {
        since,
        hours: (now - since).num_hours(),
    });
    Assessment {
        trigger,
        underperforming_since: Some(since),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
