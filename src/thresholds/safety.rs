//! Safety gates for automatic parameter changes.
//!
//! Pure functions over data the manager has already fetched, so each gate
//! can be tested without a store or collaborators. Gates run in a fixed
//! order and the first failure wins.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::params::{self, ParamClass};
use crate::types::{RegimeStatus, Recommendation};

/// Maximum relative change per parameter class, as fractions (0.05 = 5%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MagnitudeCaps {
    pub confidence_threshold: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub position_size: f64,
    pub grid: f64,
}

impl Default for MagnitudeCaps {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.05,
            stop_loss: 0.20,
            take_profit: 0.20,
            position_size: 0.30,
            grid: 0.20,
        }
    }
}

impl MagnitudeCaps {
    pub fn for_class(&self, class: ParamClass) -> f64 {
        match class {
            ParamClass::ConfidenceThreshold => self.confidence_threshold,
            ParamClass::StopLoss => self.stop_loss,
            ParamClass::TakeProfit => self.take_profit,
            ParamClass::PositionSize => self.position_size,
            ParamClass::Grid => self.grid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    /// Automatic adjustments allowed per rolling 24 hours, system-wide.
    pub daily_cap: usize,
    pub magnitude_caps: MagnitudeCaps,
    pub min_regime_stable: Duration,
    /// Real trades required since the last adjustment to the parameter.
    pub min_real_trades: usize,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            daily_cap: 3,
            magnitude_caps: MagnitudeCaps::default(),
            min_regime_stable: Duration::hours(12),
            min_real_trades: 10,
        }
    }
}

/// Why a recommendation was not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    UnknownParameter(String),
    Invalid(String),
    /// Production moved since the recommendation was generated.
    Stale { expected: f64, actual: Option<f64> },
    DailyCapReached { count: usize, cap: usize },
    MagnitudeExceeded { class: ParamClass, change_pct: f64, cap_pct: f64 },
    RegimeUnstable { stable_hours: f64, required_hours: f64 },
    InsufficientRealTrades { have: usize, need: usize },
    /// The recommendation was already consumed.
    NotPending,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::UnknownParameter(name) => write!(f, "unknown parameter {name}"),
            RejectionReason::Invalid(msg) => write!(f, "invalid value: {msg}"),
            RejectionReason::Stale { expected, actual } => match actual {
                Some(v) => write!(f, "stale: production value is {v}, recommendation assumed {expected}"),
                None => write!(f, "stale: parameter no longer configured (assumed {expected})"),
            },
            RejectionReason::DailyCapReached { count, cap } => {
                write!(f, "daily cap reached: {count} automatic adjustments in the last 24h (cap {cap})")
            }
            RejectionReason::MagnitudeExceeded { class, change_pct, cap_pct } => write!(
                f,
                "magnitude exceeded: {class} change of {change_pct:.1}% is over the {cap_pct:.1}% cap"
            ),
            RejectionReason::RegimeUnstable { stable_hours, required_hours } => write!(
                f,
                "regime unstable: stable for {stable_hours:.1}h, {required_hours:.1}h required"
            ),
            RejectionReason::InsufficientRealTrades { have, need } => {
                write!(f, "insufficient real trades since last adjustment: {have} of {need}")
            }
            RejectionReason::NotPending => write!(f, "recommendation already consumed"),
        }
    }
}

/// Everything the gates look at for one recommendation.
#[derive(Debug, Clone)]
pub struct GateInputs<'a> {
    pub recommendation: &'a Recommendation,
    /// Current production value of the parameter.
    pub current_value: Option<f64>,
    /// Automatic adjustments created in the trailing 24 hours.
    pub automatic_last_24h: usize,
    pub regime: &'a RegimeStatus,
    pub real_trades_since_last: usize,
    pub now: DateTime<Utc>,
}

/// Names of the gates, in evaluation order, as recorded on an adjustment.
pub const CHECK_VALIDATION: &str = "validation";
pub const CHECK_DAILY_CAP: &str = "daily_cap";
pub const CHECK_MAGNITUDE: &str = "magnitude";
pub const CHECK_REGIME: &str = "regime_stability";
pub const CHECK_REAL_TRADES: &str = "real_trades";

/// Run every gate. On success returns the names of the checks passed.
pub fn evaluate(policy: &SafetyPolicy, inputs: &GateInputs<'_>) -> Result<Vec<String>, RejectionReason> {
    let rec = inputs.recommendation;
    let spec = params::spec(&rec.parameter)
        .ok_or_else(|| RejectionReason::UnknownParameter(rec.parameter.clone()))?;

    match inputs.current_value {
        Some(v) if (v - rec.current_value).abs() <= 1e-9 => {}
        actual => {
            return Err(RejectionReason::Stale {
                expected: rec.current_value,
                actual,
            })
        }
    }
    spec.validate(rec.recommended_value)
        .map_err(|e| RejectionReason::Invalid(e.to_string()))?;

    if inputs.automatic_last_24h >= policy.daily_cap {
        return Err(RejectionReason::DailyCapReached {
            count: inputs.automatic_last_24h,
            cap: policy.daily_cap,
        });
    }

    let change = params::relative_change(rec.current_value, rec.recommended_value);
    let cap = policy.magnitude_caps.for_class(spec.class);
    if change > cap + 1e-9 {
        return Err(RejectionReason::MagnitudeExceeded {
            class: spec.class,
            change_pct: change * 100.0,
            cap_pct: cap * 100.0,
        });
    }

    let stable_for = inputs.regime.stable_for(inputs.now);
    if stable_for < policy.min_regime_stable {
        return Err(RejectionReason::RegimeUnstable {
            stable_hours: stable_for.num_minutes() as f64 / 60.0,
            required_hours: policy.min_regime_stable.num_minutes() as f64 / 60.0,
        });
    }

    if inputs.real_trades_since_last < policy.min_real_trades {
        return Err(RejectionReason::InsufficientRealTrades {
            have: inputs.real_trades_since_last,
            need: policy.min_real_trades,
        });
    }

    Ok([CHECK_VALIDATION, CHECK_DAILY_CAP, CHECK_MAGNITUDE, CHECK_REGIME, CHECK_REAL_TRADES]
        .iter()
        .map(|s| s.to_string())
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
