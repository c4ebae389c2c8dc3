//! Shared types for the CANARY engine.
//!
//! These types form the data model used across all modules: shadow
//! decisions and their replayed outcomes, performance snapshots,
//! recommendations, and the adjustments that mutate production.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::params::ParameterSet;
use crate::shadow::registry::VariationId;

/// Feature values the detector saw at scan time.
pub type FeatureSnapshot = BTreeMap<String, f64>;

/// Strategy key used for snapshots aggregated across all strategies.
pub const OVERALL: &str = "OVERALL";

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    /// +1 for long, -1 for short. Multiplies raw price moves into P&L.
    pub fn sign(&self) -> f64 {
        match self {
            TradeSide::Long => 1.0,
            TradeSide::Short => -1.0,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Long => write!(f, "LONG"),
            TradeSide::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for TradeSide {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" => Ok(TradeSide::Long),
            "SHORT" => Ok(TradeSide::Short),
            other => Err(CanaryError::Validation(format!("unknown trade side: {other}"))),
        }
    }
}

/// Why a simulated position closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TimeLimit,
    /// Forward data stopped short of the hold horizon; marked to last close.
    StillOpen,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TimeLimit => write!(f, "TIME_LIMIT"),
            ExitReason::StillOpen => write!(f, "STILL_OPEN"),
        }
    }
}

impl std::str::FromStr for ExitReason {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TAKE_PROFIT" => Ok(ExitReason::TakeProfit),
            "STOP_LOSS" => Ok(ExitReason::StopLoss),
            "TIME_LIMIT" => Ok(ExitReason::TimeLimit),
            "STILL_OPEN" => Ok(ExitReason::StillOpen),
            other => Err(CanaryError::Validation(format!("unknown exit reason: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Shadow decisions and outcomes
// ---------------------------------------------------------------------------

/// One conditional order in a DCA-style grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    /// Fraction of the full position allocated to this level.
    pub weight: f64,
}

/// Multi-level order grid. Stop and target are re-derived from the
/// average fill price after every fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPlan {
    pub levels: Vec<GridLevel>,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

/// What one variation would have done at one production scan.
/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowDecision {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub variation: VariationId,
    pub strategy: String,
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub would_take_trade: bool,
    pub side: TradeSide,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub position_size_mult: f64,
    pub grid: Option<GridPlan>,
    /// Effective parameter values this variation evaluated with.
    pub params: ParameterSet,
    pub features: FeatureSnapshot,
    pub ml_confidence: Option<f64>,
}

/// Replayed result of a taken shadow decision. Written exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowOutcome {
    pub decision_id: Uuid,
    /// Net of simulated fees, relative to filled notional.
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub exit_price: f64,
    pub avg_entry_price: f64,
    /// Share of the planned position that actually filled (1.0 for single entries).
    pub filled_fraction: f64,
    pub holding_minutes: i64,
    pub evaluated_at: DateTime<Utc>,
}

impl ShadowOutcome {
    pub fn is_win(&self) -> bool {
        self.pnl_pct > 0.0
    }
}

/// An outcome joined with the decision fields the analyzer aggregates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedShadow {
    pub variation: VariationId,
    pub strategy: String,
    pub symbol: String,
    pub decided_at: DateTime<Utc>,
    pub position_size_mult: f64,
    /// Parameters the decision was made with.
    pub params: ParameterSet,
    pub outcome: ShadowOutcome,
}

impl ResolvedShadow {
    /// Return contribution scaled by position size and grid fill.
    pub fn weighted_return(&self) -> f64 {
        self.outcome.pnl_pct * self.position_size_mult * self.outcome.filled_fraction
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Derived per-(variation, strategy, window) statistics. Recomputed in full
/// on every analyzer pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub variation: VariationId,
    /// Strategy name or [`OVERALL`].
    pub strategy: String,
    pub window_hours: u32,
    pub trade_count: usize,
    /// 0–100.
    pub win_rate: f64,
    pub avg_pnl_pct: f64,
    pub median_pnl_pct: f64,
    pub avg_weighted_return: f64,
    pub delta_vs_champion: Option<f64>,
    pub p_value: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

/// Evidence attached to a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportingStats {
    pub window_hours: u32,
    pub challenger_samples: usize,
    pub champion_samples: usize,
    pub challenger_win_rate: f64,
    pub champion_win_rate: f64,
    pub challenger_mean: f64,
    pub champion_mean: f64,
    pub delta: f64,
    pub p_value: f64,
}

/// Proposed change to one production parameter. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub strategy: String,
    pub parameter: String,
    pub current_value: f64,
    pub recommended_value: f64,
    pub variation: VariationId,
    pub stats: SupportingStats,
    pub generated_at: DateTime<Utc>,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}: {} -> {} (via {}, n={}, delta={:+.3}, p={:.3})",
            self.strategy,
            self.parameter,
            self.current_value,
            self.recommended_value,
            self.variation,
            self.stats.challenger_samples,
            self.stats.delta,
            self.stats.p_value,
        )
    }
}

/// Consumption state of a stored recommendation. Leaves `Pending` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendationStatus {
    Pending,
    Applied,
    Rejected,
    Expired,
}

impl fmt::Display for RecommendationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecommendationStatus::Pending => write!(f, "PENDING"),
            RecommendationStatus::Applied => write!(f, "APPLIED"),
            RecommendationStatus::Rejected => write!(f, "REJECTED"),
            RecommendationStatus::Expired => write!(f, "EXPIRED"),
        }
    }
}

impl std::str::FromStr for RecommendationStatus {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RecommendationStatus::Pending),
            "APPLIED" => Ok(RecommendationStatus::Applied),
            "REJECTED" => Ok(RecommendationStatus::Rejected),
            "EXPIRED" => Ok(RecommendationStatus::Expired),
            other => Err(CanaryError::Validation(format!("unknown recommendation status: {other}"))),
        }
    }
}

/// A recommendation as stored, with its consumption record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRecord {
    pub recommendation: Recommendation,
    pub status: RecommendationStatus,
    pub reason: Option<String>,
    pub consumed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Adjustments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentStatus {
    Active,
    RolledBack,
    Superseded,
}

impl fmt::Display for AdjustmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentStatus::Active => write!(f, "ACTIVE"),
            AdjustmentStatus::RolledBack => write!(f, "ROLLED_BACK"),
            AdjustmentStatus::Superseded => write!(f, "SUPERSEDED"),
        }
    }
}

impl std::str::FromStr for AdjustmentStatus {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AdjustmentStatus::Active),
            "ROLLED_BACK" => Ok(AdjustmentStatus::RolledBack),
            "SUPERSEDED" => Ok(AdjustmentStatus::Superseded),
            other => Err(CanaryError::Validation(format!("unknown adjustment status: {other}"))),
        }
    }
}

/// How an adjustment came to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyMode {
    Automatic,
    Forced,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMode::Automatic => write!(f, "AUTOMATIC"),
            ApplyMode::Forced => write!(f, "FORCED"),
        }
    }
}

impl std::str::FromStr for ApplyMode {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATIC" => Ok(ApplyMode::Automatic),
            "FORCED" => Ok(ApplyMode::Forced),
            other => Err(CanaryError::Validation(format!("unknown apply mode: {other}"))),
        }
    }
}

/// Live performance of a strategy just before an adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveBaseline {
    pub trades: usize,
    /// 0–100.
    pub win_rate: f64,
    pub avg_pnl_pct: f64,
}

/// The only record through which production parameters change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub id: Uuid,
    pub recommendation_id: Uuid,
    pub strategy: String,
    pub parameter: String,
    pub old_value: f64,
    pub new_value: f64,
    pub applied_at: DateTime<Utc>,
    pub mode: ApplyMode,
    pub checks_passed: Vec<String>,
    pub baseline: Option<LiveBaseline>,
    pub status: AdjustmentStatus,
    pub underperforming_since: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
}

impl Adjustment {
    pub fn is_active(&self) -> bool {
        self.status == AdjustmentStatus::Active
    }
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}.{}: {} -> {} ({}, {})",
            self.id, self.strategy, self.parameter, self.old_value, self.new_value, self.mode, self.status,
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborator data
// ---------------------------------------------------------------------------

/// One OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// A completed real (non-shadow) trade from the live ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTrade {
    pub id: String,
    pub strategy: String,
    pub symbol: String,
    pub closed_at: DateTime<Utc>,
    pub pnl_pct: f64,
}

impl LiveTrade {
    pub fn is_win(&self) -> bool {
        self.pnl_pct > 0.0
    }
}

/// Current market regime reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeStatus {
    pub stable: bool,
    /// When the current state (stable or unstable) began.
    pub since: DateTime<Utc>,
    pub label: Option<String>,
}

impl RegimeStatus {
    /// How long the regime has been stable; zero while unstable.
    pub fn stable_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        if self.stable && now > self.since {
            now - self.since
        } else {
            chrono::Duration::zero()
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CANARY.
#[derive(Debug, thiserror::Error)]
pub enum CanaryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Price data error ({symbol}): {message}")]
    PriceData { symbol: String, message: String },

    #[error("Detector error ({strategy}): {message}")]
    Detector { strategy: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
