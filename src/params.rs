//! Strategy parameter schema and the live champion configuration.
//!
//! Every tunable parameter is declared once in [`SCHEMA`] with its kind,
//! valid range and safety class. Detectors, the variation registry and the
//! threshold manager all validate against the same table.
//!
//! The champion configuration is a single versioned record. Readers take an
//! `Arc` snapshot per use; only the threshold manager installs new versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::CanaryError;

const EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Float,
    Integer,
}

/// Safety class. Each class carries its own magnitude cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamClass {
    ConfidenceThreshold,
    StopLoss,
    TakeProfit,
    PositionSize,
    Grid,
}

impl fmt::Display for ParamClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamClass::ConfidenceThreshold => write!(f, "confidence_threshold"),
            ParamClass::StopLoss => write!(f, "stop_loss"),
            ParamClass::TakeProfit => write!(f, "take_profit"),
            ParamClass::PositionSize => write!(f, "position_size"),
            ParamClass::Grid => write!(f, "grid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub min: f64,
    pub max: f64,
    pub class: ParamClass,
}

pub const MIN_CONFIDENCE: &str = "min_confidence";
pub const STOP_LOSS_PCT: &str = "stop_loss_pct";
pub const TAKE_PROFIT_PCT: &str = "take_profit_pct";
pub const POSITION_SIZE_MULT: &str = "position_size_mult";
pub const GRID_LEVELS: &str = "grid_levels";
pub const GRID_SPACING_PCT: &str = "grid_spacing_pct";

pub const SCHEMA: &[ParamSpec] = &[
    ParamSpec { name: MIN_CONFIDENCE, kind: ParamKind::Float, min: 0.0, max: 1.0, class: ParamClass::ConfidenceThreshold },
    ParamSpec { name: STOP_LOSS_PCT, kind: ParamKind::Float, min: 0.1, max: 50.0, class: ParamClass::StopLoss },
    ParamSpec { name: TAKE_PROFIT_PCT, kind: ParamKind::Float, min: 0.1, max: 100.0, class: ParamClass::TakeProfit },
    ParamSpec { name: POSITION_SIZE_MULT, kind: ParamKind::Float, min: 0.1, max: 3.0, class: ParamClass::PositionSize },
    ParamSpec { name: GRID_LEVELS, kind: ParamKind::Integer, min: 1.0, max: 10.0, class: ParamClass::Grid },
    ParamSpec { name: GRID_SPACING_PCT, kind: ParamKind::Float, min: 0.1, max: 20.0, class: ParamClass::Grid },
];

/// Look up a parameter's schema entry.
pub fn spec(name: &str) -> Option<&'static ParamSpec> {
    SCHEMA.iter().find(|s| s.name == name)
}

impl ParamSpec {
    /// Check range and integrality.
    pub fn validate(&self, value: f64) -> Result<(), CanaryError> {
        if !value.is_finite() {
            return Err(CanaryError::Validation(format!("{} must be finite, got {value}", self.name)));
        }
        if value < self.min - EPSILON || value > self.max + EPSILON {
            return Err(CanaryError::Validation(format!(
                "{} = {value} outside [{}, {}]",
                self.name, self.min, self.max
            )));
        }
        if self.kind == ParamKind::Integer && (value - value.round()).abs() > EPSILON {
            return Err(CanaryError::Validation(format!("{} must be an integer, got {value}", self.name)));
        }
        Ok(())
    }

    /// Snap a derived value (e.g. after scaling) back onto the valid domain.
    pub fn normalize(&self, value: f64) -> f64 {
        let v = match self.kind {
            ParamKind::Integer => value.round(),
            ParamKind::Float => value,
        };
        v.clamp(self.min, self.max)
    }
}

/// |new - old| / |old|. A change away from zero is unbounded.
pub fn relative_change(old: f64, new: f64) -> f64 {
    let diff = (new - old).abs();
    if diff < EPSILON {
        0.0
    } else if old.abs() < EPSILON {
        f64::INFINITY
    } else {
        diff / old.abs()
    }
}

// ---------------------------------------------------------------------------
// Parameter sets
// ---------------------------------------------------------------------------

/// Parameter name → value for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, f64>);

impl ParameterSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) -> Option<f64> {
        self.0.insert(name.into(), value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names whose values differ from `other` (or are missing from it).
    pub fn differing(&self, other: &ParameterSet) -> Vec<String> {
        self.0
            .iter()
            .filter(|(name, value)| match other.get(name) {
                Some(v) => (v - **value).abs() > EPSILON,
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every entry must be a known parameter within range.
    pub fn validate(&self) -> Result<(), CanaryError> {
        for (name, value) in &self.0 {
            let spec = spec(name)
                .ok_or_else(|| CanaryError::Validation(format!("unknown parameter: {name}")))?;
            spec.validate(*value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, f64)> for ParameterSet {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Champion configuration
// ---------------------------------------------------------------------------

/// Live production parameters for every strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionConfig {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    /// Adjustment that produced this version, if any.
    pub last_adjustment: Option<Uuid>,
    pub strategies: BTreeMap<String, ParameterSet>,
}

impl ChampionConfig {
    pub fn new(strategies: BTreeMap<String, ParameterSet>) -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            last_adjustment: None,
            strategies,
        }
    }

    pub fn params(&self, strategy: &str) -> Option<&ParameterSet> {
        self.strategies.get(strategy)
    }

    pub fn value(&self, strategy: &str, parameter: &str) -> Option<f64> {
        self.strategies.get(strategy).and_then(|p| p.get(parameter))
    }

    /// Next version with one parameter changed by `adjustment`.
    pub fn with_value(
        &self,
        strategy: &str,
        parameter: &str,
        value: f64,
        adjustment: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ChampionConfig, CanaryError> {
        let spec = spec(parameter)
            .ok_or_else(|| CanaryError::Validation(format!("unknown parameter: {parameter}")))?;
        spec.validate(value)?;

        let mut next = self.clone();
        let params = next
            .strategies
            .get_mut(strategy)
            .ok_or_else(|| CanaryError::NotFound(format!("strategy {strategy}")))?;
        params.set(parameter, value);
        next.version = self.version + 1;
        next.updated_at = now;
        next.last_adjustment = Some(adjustment);
        Ok(next)
    }
}

/// Shared handle to the current champion configuration.
pub struct ChampionHandle {
    current: RwLock<Arc<ChampionConfig>>,
}

impl ChampionHandle {
    pub fn new(config: ChampionConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Immutable snapshot; unaffected by later installs.
    pub async fn snapshot(&self) -> Arc<ChampionConfig> {
        self.current.read().await.clone()
    }

    /// Swap in a new version. Only the threshold manager calls this, after
    /// the owning adjustment has been persisted.
    pub(crate) async fn install(&self, next: ChampionConfig) {
        *self.current.write().await = Arc::new(next);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
