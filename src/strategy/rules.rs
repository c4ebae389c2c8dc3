//! Reference entry rules.
//!
//! `ConfidenceGate` covers swing/channel-style strategies: take the trade
//! when the model score clears `min_confidence`, with fixed-percentage stop
//! and target. `GridEntry` covers DCA-style strategies: the same gate, but
//! the position is laid out as a ladder of conditional orders.

use tracing::debug;

use super::{DetectorDecision, StrategyDetector};
use crate::params::{
    ParameterSet, GRID_LEVELS, GRID_SPACING_PCT, MIN_CONFIDENCE, POSITION_SIZE_MULT, STOP_LOSS_PCT,
    TAKE_PROFIT_PCT,
};
use crate::types::{CanaryError, FeatureSnapshot, GridLevel, GridPlan, TradeSide};

/// Feature read when no ML confidence accompanies the scan.
pub const SIGNAL_SCORE_FEATURE: &str = "signal_score";

fn require(strategy: &str, params: &ParameterSet, name: &str) -> Result<f64, CanaryError> {
    params.get(name).ok_or_else(|| CanaryError::Detector {
        strategy: strategy.to_string(),
        message: format!("missing parameter {name}"),
    })
}

fn score(features: &FeatureSnapshot, ml_confidence: Option<f64>) -> Option<f64> {
    ml_confidence.or_else(|| features.get(SIGNAL_SCORE_FEATURE).copied())
}

fn check_price(strategy: &str, price: f64) -> Result<(), CanaryError> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(CanaryError::Detector {
            strategy: strategy.to_string(),
            message: format!("invalid scan price {price}"),
        })
    }
}

/// Stop and target prices for an entry at `price`.
pub fn bracket(side: TradeSide, price: f64, stop_pct: f64, target_pct: f64) -> (f64, f64) {
    let s = side.sign();
    (price * (1.0 - s * stop_pct / 100.0), price * (1.0 + s * target_pct / 100.0))
}

// ---------------------------------------------------------------------------
// Confidence gate
// ---------------------------------------------------------------------------

pub struct ConfidenceGate {
    name: String,
    side: TradeSide,
}

impl ConfidenceGate {
    pub fn new(name: impl Into<String>, side: TradeSide) -> Self {
        Self { name: name.into(), side }
    }
}

impl StrategyDetector for ConfidenceGate {
    fn strategy(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        features: &FeatureSnapshot,
        params: &ParameterSet,
        price: f64,
        ml_confidence: Option<f64>,
    ) -> Result<DetectorDecision, CanaryError> {
        check_price(&self.name, price)?;
        let min_confidence = require(&self.name, params, MIN_CONFIDENCE)?;
        let stop_pct = require(&self.name, params, STOP_LOSS_PCT)?;
        let target_pct = require(&self.name, params, TAKE_PROFIT_PCT)?;
        let size = params.get(POSITION_SIZE_MULT).unwrap_or(1.0);

        let Some(confidence) = score(features, ml_confidence) else {
            debug!(strategy = %self.name, "No confidence score; skipping");
            return Ok(DetectorDecision::skip(self.side, price));
        };
        if confidence < min_confidence {
            return Ok(DetectorDecision::skip(self.side, price));
        }

        let (stop, target) = bracket(self.side, price, stop_pct, target_pct);
        Ok(DetectorDecision {
            take: true,
            side: self.side,
            entry_price: price,
            stop_loss: Some(stop),
            take_profit: Some(target),
            position_size_mult: size,
            grid: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Grid entry
// ---------------------------------------------------------------------------

pub struct GridEntry {
    name: String,
    side: TradeSide,
}

impl GridEntry {
    pub fn new(name: impl Into<String>, side: TradeSide) -> Self {
        Self { name: name.into(), side }
    }
}

impl StrategyDetector for GridEntry {
    fn strategy(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        features: &FeatureSnapshot,
        params: &ParameterSet,
        price: f64,
        ml_confidence: Option<f64>,
    ) -> Result<DetectorDecision, CanaryError> {
        check_price(&self.name, price)?;
        let stop_pct = require(&self.name, params, STOP_LOSS_PCT)?;
        let target_pct = require(&self.name, params, TAKE_PROFIT_PCT)?;
        let levels = require(&self.name, params, GRID_LEVELS)?.round().max(1.0) as usize;
        let spacing = require(&self.name, params, GRID_SPACING_PCT)?;
        let size = params.get(POSITION_SIZE_MULT).unwrap_or(1.0);

        // The gate is optional for grids: no min_confidence means always arm.
        if let Some(min_confidence) = params.get(MIN_CONFIDENCE) {
            match score(features, ml_confidence) {
                Some(c) if c >= min_confidence => {}
                _ => return Ok(DetectorDecision::skip(self.side, price)),
            }
        }

        let s = self.side.sign();
        let weight = 1.0 / levels as f64;
        let ladder: Vec<GridLevel> = (0..levels)
            .map(|i| GridLevel {
                price: price * (1.0 - s * spacing * i as f64 / 100.0),
                weight,
            })
            .collect();

        let (stop, target) = bracket(self.side, price, stop_pct, target_pct);
        Ok(DetectorDecision {
            take: true,
            side: self.side,
            entry_price: price,
            stop_loss: Some(stop),
            take_profit: Some(target),
            position_size_mult: size,
            grid: Some(GridPlan {
                levels: ladder,
                stop_loss_pct: stop_pct,
                take_profit_pct: target_pct,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
