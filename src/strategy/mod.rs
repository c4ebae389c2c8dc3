//! Strategy detector seam.
//!
//! Detectors decide whether a setup exists and, if so, with what entry,
//! stop, target and size. They are pure functions of the feature snapshot
//! and a parameter set, which is what lets the shadow logger re-run the
//! same entry rule under every variation's overrides.

pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use crate::params::ParameterSet;
use crate::types::{CanaryError, FeatureSnapshot, GridPlan, TradeSide};

/// A detector's verdict for one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorDecision {
    pub take: bool,
    pub side: TradeSide,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub position_size_mult: f64,
    pub grid: Option<GridPlan>,
}

impl DetectorDecision {
    /// A "no trade" verdict at the scan price.
    pub fn skip(side: TradeSide, price: f64) -> Self {
        Self {
            take: false,
            side,
            entry_price: price,
            stop_loss: None,
            take_profit: None,
            position_size_mult: 0.0,
            grid: None,
        }
    }
}

/// Abstraction over strategy entry rules.
pub trait StrategyDetector: Send + Sync {
    /// Strategy name this detector serves (matches champion config keys).
    fn strategy(&self) -> &str;

    /// Evaluate the entry rule under `params`.
    fn evaluate(
        &self,
        features: &FeatureSnapshot,
        params: &ParameterSet,
        price: f64,
        ml_confidence: Option<f64>,
    ) -> Result<DetectorDecision, CanaryError>;
}

/// Detectors keyed by strategy name.
#[derive(Clone, Default)]
pub struct DetectorSet {
    detectors: HashMap<String, Arc<dyn StrategyDetector>>,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, detector: Arc<dyn StrategyDetector>) {
        self.detectors.insert(detector.strategy().to_string(), detector);
    }

    pub fn with(mut self, detector: Arc<dyn StrategyDetector>) -> Self {
        self.register(detector);
        self
    }

    pub fn get(&self, strategy: &str) -> Option<&Arc<dyn StrategyDetector>> {
        self.detectors.get(strategy)
    }

    pub fn strategies(&self) -> impl Iterator<Item = &String> {
        self.detectors.keys()
    }
}
