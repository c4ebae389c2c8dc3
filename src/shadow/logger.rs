//! Shadow decision logger.
//!
//! Called inline with every production scan. For each registered variation
//! the strategy's entry rule is re-run under that variation's parameters
//! and the verdict is written as one `ShadowDecision`, all tagged with the
//! production scan id. Nothing in here can fail the caller: detector and
//! store errors are logged and the scan carries on.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::VariationRegistry;
use crate::params::ChampionHandle;
use crate::storage::ShadowStore;
use crate::strategy::{DetectorDecision, DetectorSet};
use crate::types::{FeatureSnapshot, ShadowDecision};

/// Inputs of one production scan.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub scan_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub strategy: String,
    pub features: FeatureSnapshot,
    pub price: f64,
    pub ml_confidence: Option<f64>,
    /// What production actually decided. Recorded verbatim for CHAMPION
    /// when present.
    pub champion_decision: Option<DetectorDecision>,
}

pub struct ShadowLogger {
    store: Arc<dyn ShadowStore>,
    registry: Arc<VariationRegistry>,
    detectors: DetectorSet,
    champion: Arc<ChampionHandle>,
}

impl ShadowLogger {
    pub fn new(
        store: Arc<dyn ShadowStore>,
        registry: Arc<VariationRegistry>,
        detectors: DetectorSet,
        champion: Arc<ChampionHandle>,
    ) -> Self {
        Self {
            store,
            registry,
            detectors,
            champion,
        }
    }

    /// Build the per-variation decisions for a scan without writing them.
    pub async fn decide(&self, scan: &ScanContext) -> Vec<ShadowDecision> {
        let champion = self.champion.snapshot().await;
        let Some(base) = champion.params(&scan.strategy) else {
            warn!(strategy = %scan.strategy, "No champion parameters for strategy; shadow scan skipped");
            return Vec::new();
        };
        let Some(detector) = self.detectors.get(&scan.strategy) else {
            warn!(strategy = %scan.strategy, "No detector registered; shadow scan skipped");
            return Vec::new();
        };

        let mut decisions = Vec::with_capacity(self.registry.variations().len());
        for variation in self.registry.variations() {
            let params = self.registry.resolve(variation.id, base);

            let verdict = match (&scan.champion_decision, variation.id.is_champion()) {
                (Some(production), true) => production.clone(),
                _ => match detector.evaluate(&scan.features, &params, scan.price, scan.ml_confidence) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            variation = %variation.id,
                            strategy = %scan.strategy,
                            symbol = %scan.symbol,
                            error = %e,
                            "Detector failed for variation"
                        );
                        continue;
                    }
                },
            };

            decisions.push(ShadowDecision {
                id: Uuid::new_v4(),
                scan_id: scan.scan_id,
                variation: variation.id,
                strategy: scan.strategy.clone(),
                symbol: scan.symbol.clone(),
                timestamp: scan.timestamp,
                would_take_trade: verdict.take,
                side: verdict.side,
                entry_price: verdict.entry_price,
                stop_loss: verdict.stop_loss,
                take_profit: verdict.take_profit,
                position_size_mult: verdict.position_size_mult,
                grid: verdict.grid,
                params,
                features: scan.features.clone(),
                ml_confidence: scan.ml_confidence,
            });
        }
        decisions
    }

    /// Record what every variation would have done. Returns the number of
    /// decisions written (zero on any failure).
    pub async fn log_scan(&self, scan: &ScanContext) -> usize {
        let decisions = self.decide(scan).await;
        if decisions.is_empty() {
            return 0;
        }

        // One attempt only: this runs on the scan path and a lost batch is
        // just a missing sample.
        match self.store.insert_decisions(&decisions).await {
            Ok(()) => {
                let taken = decisions.iter().filter(|d| d.would_take_trade).count();
                debug!(
                    scan_id = %scan.scan_id,
                    strategy = %scan.strategy,
                    symbol = %scan.symbol,
                    written = decisions.len(),
                    taken,
                    "Shadow decisions recorded"
                );
                decisions.len()
            }
            Err(e) => {
                warn!(scan_id = %scan.scan_id, error = %e, "Failed to record shadow decisions");
                0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ChampionConfig, ParameterSet, MIN_CONFIDENCE, STOP_LOSS_PCT, TAKE_PROFIT_PCT};
    use crate::shadow::registry::VariationId;
    use crate::storage::MemoryStore;
    use crate::strategy::rules::ConfidenceGate;
    use crate::types::TradeSide;
    use std::collections::BTreeMap;

    fn setup(store: Arc<MemoryStore>) -> ShadowLogger {
        let params: ParameterSet = [
            (MIN_CONFIDENCE.to_string(), 0.60),
            (STOP_LOSS_PCT.to_string(), 2.0),
            (TAKE_PROFIT_PCT.to_string(), 4.0),
        ]
        .into_iter()
        .collect();
        let champion = ChampionConfig::new(BTreeMap::from([("swing".to_string(), params)]));
        ShadowLogger::new(
            store,
            Arc::new(VariationRegistry::default_catalog()),
            DetectorSet::new().with(Arc::new(ConfidenceGate::new("swing", TradeSide::Long))),
            Arc::new(ChampionHandle::new(champion)),
        )
    }

    fn scan(confidence: f64) -> ScanContext {
        ScanContext {
            scan_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            symbol: "BTCUSDT".into(),
            strategy: "swing".into(),
            features: FeatureSnapshot::new(),
            price: 100.0,
            ml_confidence: Some(confidence),
            champion_decision: None,
        }
    }

    #[tokio::test]
    async fn test_one_decision_per_variation() {
        let store = Arc::new(MemoryStore::new());
        let logger = setup(store.clone());
        let ctx = scan(0.61);

        assert_eq!(logger.log_scan(&ctx).await, VariationId::ALL.len());
        let rows = store.decisions_for_scan(ctx.scan_id).await.unwrap();
        assert_eq!(rows.len(), VariationId::ALL.len());

        // 0.61 clears 0.60 and 0.576 but not the stricter 0.624.
        let by = |id| rows.iter().find(|d| d.variation == id).unwrap();
        assert!(by(VariationId::Champion).would_take_trade);
        assert!(by(VariationId::Challenger2).would_take_trade);
        assert!(!by(VariationId::Challenger1).would_take_trade);
        // Tighter stop variation recorded its own stop level.
        assert!((by(VariationId::Challenger3).stop_loss.unwrap() - 98.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_champion_uses_production_verdict() {
        let store = Arc::new(MemoryStore::new());
        let logger = setup(store.clone());
        let mut ctx = scan(0.9);
        ctx.champion_decision = Some(DetectorDecision::skip(TradeSide::Long, 100.0));

        logger.log_scan(&ctx).await;
        let rows = store.decisions_for_scan(ctx.scan_id).await.unwrap();
        let champion = rows.iter().find(|d| d.variation.is_champion()).unwrap();
        assert!(!champion.would_take_trade);
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let logger = setup(store.clone());
        store.set_offline(true);
        assert_eq!(logger.log_scan(&scan(0.9)).await, 0);
    }

    #[tokio::test]
    async fn test_store_outage_does_not_hold_up_the_scan() {
        let store = Arc::new(MemoryStore::new());
        let logger = setup(store.clone());
        store.set_offline(true);
        let written = tokio::time::timeout(std::time::Duration::from_millis(250), logger.log_scan(&scan(0.9)))
            .await
            .expect("scan path waited on store retries");
        assert_eq!(written, 0);

        store.set_offline(false);
        assert!(logger.log_scan(&scan(0.9)).await > 0);
    }

    #[tokio::test]
    async fn test_unknown_strategy_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let logger = setup(store.clone());
        let mut ctx = scan(0.9);
        ctx.strategy = "channel".into();
        assert_eq!(logger.log_scan(&ctx).await, 0);
    }
}
