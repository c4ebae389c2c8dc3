//! In-process store.
//!
//! Everything sits behind one mutex, so each trait call is atomic. Used by
//! tests and by `storage.backend = "memory"` for dry runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::ShadowStore;
use crate::params::ChampionConfig;
use crate::types::{
    Adjustment, AdjustmentStatus, CanaryError, PerformanceSnapshot, Recommendation,
    RecommendationRecord, RecommendationStatus, ResolvedShadow, ShadowDecision, ShadowOutcome,
};

#[derive(Default)]
struct Tables {
    decisions: Vec<ShadowDecision>,
    decision_ids: HashSet<Uuid>,
    outcomes: HashMap<Uuid, ShadowOutcome>,
    snapshots: Vec<PerformanceSnapshot>,
    recommendations: Vec<RecommendationRecord>,
    adjustments: Vec<Adjustment>,
    champion: Option<ChampionConfig>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable store: every call fails until re-enabled.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.offline.load(Ordering::SeqCst) {
            bail!(CanaryError::Storage("memory store offline".to_string()));
        }
        Ok(match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }
}

#[async_trait]
impl ShadowStore for MemoryStore {
    async fn insert_decisions(&self, decisions: &[ShadowDecision]) -> Result<()> {
        let mut t = self.tables()?;
        if let Some(dup) = decisions.iter().find(|d| t.decision_ids.contains(&d.id)) {
            bail!(CanaryError::Storage(format!("duplicate decision id {}", dup.id)));
        }
        let same_slot = |a: &ShadowDecision, b: &ShadowDecision| {
            a.scan_id == b.scan_id && a.variation == b.variation && a.strategy == b.strategy && a.symbol == b.symbol
        };
        for (i, d) in decisions.iter().enumerate() {
            if t.decisions.iter().chain(&decisions[..i]).any(|e| same_slot(e, d)) {
                bail!(CanaryError::Storage(format!(
                    "decision for scan {} / {} / {} / {} already recorded",
                    d.scan_id, d.variation, d.strategy, d.symbol
                )));
            }
        }
        for d in decisions {
            t.decision_ids.insert(d.id);
            t.decisions.push(d.clone());
        }
        Ok(())
    }

    async fn decisions_for_scan(&self, scan_id: Uuid) -> Result<Vec<ShadowDecision>> {
        let t = self.tables()?;
        Ok(t.decisions.iter().filter(|d| d.scan_id == scan_id).cloned().collect())
    }

    async fn pending_decisions(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<ShadowDecision>> {
        let t = self.tables()?;
        let mut pending: Vec<ShadowDecision> = t
            .decisions
            .iter()
            .filter(|d| d.would_take_trade && d.timestamp <= cutoff && !t.outcomes.contains_key(&d.id))
            .cloned()
            .collect();
        pending.sort_by_key(|d| d.timestamp);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn insert_outcome(&self, outcome: &ShadowOutcome) -> Result<bool> {
        let mut t = self.tables()?;
        if !t.decision_ids.contains(&outcome.decision_id) {
            bail!(CanaryError::NotFound(format!("decision {}", outcome.decision_id)));
        }
        if t.outcomes.contains_key(&outcome.decision_id) {
            return Ok(false);
        }
        t.outcomes.insert(outcome.decision_id, outcome.clone());
        Ok(true)
    }

    async fn outcome(&self, decision_id: Uuid) -> Result<Option<ShadowOutcome>> {
        Ok(self.tables()?.outcomes.get(&decision_id).cloned())
    }

    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<ResolvedShadow>> {
        let t = self.tables()?;
        Ok(t
            .decisions
            .iter()
            .filter(|d| d.timestamp >= since)
            .filter_map(|d| {
                t.outcomes.get(&d.id).map(|o| ResolvedShadow {
                    variation: d.variation,
                    strategy: d.strategy.clone(),
                    symbol: d.symbol.clone(),
                    decided_at: d.timestamp,
                    position_size_mult: d.position_size_mult,
                    params: d.params.clone(),
                    outcome: o.clone(),
                })
            })
            .collect())
    }

    async fn replace_snapshots(&self, snapshots: &[PerformanceSnapshot]) -> Result<()> {
        self.tables()?.snapshots = snapshots.to_vec();
        Ok(())
    }

    async fn snapshots(&self) -> Result<Vec<PerformanceSnapshot>> {
        Ok(self.tables()?.snapshots.clone())
    }

    async fn insert_recommendations(&self, recs: &[Recommendation]) -> Result<()> {
        let mut t = self.tables()?;
        for rec in recs {
            t.recommendations.push(RecommendationRecord {
                recommendation: rec.clone(),
                status: RecommendationStatus::Pending,
                reason: None,
                consumed_at: None,
            });
        }
        Ok(())
    }

    async fn recommendation(&self, id: Uuid) -> Result<Option<RecommendationRecord>> {
        let t = self.tables()?;
        Ok(t.recommendations.iter().find(|r| r.recommendation.id == id).cloned())
    }

    async fn pending_recommendations(&self) -> Result<Vec<Recommendation>> {
        let t = self.tables()?;
        Ok(t.recommendations
            .iter()
            .filter(|r| r.status == RecommendationStatus::Pending)
            .map(|r| r.recommendation.clone())
            .collect())
    }

    async fn recent_recommendations(&self, limit: usize) -> Result<Vec<RecommendationRecord>> {
        let t = self.tables()?;
        let mut recs = t.recommendations.clone();
        recs.sort_by(|a, b| b.recommendation.generated_at.cmp(&a.recommendation.generated_at));
        recs.truncate(limit);
        Ok(recs)
    }

    async fn consume_recommendation(
        &self,
        id: Uuid,
        status: RecommendationStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut t = self.tables()?;
        let Some(record) = t.recommendations.iter_mut().find(|r| r.recommendation.id == id) else {
            bail!(CanaryError::NotFound(format!("recommendation {id}")));
        };
        if record.status != RecommendationStatus::Pending {
            return Ok(false);
        }
        record.status = status;
        record.reason = reason;
        record.consumed_at = Some(at);
        Ok(true)
    }

    async fn commit_adjustment(
        &self,
        adjustment: &Adjustment,
        superseded: Option<Uuid>,
        champion: &ChampionConfig,
    ) -> Result<()> {
        let mut t = self.tables()?;

        let rec_idx = t
            .recommendations
            .iter()
            .position(|r| r.recommendation.id == adjustment.recommendation_id)
            .ok_or_else(|| CanaryError::NotFound(format!("recommendation {}", adjustment.recommendation_id)))?;
        if t.recommendations[rec_idx].status != RecommendationStatus::Pending {
            bail!(CanaryError::InvalidState(format!(
                "recommendation {} already {}",
                adjustment.recommendation_id, t.recommendations[rec_idx].status
            )));
        }
        let sup_idx = match superseded {
            Some(id) => Some(
                t.adjustments
                    .iter()
                    .position(|a| a.id == id && a.is_active())
                    .ok_or_else(|| CanaryError::InvalidState(format!("adjustment {id} is not active")))?,
            ),
            None => None,
        };

        // All checks passed; mutate.
        let rec = &mut t.recommendations[rec_idx];
        rec.status = RecommendationStatus::Applied;
        rec.consumed_at = Some(adjustment.applied_at);
        if let Some(i) = sup_idx {
            let prev = &mut t.adjustments[i];
            prev.status = AdjustmentStatus::Superseded;
            prev.closed_at = Some(adjustment.applied_at);
            prev.close_reason = Some(format!("superseded by {}", adjustment.id));
        }
        t.adjustments.push(adjustment.clone());
        t.champion = Some(champion.clone());
        Ok(())
    }

    async fn commit_rollback(&self, adjustment: &Adjustment, champion: &ChampionConfig) -> Result<()> {
        let mut t = self.tables()?;
        let Some(slot) = t.adjustments.iter_mut().find(|a| a.id == adjustment.id) else {
            bail!(CanaryError::NotFound(format!("adjustment {}", adjustment.id)));
        };
        if !slot.is_active() {
            bail!(CanaryError::InvalidState(format!("adjustment {} is {}", adjustment.id, slot.status)));
        }
        *slot = adjustment.clone();
        t.champion = Some(champion.clone());
        Ok(())
    }

    async fn set_underperforming_since(&self, id: Uuid, since: Option<DateTime<Utc>>) -> Result<bool> {
        let mut t = self.tables()?;
        let Some(slot) = t.adjustments.iter_mut().find(|a| a.id == id) else {
            bail!(CanaryError::NotFound(format!("adjustment {id}")));
        };
        if !slot.is_active() {
            return Ok(false);
        }
        slot.underperforming_since = since;
        Ok(true)
    }

    async fn adjustment(&self, id: Uuid) -> Result<Option<Adjustment>> {
        Ok(self.tables()?.adjustments.iter().find(|a| a.id == id).cloned())
    }

    async fn active_adjustments(&self) -> Result<Vec<Adjustment>> {
        Ok(self.tables()?.adjustments.iter().filter(|a| a.is_active()).cloned().collect())
    }

    async fn adjustments_since(&self, since: DateTime<Utc>) -> Result<Vec<Adjustment>> {
        let t = self.tables()?;
        let mut adjs: Vec<Adjustment> = t.adjustments.iter().filter(|a| a.applied_at >= since).cloned().collect();
        adjs.sort_by_key(|a| a.applied_at);
        Ok(adjs)
    }

    async fn latest_adjustment(&self, strategy: &str, parameter: &str) -> Result<Option<Adjustment>> {
        let t = self.tables()?;
        Ok(t.adjustments
            .iter()
            .filter(|a| a.strategy == strategy && a.parameter == parameter)
            .max_by_key(|a| a.applied_at)
            .cloned())
    }

    async fn recent_adjustments(&self, limit: usize) -> Result<Vec<Adjustment>> {
        let t = self.tables()?;
        let mut adjs = t.adjustments.clone();
        adjs.sort_by(|a, b| b.applied_at.cmp(&a.applied_at));
        adjs.truncate(limit);
        Ok(adjs)
    }

    async fn load_champion(&self) -> Result<Option<ChampionConfig>> {
        Ok(self.tables()?.champion.clone())
    }

    async fn save_champion(&self, champion: &ChampionConfig) -> Result<()> {
        self.tables()?.champion = Some(champion.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
