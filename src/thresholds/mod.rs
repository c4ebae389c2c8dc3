//! Threshold manager.
//!
//! The only writer of the champion configuration. Every change goes through
//! an `Adjustment` that is persisted together with the new champion before
//! the in-memory handle is swapped, so production can always be traced back
//! to the adjustment that produced it. Apply and rollback are serialised by
//! a single writer lock.
//!
//! Per parameter the lifecycle is NONE → ACTIVE → {ROLLED_BACK, SUPERSEDED}.

pub mod monitor;
pub mod safety;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{DailySummary, Notification, Notifier};
use crate::feeds::{RegimeSignal, TradeLedger};
use crate::params::ChampionHandle;
use crate::shadow::stats;
use crate::storage::{save_control_state, ControlState, ShadowStore};
use crate::types::{
    Adjustment, AdjustmentStatus, ApplyMode, CanaryError, LiveBaseline, Recommendation,
    RecommendationStatus,
};

pub use monitor::{RollbackPolicy, RollbackTrigger};
pub use safety::{MagnitudeCaps, RejectionReason, SafetyPolicy};

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub safety: SafetyPolicy,
    pub rollback: RollbackPolicy,
    /// Pending recommendations older than this expire unapplied.
    pub recommendation_ttl: Duration,
    /// Live-trade window used for the pre-adjustment baseline.
    pub baseline_lookback: Duration,
    /// Where the emergency-stop state is persisted; `None` keeps it in memory.
    pub control_file: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            safety: SafetyPolicy::default(),
            rollback: RollbackPolicy::default(),
            recommendation_ttl: Duration::hours(24),
            baseline_lookback: Duration::hours(72),
            control_file: None,
        }
    }
}

/// Outcome of a `process_recommendations` call.
#[derive(Debug, Clone, Default)]
pub struct ProcessReport {
    pub applied: Vec<Adjustment>,
    pub rejected: Vec<(Uuid, RejectionReason)>,
    pub expired: usize,
    /// Left pending: emergency stop active, or a collaborator was unavailable.
    pub deferred: usize,
    pub failed: usize,
}

/// Outcome of a monitoring pass.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub checked: usize,
    pub rolled_back: Vec<(Uuid, RollbackTrigger)>,
    pub failed: usize,
}

pub struct ThresholdManager {
    store: Arc<dyn ShadowStore>,
    champion: Arc<ChampionHandle>,
    regime: Arc<dyn RegimeSignal>,
    ledger: Arc<dyn TradeLedger>,
    notifier: Arc<dyn Notifier>,
    config: ManagerConfig,
    control: RwLock<ControlState>,
    writer: Mutex<()>,
}

impl ThresholdManager {
    pub fn new(
        store: Arc<dyn ShadowStore>,
        champion: Arc<ChampionHandle>,
        regime: Arc<dyn RegimeSignal>,
        ledger: Arc<dyn TradeLedger>,
        notifier: Arc<dyn Notifier>,
        config: ManagerConfig,
        control: ControlState,
    ) -> Self {
        Self {
            store,
            champion,
            regime,
            ledger,
            notifier,
            config,
            control: RwLock::new(control),
            writer: Mutex::new(()),
        }
    }

    pub async fn control(&self) -> ControlState {
        self.control.read().await.clone()
    }

    pub fn champion(&self) -> &Arc<ChampionHandle> {
        &self.champion
    }

    // -- Applying ------------------------------------------------------------

    /// Apply each recommendation that passes every safety gate. Expired ones
    /// are marked `EXPIRED`, failing ones `REJECTED` with the reason; a
    /// failure on one recommendation never stops the others.
    pub async fn process_recommendations(&self, recs: &[Recommendation], now: DateTime<Utc>) -> ProcessReport {
        let mut report = ProcessReport::default();
        let mut ordered: Vec<&Recommendation> = recs.iter().collect();
        ordered.sort_by_key(|r| r.generated_at);

        for rec in ordered {
            if now - rec.generated_at > self.config.recommendation_ttl {
                match self.expire_one(rec, now).await {
                    Ok(true) => report.expired += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(recommendation_id = %rec.id, error = %e, "Failed to expire recommendation");
                        report.failed += 1;
                    }
                }
                continue;
            }

            if !self.control.read().await.auto_apply_enabled {
                report.deferred += 1;
                continue;
            }

            match self.gate_and_apply(rec, now).await {
                Ok(Gate::Applied(adj)) => report.applied.push(adj),
                Ok(Gate::Rejected(reason)) => report.rejected.push((rec.id, reason)),
                Ok(Gate::Deferred) => report.deferred += 1,
                Err(e) => {
                    warn!(recommendation_id = %rec.id, error = %e, "Recommendation processing failed");
                    report.failed += 1;
                }
            }
        }

        if report.deferred > 0 && !self.control.read().await.auto_apply_enabled {
            info!(deferred = report.deferred, "Emergency stop active; automatic applies skipped");
        }
        info!(
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            expired = report.expired,
            deferred = report.deferred,
            failed = report.failed,
            "Recommendations processed"
        );
        report
    }

    async fn gate_and_apply(&self, rec: &Recommendation, now: DateTime<Utc>) -> Result<Gate> {
        let _writer = self.writer.lock().await;

        match self.store.recommendation(rec.id).await? {
            Some(record) if record.status == RecommendationStatus::Pending => {}
            Some(_) => return Ok(Gate::Rejected(RejectionReason::NotPending)),
            None => self.store.insert_recommendations(std::slice::from_ref(rec)).await?,
        }

        let regime = match self.regime.current().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Regime signal unavailable; deferring recommendation");
                return Ok(Gate::Deferred);
            }
        };

        let last = self.store.latest_adjustment(&rec.strategy, &rec.parameter).await?;
        let trades_since = last
            .as_ref()
            .map(|a| a.applied_at)
            .unwrap_or(now - self.config.baseline_lookback);
        let real_trades = match self.ledger.trades_since(&rec.strategy, trades_since).await {
            Ok(t) => t.len(),
            Err(e) => {
                warn!(error = %e, "Trade ledger unavailable; deferring recommendation");
                return Ok(Gate::Deferred);
            }
        };

        let automatic_last_24h = self
            .store
            .adjustments_since(now - Duration::hours(24))
            .await?
            .iter()
            .filter(|a| a.mode == ApplyMode::Automatic)
            .count();

        let champion = self.champion.snapshot().await;
        let inputs = safety::GateInputs {
            recommendation: rec,
            current_value: champion.value(&rec.strategy, &rec.parameter),
            automatic_last_24h,
            regime: &regime,
            real_trades_since_last: real_trades,
            now,
        };

        match safety::evaluate(&self.config.safety, &inputs) {
            Ok(checks) => {
                let adj = self.commit(rec, ApplyMode::Automatic, checks, now).await?;
                Ok(Gate::Applied(adj))
            }
            Err(reason) => {
                self.store
                    .consume_recommendation(rec.id, RecommendationStatus::Rejected, Some(reason.to_string()), now)
                    .await?;
                warn!(recommendation = %rec, reason = %reason, "Recommendation rejected");
                self.notifier
                    .publish(&Notification::RecommendationRejected {
                        recommendation_id: rec.id,
                        summary: rec.to_string(),
                        reason: reason.to_string(),
                    })
                    .await;
                Ok(Gate::Rejected(reason))
            }
        }
    }

    /// Apply a pending recommendation bypassing the safety gates.
    pub async fn force_apply(&self, recommendation_id: Uuid, now: DateTime<Utc>) -> Result<Adjustment> {
        let _writer = self.writer.lock().await;

        let record = self
            .store
            .recommendation(recommendation_id)
            .await?
            .ok_or_else(|| CanaryError::NotFound(format!("recommendation {recommendation_id}")))?;
        if record.status != RecommendationStatus::Pending {
            return Err(CanaryError::InvalidState(format!(
                "recommendation {recommendation_id} is {}",
                record.status
            ))
            .into());
        }

        let rec = record.recommendation;
        warn!(mode = "FORCED", recommendation = %rec, "Force-applying recommendation; safety gates bypassed");
        self.commit(&rec, ApplyMode::Forced, vec!["forced".to_string()], now).await
    }

    /// Persist the adjustment and new champion, then publish. Caller holds
    /// the writer lock.
    async fn commit(
        &self,
        rec: &Recommendation,
        mode: ApplyMode,
        checks_passed: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Adjustment> {
        let champion = self.champion.snapshot().await;
        let old_value = champion
            .value(&rec.strategy, &rec.parameter)
            .ok_or_else(|| CanaryError::NotFound(format!("{}.{} in champion", rec.strategy, rec.parameter)))?;

        let previous = self.store.latest_adjustment(&rec.strategy, &rec.parameter).await?;
        if let Some(prev) = &previous {
            if prev.applied_at > now {
                return Err(CanaryError::InvalidState(format!(
                    "adjustment {} on {}.{} is newer than {now}",
                    prev.id, rec.strategy, rec.parameter
                ))
                .into());
            }
        }
        let superseded = previous.filter(|a| a.is_active()).map(|a| a.id);

        let adjustment = Adjustment {
            id: Uuid::new_v4(),
            recommendation_id: rec.id,
            strategy: rec.strategy.clone(),
            parameter: rec.parameter.clone(),
            old_value,
            new_value: rec.recommended_value,
            applied_at: now,
            mode,
            checks_passed,
            baseline: self.baseline(&rec.strategy, now).await,
            status: AdjustmentStatus::Active,
            underperforming_since: None,
            closed_at: None,
            close_reason: None,
        };

        let next = champion.with_value(&rec.strategy, &rec.parameter, rec.recommended_value, adjustment.id, now)?;
        self.store
            .commit_adjustment(&adjustment, superseded, &next)
            .await
            .context("Failed to persist adjustment")?;
        self.champion.install(next).await;

        info!(
            adjustment = %adjustment,
            superseded = ?superseded,
            "Adjustment applied"
        );
        self.notifier
            .publish(&Notification::AdjustmentApplied {
                adjustment: adjustment.clone(),
            })
            .await;
        Ok(adjustment)
    }

    async fn baseline(&self, strategy: &str, now: DateTime<Utc>) -> Option<LiveBaseline> {
        let trades = match self.ledger.trades_since(strategy, now - self.config.baseline_lookback).await {
            Ok(t) => t,
            Err(e) => {
                warn!(strategy, error = %e, "Could not capture live baseline");
                return None;
            }
        };
        if trades.is_empty() {
            return None;
        }
        let pnl: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
        Some(LiveBaseline {
            trades: pnl.len(),
            win_rate: stats::win_rate(&pnl),
            avg_pnl_pct: stats::mean(&pnl),
        })
    }

    // -- Rollback ------------------------------------------------------------

    /// Manually revert one adjustment to its old value.
    pub async fn rollback(&self, adjustment_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Adjustment> {
        let _writer = self.writer.lock().await;
        self.revert(adjustment_id, reason, false, now).await
    }

    /// Caller holds the writer lock.
    async fn revert(&self, adjustment_id: Uuid, reason: &str, automatic: bool, now: DateTime<Utc>) -> Result<Adjustment> {
        let mut adj = self
            .store
            .adjustment(adjustment_id)
            .await?
            .ok_or_else(|| CanaryError::NotFound(format!("adjustment {adjustment_id}")))?;
        if !adj.is_active() {
            return Err(CanaryError::InvalidState(format!("adjustment {adjustment_id} is {}", adj.status)).into());
        }

        let champion = self.champion.snapshot().await;
        let next = champion.with_value(&adj.strategy, &adj.parameter, adj.old_value, adj.id, now)?;

        adj.status = AdjustmentStatus::RolledBack;
        adj.closed_at = Some(now);
        adj.close_reason = Some(reason.to_string());
        self.store
            .commit_rollback(&adj, &next)
            .await
            .context("Failed to persist rollback")?;
        self.champion.install(next).await;

        warn!(
            adjustment_id = %adj.id,
            strategy = %adj.strategy,
            parameter = %adj.parameter,
            restored = adj.old_value,
            automatic,
            reason,
            "Adjustment rolled back"
        );
        self.notifier
            .publish(&Notification::RollbackTriggered {
                adjustment_id: adj.id,
                strategy: adj.strategy.clone(),
                parameter: adj.parameter.clone(),
                restored_value: adj.old_value,
                reason: reason.to_string(),
                automatic,
            })
            .await;
        Ok(adj)
    }

    /// Check every active adjustment against live trades and roll back the
    /// ones that trip a trigger. Only a failure to list active adjustments
    /// is returned as an error.
    pub async fn monitor(&self, now: DateTime<Utc>) -> Result<MonitorReport> {
        let active = self.store.active_adjustments().await?;
        let mut report = MonitorReport {
            checked: active.len(),
            ..Default::default()
        };

        for adj in active {
            let trades = match self.ledger.trades_since(&adj.strategy, adj.applied_at).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(adjustment_id = %adj.id, error = %e, "Trade ledger unavailable; skipping");
                    report.failed += 1;
                    continue;
                }
            };

            let assessment = monitor::assess(&adj, &trades, now, &self.config.rollback);
            match assessment.trigger {
                Some(trigger) => {
                    let _writer = self.writer.lock().await;
                    match self.revert(adj.id, &trigger.to_string(), true, now).await {
                        Ok(_) => report.rolled_back.push((adj.id, trigger)),
                        Err(e) => {
                            error!(adjustment_id = %adj.id, error = %e, "Automatic rollback failed");
                            report.failed += 1;
                        }
                    }
                }
                None if assessment.underperforming_since != adj.underperforming_since => {
                    // The store only moves the clock while the row is still ACTIVE, so a
                    // supersede that landed after the listing above is never undone.
                    let _writer = self.writer.lock().await;
                    match self
                        .store
                        .set_underperforming_since(adj.id, assessment.underperforming_since)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => debug!(adjustment_id = %adj.id, "Adjustment closed while monitoring; clock left as is"),
                        Err(e) => {
                            warn!(adjustment_id = %adj.id, error = %e, "Failed to update underperformance clock");
                            report.failed += 1;
                        }
                    }
                }
                None => {}
            }
        }
        Ok(report)
    }

    // -- Operator controls --------------------------------------------------

    /// Halt all automatic applications. Existing adjustments are untouched.
    pub async fn emergency_stop(&self, reason: &str, now: DateTime<Utc>) {
        {
            let mut control = self.control.write().await;
            control.auto_apply_enabled = false;
            control.stop_reason = Some(reason.to_string());
            control.stopped_at = Some(now);
            self.persist_control(&control);
        }
        error!(reason, "EMERGENCY STOP: automatic adjustments halted");
        self.notifier
            .publish(&Notification::EmergencyStop {
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn resume(&self, now: DateTime<Utc>) {
        {
            let mut control = self.control.write().await;
            control.auto_apply_enabled = true;
            control.stop_reason = None;
            control.resumed_at = Some(now);
            self.persist_control(&control);
        }
        info!("Automatic adjustments resumed");
        self.notifier.publish(&Notification::Resumed).await;
    }

    fn persist_control(&self, control: &ControlState) {
        if let Some(path) = self.config.control_file.as_deref() {
            if let Err(e) = save_control_state(control, Some(path)) {
                error!(error = %e, path, "Failed to persist control state");
            }
        }
    }

    // -- Housekeeping -------------------------------------------------------

    /// Expire pending recommendations past their TTL.
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<usize> {
        let pending = self.store.pending_recommendations().await?;
        let mut expired = 0;
        for rec in pending
            .iter()
            .filter(|r| now - r.generated_at > self.config.recommendation_ttl)
        {
            match self.expire_one(rec, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(recommendation_id = %rec.id, error = %e, "Failed to expire recommendation"),
            }
        }
        Ok(expired)
    }

    async fn expire_one(&self, rec: &Recommendation, now: DateTime<Utc>) -> Result<bool> {
        let consumed = self
            .store
            .consume_recommendation(rec.id, RecommendationStatus::Expired, Some("ttl elapsed".to_string()), now)
            .await?;
        if consumed {
            info!(recommendation = %rec, "Recommendation expired");
            self.notifier
                .publish(&Notification::RecommendationExpired {
                    recommendation_id: rec.id,
                    summary: rec.to_string(),
                })
                .await;
        }
        Ok(consumed)
    }

    /// Build and publish the daily summary.
    pub async fn daily_summary(&self, now: DateTime<Utc>) -> Result<DailySummary> {
        let since = now - Duration::hours(24);
        let recs = self.store.recent_recommendations(1_000).await?;
        let consumed_today = |status: RecommendationStatus| {
            recs.iter()
                .filter(|r| r.status == status && r.consumed_at.is_some_and(|t| t >= since))
                .count()
        };
        let rolled_back_24h = self
            .store
            .recent_adjustments(1_000)
            .await?
            .iter()
            .filter(|a| a.status == AdjustmentStatus::RolledBack && a.closed_at.is_some_and(|t| t >= since))
            .count();

        let summary = DailySummary {
            applied: consumed_today(RecommendationStatus::Applied),
            rejected: consumed_today(RecommendationStatus::Rejected),
            expired: consumed_today(RecommendationStatus::Expired),
            rolled_back_24h,
            active_adjustments: self.store.active_adjustments().await?.len(),
            champion_version: self.champion.snapshot().await.version,
            auto_apply_enabled: self.control.read().await.auto_apply_enabled,
        };
        self.notifier.publish(&Notification::DailySummary(summary.clone())).await;
        Ok(summary)
    }
}

enum Gate {
    Applied(Adjustment),
    Rejected(RejectionReason),
    Deferred,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
