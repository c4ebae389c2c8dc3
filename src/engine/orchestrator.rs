//! Cadence orchestrator.
//!
//! Owns the four pipeline stages and drives them on independent timers:
//! the logger inline with production scans, the evaluator (plus rollback
//! monitoring) every few minutes, the analyzer every few hours and the
//! threshold manager's apply pass once a day. Also the single entry point
//! for the administrative overrides.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::DailySummary;
use crate::params::ChampionConfig;
use crate::shadow::{AnalysisReport, EvaluationReport, ScanContext, ShadowAnalyzer, ShadowEvaluator, ShadowLogger};
use crate::storage::{ControlState, ShadowStore};
use crate::thresholds::{MonitorReport, ProcessReport, ThresholdManager};
use crate::types::{Adjustment, PerformanceSnapshot, RecommendationRecord};

/// Timer periods for the background passes.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Evaluator pass, followed by a rollback-monitoring pass.
    pub evaluator_every: Duration,
    pub analyzer_every: Duration,
    /// Expiry, automatic application and the daily summary.
    pub manager_every: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            evaluator_every: Duration::from_secs(5 * 60),
            analyzer_every: Duration::from_secs(6 * 3600),
            manager_every: Duration::from_secs(24 * 3600),
        }
    }
}

/// Outcome of one daily manager pass.
#[derive(Debug, Clone)]
pub struct DailyReport {
    pub expired: usize,
    pub processed: ProcessReport,
    pub summary: DailySummary,
}

pub struct Orchestrator {
    store: Arc<dyn ShadowStore>,
    logger: ShadowLogger,
    evaluator: ShadowEvaluator,
    analyzer: ShadowAnalyzer,
    manager: ThresholdManager,
    schedule: Schedule,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ShadowStore>,
        logger: ShadowLogger,
        evaluator: ShadowEvaluator,
        analyzer: ShadowAnalyzer,
        manager: ThresholdManager,
        schedule: Schedule,
    ) -> Self {
        Self {
            store,
            logger,
            evaluator,
            analyzer,
            manager,
            schedule,
        }
    }

    // -- Scan hook ----------------------------------------------------------

    /// Called by the production scanner for every decision point. Never
    /// fails; returns how many shadow decisions were recorded.
    pub async fn on_scan(&self, scan: &ScanContext) -> usize {
        self.logger.log_scan(scan).await
    }

    // -- Passes -------------------------------------------------------------

    pub async fn evaluation_pass(&self, now: DateTime<Utc>, cancel: &watch::Receiver<bool>) -> Result<EvaluationReport> {
        self.evaluator.evaluate_pending(now, cancel).await
    }

    pub async fn monitor_pass(&self, now: DateTime<Utc>) -> Result<MonitorReport> {
        let report = self.manager.monitor(now).await?;
        if !report.rolled_back.is_empty() {
            warn!(
                checked = report.checked,
                rolled_back = report.rolled_back.len(),
                "Monitoring pass rolled back adjustments"
            );
        }
        Ok(report)
    }

    pub async fn analysis_pass(&self, now: DateTime<Utc>) -> Result<AnalysisReport> {
        self.analyzer.generate_recommendations(now).await
    }

    /// Expire stale recommendations, apply what passes the gates and
    /// publish the summary.
    pub async fn daily_pass(&self, now: DateTime<Utc>) -> Result<DailyReport> {
        let expired = self.manager.expire(now).await?;
        let pending = self.store.pending_recommendations().await?;
        let processed = self.manager.process_recommendations(&pending, now).await;
        let summary = self.manager.daily_summary(now).await?;
        Ok(DailyReport {
            expired,
            processed,
            summary,
        })
    }

    /// Run the cadence loop until `shutdown` flips to `true`. A pass in
    /// flight finishes its current unit of work before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let cancel = shutdown.clone();

        let mut evaluator_tick = tokio::time::interval(self.schedule.evaluator_every);
        let mut analyzer_tick = tokio::time::interval(self.schedule.analyzer_every);
        let mut manager_tick = tokio::time::interval(self.schedule.manager_every);
        for tick in [&mut evaluator_tick, &mut analyzer_tick, &mut manager_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        info!(
            evaluator_secs = self.schedule.evaluator_every.as_secs(),
            analyzer_secs = self.schedule.analyzer_every.as_secs(),
            manager_secs = self.schedule.manager_every.as_secs(),
            "Entering cadence loop"
        );

        loop {
            tokio::select! {
                _ = evaluator_tick.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.evaluation_pass(now, &cancel).await {
                        error!(error = %e, "Evaluator pass failed; continuing");
                    }
                    if *cancel.borrow() {
                        continue;
                    }
                    if let Err(e) = self.monitor_pass(now).await {
                        error!(error = %e, "Monitoring pass failed; continuing");
                    }
                }
                _ = analyzer_tick.tick() => {
                    match self.analysis_pass(Utc::now()).await {
                        Ok(report) => info!(
                            snapshots = report.snapshots,
                            recommendations = report.recommendations.len(),
                            "Analyzer pass complete"
                        ),
                        Err(e) => error!(error = %e, "Analyzer pass failed; continuing"),
                    }
                }
                _ = manager_tick.tick() => {
                    match self.daily_pass(Utc::now()).await {
                        Ok(report) => info!(
                            expired = report.expired,
                            applied = report.processed.applied.len(),
                            rejected = report.processed.rejected.len(),
                            "Daily manager pass complete"
                        ),
                        Err(e) => error!(error = %e, "Daily manager pass failed; continuing"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested; leaving cadence loop");
                        break;
                    }
                }
            }
        }
    }

    // -- Admin --------------------------------------------------------------

    pub async fn force_apply(&self, recommendation_id: Uuid, now: DateTime<Utc>) -> Result<Adjustment> {
        self.manager.force_apply(recommendation_id, now).await
    }

    pub async fn rollback(&self, adjustment_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<Adjustment> {
        self.manager.rollback(adjustment_id, reason, now).await
    }

    pub async fn emergency_stop(&self, reason: &str, now: DateTime<Utc>) {
        self.manager.emergency_stop(reason, now).await
    }

    pub async fn resume(&self, now: DateTime<Utc>) {
        self.manager.resume(now).await
    }

    // -- Reads --------------------------------------------------------------

    pub async fn champion(&self) -> Arc<ChampionConfig> {
        self.manager.champion().snapshot().await
    }

    pub async fn control(&self) -> ControlState {
        self.manager.control().await
    }

    pub async fn recent_recommendations(&self, limit: usize) -> Result<Vec<RecommendationRecord>> {
        self.store.recent_recommendations(limit).await
    }

    pub async fn recent_adjustments(&self, limit: usize) -> Result<Vec<Adjustment>> {
        self.store.recent_adjustments(limit).await
    }

    pub async fn snapshots(&self) -> Result<Vec<PerformanceSnapshot>> {
        self.store.snapshots().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
