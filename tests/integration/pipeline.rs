//! End-to-end runs of the shadow pipeline: scan → evaluate → analyze →
//! apply → monitor, on both storage backends.

use std::sync::Arc;

use canary::alerts::Notification;
use canary::shadow::VariationId;
use canary::storage::{MemoryStore, ShadowStore, SqliteStore};
use canary::types::{AdjustmentStatus, ApplyMode, ExitReason, RecommendationStatus, OVERALL};

use crate::harness::{at_hours, base, Harness};

/// Forty hourly swing scans at 100 with bars that dip to 96.5: every
/// variation takes the trade and the champion's 3% stop (97) is hit on the
/// first bar, as is the tighter 2.55% stop (97.45) of the stop variation.
async fn seed_losing_scans(h: &Harness, scans: i64) {
    h.feeds.add_hourly_bars("BTCUSDT", base(), 96, 100.0, 96.5, 100.5);
    for i in 0..scans {
        let (_, written) = h.scan("swing", at_hours(i), 100.0, 0.7).await;
        assert_eq!(written, 8);
    }
}

async fn full_cycle(store: Arc<dyn ShadowStore>) {
    let h = Harness::new(store).await;
    seed_losing_scans(&h, 40).await;
    h.feeds.add_steady_trades("swing", at_hours(10), 12);

    // -- Evaluate --
    let now = at_hours(41);
    let eval = h.orch.evaluation_pass(now, &h.cancel).await.unwrap();
    assert_eq!(eval.examined, 320);
    assert_eq!(eval.resolved, 320);
    assert_eq!(eval.failed, 0);

    let resolved = h.store.resolved_since(base()).await.unwrap();
    assert!(resolved
        .iter()
        .all(|r| r.outcome.exit_reason == ExitReason::StopLoss));
    let champion_loss = resolved
        .iter()
        .find(|r| r.variation == VariationId::Champion)
        .unwrap()
        .outcome
        .pnl_pct;
    let tight_loss = resolved
        .iter()
        .find(|r| r.variation == VariationId::Challenger3)
        .unwrap()
        .outcome
        .pnl_pct;
    assert!(tight_loss > champion_loss);

    // -- Analyze --
    let analysis = h.orch.analysis_pass(now).await.unwrap();
    assert_eq!(analysis.recommendations.len(), 1);
    let rec = &analysis.recommendations[0];
    assert_eq!(rec.strategy, "swing");
    assert_eq!(rec.parameter, "stop_loss_pct");
    assert_eq!(rec.variation, VariationId::Challenger3);
    assert!((rec.current_value - 3.0).abs() < 1e-9);
    assert!((rec.recommended_value - 2.55).abs() < 1e-9);
    assert!(rec.stats.p_value < 0.10);
    assert!(rec.stats.delta > 0.0);
    assert!(rec.stats.challenger_samples >= 30);

    let snapshots = h.orch.snapshots().await.unwrap();
    assert!(snapshots
        .iter()
        .any(|s| s.strategy == OVERALL && s.variation == VariationId::Champion));

    // A second pass while the first recommendation is pending adds nothing.
    let again = h.orch.analysis_pass(now).await.unwrap();
    assert!(again.recommendations.is_empty());
    assert_eq!(again.skipped_pending, 1);

    // -- Apply --
    let daily = h.orch.daily_pass(now).await.unwrap();
    assert_eq!(daily.processed.applied.len(), 1, "{:?}", daily.processed.rejected);
    let adj = daily.processed.applied[0].clone();
    assert_eq!(adj.mode, ApplyMode::Automatic);
    assert!((adj.old_value - 3.0).abs() < 1e-9);
    assert_eq!(adj.baseline.as_ref().unwrap().trades, 12);

    let champion = h.orch.champion().await;
    assert_eq!(champion.version, 2);
    assert_eq!(champion.last_adjustment, Some(adj.id));
    assert!((champion.value("swing", "stop_loss_pct").unwrap() - 2.55).abs() < 1e-9);

    let record = h.store.recommendation(rec.id).await.unwrap().unwrap();
    assert_eq!(record.status, RecommendationStatus::Applied);

    // -- Monitor --
    for i in 1..=3 {
        h.feeds.add_trade("swing", now + chrono::Duration::hours(i), -1.0);
    }
    let monitor = h.orch.monitor_pass(at_hours(45)).await.unwrap();
    assert_eq!(monitor.rolled_back.len(), 1);

    let champion = h.orch.champion().await;
    assert_eq!(champion.version, 3);
    assert_eq!(champion.value("swing", "stop_loss_pct"), Some(3.0));

    let stored = h.store.adjustment(adj.id).await.unwrap().unwrap();
    assert_eq!(stored.status, AdjustmentStatus::RolledBack);
    assert!(stored.close_reason.unwrap().contains("consecutive"));

    let persisted = h.store.load_champion().await.unwrap().unwrap();
    assert_eq!(persisted.version, 3);
    assert_eq!(persisted.value("swing", "stop_loss_pct"), Some(3.0));

    assert!(h
        .events
        .snapshot()
        .iter()
        .any(|(_, n)| matches!(n, Notification::RollbackTriggered { automatic: true, .. })));
}

#[tokio::test]
async fn test_full_cycle_memory_backend() {
    full_cycle(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_full_cycle_sqlite_backend() {
    full_cycle(Arc::new(SqliteStore::in_memory().await.unwrap())).await;
}

#[tokio::test]
async fn test_skipped_decisions_never_get_outcomes() {
    let h = Harness::new(Arc::new(MemoryStore::new())).await;
    h.feeds.add_hourly_bars("BTCUSDT", base(), 48, 100.0, 96.5, 100.5);

    // Below every variation's confidence floor.
    let (scan_id, written) = h.scan("swing", base(), 100.0, 0.5).await;
    assert_eq!(written, 8);

    let eval = h.orch.evaluation_pass(at_hours(10), &h.cancel).await.unwrap();
    assert_eq!(eval.examined, 0);

    for d in h.store.decisions_for_scan(scan_id).await.unwrap() {
        assert!(!d.would_take_trade);
        assert!(h.store.outcome(d.id).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_confidence_variations_split_on_threshold() {
    let h = Harness::new(Arc::new(MemoryStore::new())).await;

    // 0.61 clears the champion (0.60) and the looser variation (0.576) but
    // not the stricter one (0.624).
    let (scan_id, _) = h.scan("swing", base(), 100.0, 0.61).await;
    let decisions = h.store.decisions_for_scan(scan_id).await.unwrap();
    let took = |v: VariationId| decisions.iter().find(|d| d.variation == v).unwrap().would_take_trade;
    assert!(took(VariationId::Champion));
    assert!(took(VariationId::Challenger2));
    assert!(!took(VariationId::Challenger1));
}

#[tokio::test]
async fn test_evaluation_is_idempotent() {
    let h = Harness::new(Arc::new(MemoryStore::new())).await;
    seed_losing_scans(&h, 5).await;

    let first = h.orch.evaluation_pass(at_hours(10), &h.cancel).await.unwrap();
    assert_eq!(first.resolved, 40);

    let second = h.orch.evaluation_pass(at_hours(10), &h.cancel).await.unwrap();
    assert_eq!(second.examined, 0);
    assert_eq!(h.store.resolved_since(base()).await.unwrap().len(), 40);
}

#[tokio::test]
async fn test_decisions_without_forward_data_stay_pending() {
    let h = Harness::new(Arc::new(MemoryStore::new())).await;
    let (_, written) = h.scan("swing", base(), 100.0, 0.7).await;
    assert_eq!(written, 8);

    // No bars at all yet.
    let eval = h.orch.evaluation_pass(at_hours(2), &h.cancel).await.unwrap();
    assert_eq!(eval.examined, 8);
    assert_eq!(eval.pending, 8);
    assert!(h.store.resolved_since(base()).await.unwrap().is_empty());

    // A price outage is a per-decision failure, not a pass failure.
    h.feeds.set_price_error(Some("exchange timeout"));
    let eval = h.orch.evaluation_pass(at_hours(3), &h.cancel).await.unwrap();
    assert_eq!(eval.failed, 8);

    h.feeds.set_price_error(None);
    h.feeds.add_hourly_bars("BTCUSDT", base(), 4, 100.0, 96.5, 100.5);
    let eval = h.orch.evaluation_pass(at_hours(4), &h.cancel).await.unwrap();
    assert_eq!(eval.resolved, 8);
}

#[tokio::test]
async fn test_snapshot_counts_grow_as_outcomes_resolve() {
    let h = Harness::new(Arc::new(MemoryStore::new())).await;
    seed_losing_scans(&h, 40).await;
    let analysis_time = at_hours(41);

    // Only the first twenty scans are old enough at this point.
    h.orch.evaluation_pass(at_hours(20), &h.cancel).await.unwrap();
    let early = h.orch.analysis_pass(analysis_time).await.unwrap();
    assert!(early.recommendations.is_empty(), "twenty samples is below the minimum");
    let count = |snaps: &[canary::types::PerformanceSnapshot]| {
        snaps
            .iter()
            .find(|s| s.variation == VariationId::Challenger3 && s.strategy == "swing" && s.window_hours == 168)
            .map(|s| s.trade_count)
            .unwrap_or(0)
    };
    let before = count(&h.orch.snapshots().await.unwrap());
    assert_eq!(before, 20);

    h.orch.evaluation_pass(analysis_time, &h.cancel).await.unwrap();
    let late = h.orch.analysis_pass(analysis_time).await.unwrap();
    let after = count(&h.orch.snapshots().await.unwrap());
    assert!(after >= before);
    assert_eq!(after, 40);
    assert_eq!(late.recommendations.len(), 1);
}
