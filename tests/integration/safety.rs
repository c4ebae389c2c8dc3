//! Safety gates and operator controls exercised through the orchestrator.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use canary::shadow::VariationId;
use canary::storage::{self, MemoryStore, ShadowStore};
use canary::thresholds::{ManagerConfig, RejectionReason};
use canary::types::{
    AdjustmentStatus, ApplyMode, Recommendation, RecommendationStatus, RegimeStatus, SupportingStats,
};

use crate::harness::{at_hours, base, Harness};

fn rec(strategy: &str, parameter: &str, current: f64, recommended: f64, at: DateTime<Utc>) -> Recommendation {
    Recommendation {
        id: Uuid::new_v4(),
        strategy: strategy.into(),
        parameter: parameter.into(),
        current_value: current,
        recommended_value: recommended,
        variation: VariationId::Challenger3,
        stats: SupportingStats {
            window_hours: 168,
            challenger_samples: 45,
            champion_samples: 45,
            challenger_win_rate: 55.0,
            champion_win_rate: 48.0,
            challenger_mean: 0.4,
            champion_mean: 0.1,
            delta: 0.3,
            p_value: 0.03,
        },
        generated_at: at,
    }
}

async fn harness_with_trades() -> Harness {
    let h = Harness::new(Arc::new(MemoryStore::new())).await;
    h.feeds.add_steady_trades("swing", base(), 12);
    h.feeds.add_steady_trades("channel", base(), 12);
    h
}

#[tokio::test]
async fn test_oversized_change_is_rejected_and_champion_untouched() {
    let h = harness_with_trades().await;
    let now = at_hours(20);
    // 3.0 -> 2.0 is a 33% change against a 20% cap.
    let big = rec("swing", "stop_loss_pct", 3.0, 2.0, at_hours(19));
    h.store.insert_recommendations(std::slice::from_ref(&big)).await.unwrap();

    let daily = h.orch.daily_pass(now).await.unwrap();
    assert!(daily.processed.applied.is_empty());
    assert!(matches!(
        daily.processed.rejected.as_slice(),
        [(id, RejectionReason::MagnitudeExceeded { .. })] if *id == big.id
    ));

    let record = h.store.recommendation(big.id).await.unwrap().unwrap();
    assert_eq!(record.status, RecommendationStatus::Rejected);
    assert!(record.reason.is_some());
    assert!(h.store.recent_adjustments(10).await.unwrap().is_empty());
    assert_eq!(h.orch.champion().await.version, 1);
    assert_eq!(h.orch.champion().await.value("swing", "stop_loss_pct"), Some(3.0));
}

#[tokio::test]
async fn test_daily_cap_holds_across_passes() {
    let h = harness_with_trades().await;
    let t = at_hours(20);

    let first_batch = vec![
        rec("swing", "stop_loss_pct", 3.0, 2.7, t - Duration::hours(4)),
        rec("swing", "take_profit_pct", 6.0, 6.6, t - Duration::hours(3)),
        rec("channel", "stop_loss_pct", 2.0, 2.2, t - Duration::hours(2)),
        rec("channel", "take_profit_pct", 3.5, 3.8, t - Duration::hours(1)),
    ];
    h.store.insert_recommendations(&first_batch).await.unwrap();
    let daily = h.orch.daily_pass(t).await.unwrap();
    assert_eq!(daily.processed.applied.len(), 3);
    assert_eq!(daily.processed.rejected.len(), 1);
    // Oldest first: the newest recommendation is the one over the cap.
    assert_eq!(daily.processed.rejected[0].0, first_batch[3].id);
    assert!(matches!(
        daily.processed.rejected[0].1,
        RejectionReason::DailyCapReached { count: 3, cap: 3 }
    ));

    // Six hours later the cap is still spent.
    let later = t + Duration::hours(6);
    let second = rec("channel", "min_confidence", 0.65, 0.67, later - Duration::hours(1));
    h.store.insert_recommendations(std::slice::from_ref(&second)).await.unwrap();
    let daily = h.orch.daily_pass(later).await.unwrap();
    assert!(daily.processed.applied.is_empty());
    assert!(matches!(
        daily.processed.rejected.as_slice(),
        [(_, RejectionReason::DailyCapReached { .. })]
    ));

    // Once the first applications age out of the window, one more goes in.
    let next_day = t + Duration::hours(25);
    let third = rec("channel", "position_size_mult", 1.0, 1.2, next_day - Duration::hours(1));
    h.store.insert_recommendations(std::slice::from_ref(&third)).await.unwrap();
    let daily = h.orch.daily_pass(next_day).await.unwrap();
    assert_eq!(daily.processed.applied.len(), 1);

    let all = h.store.adjustments_since(base()).await.unwrap();
    assert_eq!(all.len(), 4);
    for adj in &all {
        let in_window = all
            .iter()
            .filter(|a| a.mode == ApplyMode::Automatic)
            .filter(|a| a.applied_at <= adj.applied_at && adj.applied_at - a.applied_at < Duration::hours(24))
            .count();
        assert!(in_window <= 3);
    }
}

#[tokio::test]
async fn test_unstable_regime_and_thin_trade_history_reject() {
    let h = Harness::new(Arc::new(MemoryStore::new())).await;
    let now = at_hours(20);

    // Only five live trades: not enough history.
    h.feeds.add_steady_trades("swing", base(), 5);
    let thin = rec("swing", "stop_loss_pct", 3.0, 2.7, now - Duration::hours(1));
    h.store.insert_recommendations(std::slice::from_ref(&thin)).await.unwrap();
    let daily = h.orch.daily_pass(now).await.unwrap();
    assert!(matches!(
        daily.processed.rejected.as_slice(),
        [(_, RejectionReason::InsufficientRealTrades { have: 5, need: 10 })]
    ));

    // Plenty of trades but the regime only just settled.
    h.feeds.add_steady_trades("swing", at_hours(6), 10);
    h.feeds.set_regime(RegimeStatus {
        stable: true,
        since: now - Duration::hours(4),
        label: Some("trend".into()),
    });
    let fresh = rec("swing", "stop_loss_pct", 3.0, 2.7, now - Duration::minutes(30));
    h.store.insert_recommendations(std::slice::from_ref(&fresh)).await.unwrap();
    let daily = h.orch.daily_pass(now).await.unwrap();
    assert!(matches!(
        daily.processed.rejected.as_slice(),
        [(_, RejectionReason::RegimeUnstable { .. })]
    ));
    assert_eq!(h.orch.champion().await.version, 1);
}

#[tokio::test]
async fn test_stale_recommendations_expire_on_daily_pass() {
    let h = harness_with_trades().await;
    let old = rec("swing", "stop_loss_pct", 3.0, 2.7, at_hours(0));
    h.store.insert_recommendations(std::slice::from_ref(&old)).await.unwrap();

    let daily = h.orch.daily_pass(at_hours(30)).await.unwrap();
    assert_eq!(daily.expired, 1);
    assert!(daily.processed.applied.is_empty());
    assert_eq!(daily.summary.expired, 1);
    assert_eq!(
        h.store.recommendation(old.id).await.unwrap().unwrap().status,
        RecommendationStatus::Expired
    );
}

#[tokio::test]
async fn test_second_adjustment_supersedes_first() {
    let h = harness_with_trades().await;
    let t = at_hours(20);

    let first = rec("swing", "stop_loss_pct", 3.0, 2.7, t - Duration::hours(1));
    let adj1 = {
        h.store.insert_recommendations(std::slice::from_ref(&first)).await.unwrap();
        h.orch.force_apply(first.id, t).await.unwrap()
    };
    assert_eq!(adj1.mode, ApplyMode::Forced);

    let second = rec("swing", "stop_loss_pct", 2.7, 2.5, t + Duration::hours(1));
    h.store.insert_recommendations(std::slice::from_ref(&second)).await.unwrap();
    let adj2 = h.orch.force_apply(second.id, t + Duration::hours(2)).await.unwrap();
    assert!((adj2.old_value - 2.7).abs() < 1e-9);

    let first_now = h.store.adjustment(adj1.id).await.unwrap().unwrap();
    assert_eq!(first_now.status, AdjustmentStatus::Superseded);
    let active = h.store.active_adjustments().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, adj2.id);

    // The superseded adjustment can no longer be rolled back.
    assert!(h.orch.rollback(adj1.id, "too late", t + Duration::hours(3)).await.is_err());

    let back = h.orch.rollback(adj2.id, "operator", t + Duration::hours(3)).await.unwrap();
    assert_eq!(back.status, AdjustmentStatus::RolledBack);
    assert!((h.orch.champion().await.value("swing", "stop_loss_pct").unwrap() - 2.7).abs() < 1e-9);
}

#[tokio::test]
async fn test_emergency_stop_defers_then_resume_applies() {
    let h = harness_with_trades().await;
    let t = at_hours(20);
    let pending = rec("swing", "take_profit_pct", 6.0, 6.6, t - Duration::hours(2));
    h.store.insert_recommendations(std::slice::from_ref(&pending)).await.unwrap();

    h.orch.emergency_stop("bad fills", t).await;
    let daily = h.orch.daily_pass(t).await.unwrap();
    assert_eq!(daily.processed.deferred, 1);
    assert!(!daily.summary.auto_apply_enabled);
    assert_eq!(
        h.store.recommendation(pending.id).await.unwrap().unwrap().status,
        RecommendationStatus::Pending
    );

    h.orch.resume(t + Duration::hours(1)).await;
    let daily = h.orch.daily_pass(t + Duration::hours(1)).await.unwrap();
    assert_eq!(daily.processed.applied.len(), 1);
    assert!(daily.summary.auto_apply_enabled);
}

#[tokio::test]
async fn test_emergency_stop_survives_restart() {
    let dir = std::env::temp_dir().join(format!("canary-control-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("control.json").to_string_lossy().to_string();

    let config = ManagerConfig {
        control_file: Some(path.clone()),
        ..ManagerConfig::default()
    };
    let h = Harness::with_config(Arc::new(MemoryStore::new()), config).await;
    h.orch.emergency_stop("exchange incident", at_hours(1)).await;

    let restored = storage::load_control_state(Some(&path)).unwrap().unwrap();
    assert!(!restored.auto_apply_enabled);
    assert_eq!(restored.stop_reason.as_deref(), Some("exchange incident"));

    h.orch.resume(at_hours(2)).await;
    let restored = storage::load_control_state(Some(&path)).unwrap().unwrap();
    assert!(restored.auto_apply_enabled);

    storage::delete_control_state(Some(&path)).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_store_outage_surfaces_from_daily_pass() {
    let store = Arc::new(MemoryStore::new());
    let h = Harness::new(store.clone()).await;
    store.set_offline(true);
    assert!(h.orch.daily_pass(at_hours(1)).await.is_err());

    store.set_offline(false);
    let daily = h.orch.daily_pass(at_hours(1)).await.unwrap();
    assert!(daily.processed.applied.is_empty());
}

#[tokio::test]
async fn test_win_rate_drop_rolls_back_to_exact_prior_value() {
    let h = harness_with_trades().await;
    let t = at_hours(20);
    let pending = rec("swing", "take_profit_pct", 6.0, 6.6, t - Duration::hours(1));
    h.store.insert_recommendations(std::slice::from_ref(&pending)).await.unwrap();
    let daily = h.orch.daily_pass(t).await.unwrap();
    let adj = daily.processed.applied[0].clone();
    assert!((adj.baseline.as_ref().unwrap().win_rate - 50.0).abs() < 1e-9);

    // Two wins in six, never three losses in a row: 33% against a 50% baseline.
    for (i, pnl) in [0.8, -0.5, -0.5, 0.8, -0.5, -0.5].into_iter().enumerate() {
        h.feeds.add_trade("swing", t + Duration::hours(i as i64 + 1), pnl);
    }
    let report = h.orch.monitor_pass(t + Duration::hours(8)).await.unwrap();
    assert!(matches!(
        report.rolled_back.as_slice(),
        [(id, canary::thresholds::RollbackTrigger::WinRateDrop { .. })] if *id == adj.id
    ));

    assert_eq!(h.orch.champion().await.value("swing", "take_profit_pct"), Some(6.0));
    assert_eq!(
        h.store.adjustment(adj.id).await.unwrap().unwrap().status,
        AdjustmentStatus::RolledBack
    );
}
