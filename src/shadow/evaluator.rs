//! Shadow outcome evaluator.
//!
//! Picks up taken shadow decisions that are old enough to have resolved and
//! have no outcome yet, fetches the bars that followed each one, replays the
//! position and writes the outcome. Decisions are independent: each runs in
//! its own future, failures are counted and left for the next pass, and the
//! write-once outcome table makes overlapping passes harmless.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::simulator::{replay, Replay, ReplayConfig};
use crate::feeds::PriceProvider;
use crate::storage::{with_retry, ShadowStore};
use crate::types::{ShadowDecision, ShadowOutcome};

/// Evaluator settings.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Decisions younger than this are not looked at.
    pub min_resolution_delay: Duration,
    pub max_hold: Duration,
    pub stale_grace: Duration,
    pub fee_pct: f64,
    /// Most decisions examined per pass.
    pub batch_limit: usize,
    /// Decisions evaluated concurrently.
    pub concurrency: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            min_resolution_delay: Duration::minutes(30),
            max_hold: Duration::hours(48),
            stale_grace: Duration::hours(6),
            fee_pct: 0.1,
            batch_limit: 500,
            concurrency: 8,
        }
    }
}

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub examined: usize,
    pub resolved: usize,
    /// Not enough forward data yet.
    pub pending: usize,
    /// Outcome already existed (concurrent pass got there first).
    pub duplicates: usize,
    pub failed: usize,
    /// Skipped because shutdown was requested mid-pass.
    pub cancelled: usize,
}

enum Verdict {
    Resolved,
    Pending,
    Duplicate,
    Failed,
    Cancelled,
}

pub struct ShadowEvaluator {
    store: Arc<dyn ShadowStore>,
    prices: Arc<dyn PriceProvider>,
    config: EvaluatorConfig,
}

impl ShadowEvaluator {
    pub fn new(store: Arc<dyn ShadowStore>, prices: Arc<dyn PriceProvider>, config: EvaluatorConfig) -> Self {
        Self { store, prices, config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// One evaluation pass as of `now`. Only a failure to list pending work
    /// is returned as an error. Setting `shutdown` to `true` stops the pass
    /// at the next decision boundary.
    pub async fn evaluate_pending(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<EvaluationReport> {
        let cutoff = now - self.config.min_resolution_delay;
        let pending = self.store.pending_decisions(cutoff, self.config.batch_limit).await?;

        let mut report = EvaluationReport {
            examined: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let verdicts: Vec<Verdict> = stream::iter(pending)
            .map(|decision| self.evaluate_one(decision, now, shutdown))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for v in verdicts {
            match v {
                Verdict::Resolved => report.resolved += 1,
                Verdict::Pending => report.pending += 1,
                Verdict::Duplicate => report.duplicates += 1,
                Verdict::Failed => report.failed += 1,
                Verdict::Cancelled => report.cancelled += 1,
            }
        }

        info!(
            examined = report.examined,
            resolved = report.resolved,
            pending = report.pending,
            failed = report.failed,
            cancelled = report.cancelled,
            "Evaluator pass complete"
        );
        Ok(report)
    }

    async fn evaluate_one(
        &self,
        decision: ShadowDecision,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Verdict {
        if *shutdown.borrow() {
            return Verdict::Cancelled;
        }

        let end = decision.timestamp + self.config.max_hold;
        let candles = match self.prices.candles(&decision.symbol, decision.timestamp, end).await {
            Ok(c) => c,
            // Past the grace period a failing symbol resolves flat rather
            // than holding its place at the head of the queue.
            Err(e) if now >= end + self.config.stale_grace => {
                warn!(
                    decision_id = %decision.id,
                    symbol = %decision.symbol,
                    error = %e,
                    "Price fetch still failing past grace; resolving without data"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(decision_id = %decision.id, symbol = %decision.symbol, error = %e, "Price fetch failed");
                return Verdict::Failed;
            }
        };

        let replay_config = ReplayConfig {
            max_hold: self.config.max_hold,
            stale_grace: self.config.stale_grace,
            fee_pct: self.config.fee_pct,
        };
        let exit = match replay(&decision, &candles, now, &replay_config) {
            Replay::Resolved(exit) => exit,
            Replay::Pending => return Verdict::Pending,
        };

        let outcome = ShadowOutcome {
            decision_id: decision.id,
            pnl_pct: exit.pnl_pct,
            exit_reason: exit.exit_reason,
            exit_price: exit.exit_price,
            avg_entry_price: exit.avg_entry_price,
            filled_fraction: exit.filled_fraction,
            holding_minutes: (exit.exit_time - decision.timestamp).num_minutes().max(0),
            evaluated_at: now,
        };

        let store = &self.store;
        let row = &outcome;
        match with_retry("insert_outcome", move || async move { store.insert_outcome(row).await }).await {
            Ok(true) => {
                debug!(
                    decision_id = %decision.id,
                    variation = %decision.variation,
                    reason = %outcome.exit_reason,
                    pnl_pct = outcome.pnl_pct,
                    "Shadow outcome recorded"
                );
                Verdict::Resolved
            }
            Ok(false) => Verdict::Duplicate,
            Err(e) => {
                warn!(decision_id = %decision.id, error = %e, "Failed to record shadow outcome");
                Verdict::Failed
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
    use crate::feeds::MockPriceProvider;
    use crate::params::ParameterSet;
    use crate::shadow::registry::VariationId;
    use crate::storage::MemoryStore;
    use crate::types::{Candle, ExitReason, TradeSide};
    use anyhow::anyhow;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn config() -> EvaluatorConfig {
        EvaluatorConfig {
            min_resolution_delay: Duration::minutes(30),
            max_hold: Duration::hours(4),
            stale_grace: Duration::hours(2),
            fee_pct: 0.0,
            batch_limit: 100,
            concurrency: 4,
        }
    }

    fn decision(symbol: &str, take: bool) -> ShadowDecision {
        ShadowDecision {
            id: Uuid::new_v4(),
            scan_id: Uuid::new_v4(),
            variation: VariationId::Champion,
            strategy: "swing".into(),
            symbol: symbol.into(),
            timestamp: t0(),
            would_take_trade: take,
            side: TradeSide::Long,
            entry_price: 100.0,
            stop_loss: Some(98.0),
            take_profit: Some(103.0),
            position_size_mult: 1.0,
            grid: None,
            params: ParameterSet::new(),
            features: Default::default(),
            ml_confidence: None,
        }
    }

    fn winning_bars() -> Vec<Candle> {
        vec![Candle {
            open_time: t0(),
            close_time: t0() + Duration::hours(1),
            open: 100.0,
            high: 103.5,
            low: 99.5,
            close: 103.2,
        }]
    }

    #[tokio::test]
    async fn test_resolves_once_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let d = decision("BTCUSDT", true);
        store.insert_decisions(&[d.clone()]).await.unwrap();

        let mut prices = MockPriceProvider::new();
        prices.expect_candles().returning(|_, _, _| Ok(winning_bars()));
        let evaluator = ShadowEvaluator::new(store.clone(), Arc::new(prices), config());
        let (_tx, rx) = watch::channel(false);

        let now = t0() + Duration::hours(2);
        let first = evaluator.evaluate_pending(now, &rx).await.unwrap();
        assert_eq!(first.resolved, 1);
        let second = evaluator.evaluate_pending(now, &rx).await.unwrap();
        assert_eq!(second.examined, 0);

        let outcome = store.outcome(d.id).await.unwrap().unwrap();
        assert_eq!(outcome.exit_reason, ExitReason::TakeProfit);
        assert_eq!(outcome.holding_minutes, 60);
    }

    #[tokio::test]
    async fn test_skipped_decisions_never_get_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let d = decision("BTCUSDT", false);
        store.insert_decisions(&[d.clone()]).await.unwrap();

        let mut prices = MockPriceProvider::new();
        prices.expect_candles().never();
        let evaluator = ShadowEvaluator::new(store.clone(), Arc::new(prices), config());
        let (_tx, rx) = watch::channel(false);

        let report = evaluator.evaluate_pending(t0() + Duration::days(3), &rx).await.unwrap();
        assert_eq!(report.examined, 0);
        assert!(store.outcome(d.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_too_recent_decisions_wait() {
        let store = Arc::new(MemoryStore::new());
        store.insert_decisions(&[decision("BTCUSDT", true)]).await.unwrap();
        let evaluator = ShadowEvaluator::new(store, Arc::new(MockPriceProvider::new()), config());
        let (_tx, rx) = watch::channel(false);

        let report = evaluator.evaluate_pending(t0() + Duration::minutes(10), &rx).await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        let good = decision("BTCUSDT", true);
        let bad = decision("ETHUSDT", true);
        store.insert_decisions(&[good.clone(), bad.clone()]).await.unwrap();

        let mut prices = MockPriceProvider::new();
        prices.expect_candles().returning(|symbol, _, _| {
            if symbol == "ETHUSDT" {
                Err(anyhow!("feed timeout"))
            } else {
                Ok(winning_bars())
            }
        });
        let evaluator = ShadowEvaluator::new(store.clone(), Arc::new(prices), config());
        let (_tx, rx) = watch::channel(false);

        let report = evaluator.evaluate_pending(t0() + Duration::hours(2), &rx).await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.failed, 1);
        assert!(store.outcome(good.id).await.unwrap().is_some());
        assert!(store.outcome(bad.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insufficient_data_stays_pending() {
        let store = Arc::new(MemoryStore::new());
        store.insert_decisions(&[decision("BTCUSDT", true)]).await.unwrap();
        let mut prices = MockPriceProvider::new();
        prices.expect_candles().returning(|_, _, _| Ok(Vec::new()));
        let evaluator = ShadowEvaluator::new(store, Arc::new(prices), config());
        let (_tx, rx) = watch::channel(false);

        let report = evaluator.evaluate_pending(t0() + Duration::hours(1), &rx).await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(report.resolved, 0);
    }

    #[tokio::test]
    async fn test_dead_symbols_do_not_starve_the_queue() {
        let store = Arc::new(MemoryStore::new());
        let mut halted = decision("HALTED", true);
        halted.timestamp = t0() - Duration::hours(2);
        let mut delisted = decision("DELISTED", true);
        delisted.timestamp = t0() - Duration::hours(1);
        let live = decision("BTCUSDT", true);
        store
            .insert_decisions(&[halted.clone(), delisted.clone(), live.clone()])
            .await
            .unwrap();

        let mut prices = MockPriceProvider::new();
        prices.expect_candles().returning(|symbol, _, _| match symbol {
            "HALTED" => Err(anyhow!("unknown symbol")),
            "DELISTED" => Ok(Vec::new()),
            _ => Ok(winning_bars()),
        });
        let evaluator = ShadowEvaluator::new(
            store.clone(),
            Arc::new(prices),
            EvaluatorConfig {
                batch_limit: 1,
                ..config()
            },
        );
        let (_tx, rx) = watch::channel(false);

        for day in 1..=3 {
            let report = evaluator.evaluate_pending(t0() + Duration::days(day), &rx).await.unwrap();
            assert_eq!(report.resolved, 1);
        }

        for dead in [&halted, &delisted] {
            let outcome = store.outcome(dead.id).await.unwrap().unwrap();
            assert_eq!(outcome.exit_reason, ExitReason::StillOpen);
            assert_eq!(outcome.pnl_pct, 0.0);
            assert_eq!(outcome.filled_fraction, 0.0);
        }
        let outcome = store.outcome(live.id).await.unwrap().unwrap();
        assert_eq!(outcome.exit_reason, ExitReason::TakeProfit);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_remaining_work() {
        let store = Arc::new(MemoryStore::new());
        store.insert_decisions(&[decision("BTCUSDT", true)]).await.unwrap();
        let evaluator = ShadowEvaluator::new(store, Arc::new(MockPriceProvider::new()), config());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let report = evaluator.evaluate_pending(t0() + Duration::hours(2), &rx).await.unwrap();
        assert_eq!(report.cancelled, 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_hard_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let evaluator = ShadowEvaluator::new(store, Arc::new(MockPriceProvider::new()), config());
        let (_tx, rx) = watch::channel(false);
        assert!(evaluator.evaluate_pending(Utc::now(), &rx).await.is_err());
    }
}
