//! Deterministic collaborators and a fully wired orchestrator for
//! integration testing.
//!
//! `MockFeeds` stands in for the price provider, regime signal and live
//! trade ledger at once. All state is in-memory and controllable from test
//! code, including forced failures.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

use canary::alerts::RecentEvents;
use canary::engine::{Orchestrator, Schedule};
use canary::feeds::{PriceProvider, RegimeSignal, TradeLedger};
use canary::params::{ChampionConfig, ChampionHandle, ParameterSet};
use canary::shadow::{
    AnalyzerConfig, EvaluatorConfig, ScanContext, ShadowAnalyzer, ShadowEvaluator, ShadowLogger, VariationRegistry,
};
use canary::storage::{ControlState, ShadowStore};
use canary::strategy::rules::ConfidenceGate;
use canary::strategy::DetectorSet;
use canary::thresholds::{ManagerConfig, ThresholdManager};
use canary::types::{Candle, FeatureSnapshot, LiveTrade, RegimeStatus, TradeSide};

/// Fixed origin for every test timeline.
pub fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
}

pub fn at_hours(h: i64) -> DateTime<Utc> {
    base() + Duration::hours(h)
}

// ---------------------------------------------------------------------------
// Mock feeds
// ---------------------------------------------------------------------------

pub struct MockFeeds {
    candles: Mutex<BTreeMap<String, Vec<Candle>>>,
    trades: Mutex<Vec<LiveTrade>>,
    regime: Mutex<RegimeStatus>,
    /// If set, every price request fails with this message.
    price_error: Mutex<Option<String>>,
}

impl MockFeeds {
    /// Regime stable since well before the test timeline.
    pub fn new() -> Self {
        Self {
            candles: Mutex::new(BTreeMap::new()),
            trades: Mutex::new(Vec::new()),
            regime: Mutex::new(RegimeStatus {
                stable: true,
                since: base() - Duration::hours(30),
                label: Some("range".into()),
            }),
            price_error: Mutex::new(None),
        }
    }

    /// Hourly bars from `start`, all with the same shape around `price`.
    pub fn add_hourly_bars(&self, symbol: &str, start: DateTime<Utc>, hours: i64, price: f64, low: f64, high: f64) {
        let mut candles = self.candles.lock().unwrap();
        let bars = candles.entry(symbol.to_string()).or_default();
        for h in 0..hours {
            let open_time = start + Duration::hours(h);
            bars.push(Candle {
                open_time,
                close_time: open_time + Duration::hours(1),
                open: price,
                high,
                low,
                close: (price + low) / 2.0,
            });
        }
        bars.sort_by_key(|c| c.open_time);
    }

    pub fn add_trade(&self, strategy: &str, closed_at: DateTime<Utc>, pnl_pct: f64) {
        let mut trades = self.trades.lock().unwrap();
        let id = format!("live-{}", trades.len());
        trades.push(LiveTrade {
            id,
            strategy: strategy.to_string(),
            symbol: "BTCUSDT".into(),
            closed_at,
            pnl_pct,
        });
    }

    /// `count` trades, hourly from `start`, alternating win / loss.
    pub fn add_steady_trades(&self, strategy: &str, start: DateTime<Utc>, count: i64) {
        for i in 0..count {
            let pnl = if i % 2 == 0 { 1.2 } else { -0.6 };
            self.add_trade(strategy, start + Duration::hours(i), pnl);
        }
    }

    pub fn set_regime(&self, status: RegimeStatus) {
        *self.regime.lock().unwrap() = status;
    }

    pub fn set_price_error(&self, msg: Option<&str>) {
        *self.price_error.lock().unwrap() = msg.map(str::to_string);
    }
}

#[async_trait]
impl PriceProvider for MockFeeds {
    async fn candles(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Candle>> {
        if let Some(msg) = self.price_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        Ok(self
            .candles
            .lock()
            .unwrap()
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|c| c.open_time >= start && c.open_time < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl RegimeSignal for MockFeeds {
    async fn current(&self) -> Result<RegimeStatus> {
        Ok(self.regime.lock().unwrap().clone())
    }
}

#[async_trait]
impl TradeLedger for MockFeeds {
    async fn trades_since(&self, strategy: &str, since: DateTime<Utc>) -> Result<Vec<LiveTrade>> {
        let mut trades: Vec<LiveTrade> = self
            .trades
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.strategy == strategy && t.closed_at >= since)
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.closed_at);
        Ok(trades)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orch: Orchestrator,
    pub store: Arc<dyn ShadowStore>,
    pub feeds: Arc<MockFeeds>,
    pub events: Arc<RecentEvents>,
    pub cancel: watch::Receiver<bool>,
    _cancel_tx: watch::Sender<bool>,
}

/// swing: 0.60 / 3% / 6%. channel adds an explicit size multiplier.
pub fn champion() -> ChampionConfig {
    let swing: ParameterSet = [
        ("min_confidence".to_string(), 0.60),
        ("stop_loss_pct".to_string(), 3.0),
        ("take_profit_pct".to_string(), 6.0),
    ]
    .into_iter()
    .collect();
    let channel: ParameterSet = [
        ("min_confidence".to_string(), 0.65),
        ("stop_loss_pct".to_string(), 2.0),
        ("take_profit_pct".to_string(), 3.5),
        ("position_size_mult".to_string(), 1.0),
    ]
    .into_iter()
    .collect();
    ChampionConfig::new(BTreeMap::from([
        ("swing".to_string(), swing),
        ("channel".to_string(), channel),
    ]))
}

impl Harness {
    pub async fn new(store: Arc<dyn ShadowStore>) -> Self {
        Self::with_config(store, ManagerConfig::default()).await
    }

    pub async fn with_config(store: Arc<dyn ShadowStore>, manager_config: ManagerConfig) -> Self {
        let champion_config = champion();
        store.save_champion(&champion_config).await.unwrap();
        let champion = Arc::new(ChampionHandle::new(champion_config));
        let registry = Arc::new(VariationRegistry::default_catalog());
        let feeds = Arc::new(MockFeeds::new());
        let events = Arc::new(RecentEvents::new(100));

        let detectors = DetectorSet::new()
            .with(Arc::new(ConfidenceGate::new("swing", TradeSide::Long)))
            .with(Arc::new(ConfidenceGate::new("channel", TradeSide::Short)));

        let orch = Orchestrator::new(
            store.clone(),
            ShadowLogger::new(store.clone(), registry.clone(), detectors, champion.clone()),
            ShadowEvaluator::new(store.clone(), feeds.clone(), EvaluatorConfig::default()),
            ShadowAnalyzer::new(store.clone(), registry, champion.clone(), AnalyzerConfig::default()),
            ThresholdManager::new(
                store.clone(),
                champion,
                feeds.clone(),
                feeds.clone(),
                events.clone(),
                manager_config,
                ControlState::default(),
            ),
            Schedule::default(),
        );

        let (tx, rx) = watch::channel(false);
        Self {
            orch,
            store,
            feeds,
            events,
            cancel: rx,
            _cancel_tx: tx,
        }
    }

    /// One production scan on `strategy` at `timestamp`.
    pub async fn scan(&self, strategy: &str, timestamp: DateTime<Utc>, price: f64, confidence: f64) -> (Uuid, usize) {
        let ctx = ScanContext {
            scan_id: Uuid::new_v4(),
            timestamp,
            symbol: "BTCUSDT".into(),
            strategy: strategy.into(),
            features: FeatureSnapshot::new(),
            price,
            ml_confidence: Some(confidence),
            champion_decision: None,
        };
        let written = self.orch.on_scan(&ctx).await;
        (ctx.scan_id, written)
    }
}
