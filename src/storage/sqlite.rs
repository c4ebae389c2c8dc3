//! SQLite-backed store.
//!
//! Timestamps are stored as epoch milliseconds; feature and parameter maps
//! as JSON text. The same database also carries the tables the ingestion
//! pipeline writes (`price_bars`, `live_trades`, `regime_state`), so this
//! type doubles as the price provider, trade ledger and regime signal.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::ShadowStore;
use crate::feeds::{PriceProvider, RegimeSignal, TradeLedger};
use crate::params::{ChampionConfig, ParameterSet};
use crate::types::{
    Adjustment, CanaryError, Candle, LiveTrade, PerformanceSnapshot, Recommendation,
    RecommendationRecord, RecommendationStatus, RegimeStatus, ResolvedShadow, ShadowDecision,
    ShadowOutcome,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS shadow_decisions (
        id TEXT PRIMARY KEY,
        scan_id TEXT NOT NULL,
        variation TEXT NOT NULL,
        strategy TEXT NOT NULL,
        symbol TEXT NOT NULL,
        ts_ms INTEGER NOT NULL,
        would_take INTEGER NOT NULL,
        side TEXT NOT NULL,
        entry_price REAL NOT NULL,
        stop_loss REAL,
        take_profit REAL,
        size_mult REAL NOT NULL,
        grid_json TEXT,
        params_json TEXT NOT NULL,
        features_json TEXT NOT NULL,
        ml_confidence REAL,
        UNIQUE (scan_id, variation, strategy, symbol)
    )",
    "CREATE INDEX IF NOT EXISTS idx_decisions_pending ON shadow_decisions (would_take, ts_ms)",
    "CREATE TABLE IF NOT EXISTS shadow_outcomes (
        decision_id TEXT PRIMARY KEY REFERENCES shadow_decisions (id),
        pnl_pct REAL NOT NULL,
        exit_reason TEXT NOT NULL,
        exit_price REAL NOT NULL,
        avg_entry_price REAL NOT NULL,
        filled_fraction REAL NOT NULL,
        holding_minutes INTEGER NOT NULL,
        evaluated_at_ms INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS performance_snapshots (
        variation TEXT NOT NULL,
        strategy TEXT NOT NULL,
        window_hours INTEGER NOT NULL,
        trade_count INTEGER NOT NULL,
        win_rate REAL NOT NULL,
        avg_pnl_pct REAL NOT NULL,
        median_pnl_pct REAL NOT NULL,
        avg_weighted_return REAL NOT NULL,
        delta_vs_champion REAL,
        p_value REAL,
        computed_at_ms INTEGER NOT NULL,
        PRIMARY KEY (variation, strategy, window_hours)
    )",
    "CREATE TABLE IF NOT EXISTS recommendations (
        id TEXT PRIMARY KEY,
        strategy TEXT NOT NULL,
        parameter TEXT NOT NULL,
        current_value REAL NOT NULL,
        recommended_value REAL NOT NULL,
        variation TEXT NOT NULL,
        stats_json TEXT NOT NULL,
        generated_at_ms INTEGER NOT NULL,
        status TEXT NOT NULL,
        reason TEXT,
        consumed_at_ms INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS adjustments (
        id TEXT PRIMARY KEY,
        recommendation_id TEXT NOT NULL,
        strategy TEXT NOT NULL,
        parameter TEXT NOT NULL,
        old_value REAL NOT NULL,
        new_value REAL NOT NULL,
        applied_at_ms INTEGER NOT NULL,
        mode TEXT NOT NULL,
        checks_json TEXT NOT NULL,
        baseline_json TEXT,
        status TEXT NOT NULL,
        underperforming_since_ms INTEGER,
        closed_at_ms INTEGER,
        close_reason TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_adjustments_param ON adjustments (strategy, parameter, applied_at_ms)",
    "CREATE TABLE IF NOT EXISTS champion_params (
        strategy TEXT NOT NULL,
        parameter TEXT NOT NULL,
        value REAL NOT NULL,
        PRIMARY KEY (strategy, parameter)
    )",
    "CREATE TABLE IF NOT EXISTS champion_meta (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL,
        last_adjustment TEXT
    )",
    "CREATE TABLE IF NOT EXISTS price_bars (
        symbol TEXT NOT NULL,
        open_time_ms INTEGER NOT NULL,
        close_time_ms INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        PRIMARY KEY (symbol, open_time_ms)
    )",
    "CREATE TABLE IF NOT EXISTS live_trades (
        id TEXT PRIMARY KEY,
        strategy TEXT NOT NULL,
        symbol TEXT NOT NULL,
        closed_at_ms INTEGER NOT NULL,
        pnl_pct REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS regime_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        stable INTEGER NOT NULL,
        since_ms INTEGER NOT NULL,
        label TEXT
    )",
];

const DECISION_COLUMNS: &str = "id, scan_id, variation, strategy, symbol, ts_ms, would_take, side, entry_price, \
     stop_loss, take_profit, size_mult, grid_json, params_json, features_json, ml_confidence";

const ADJUSTMENT_COLUMNS: &str = "id, recommendation_id, strategy, parameter, old_value, new_value, applied_at_ms, \
     mode, checks_json, baseline_json, status, underperforming_since_ms, closed_at_ms, close_reason";

const RECOMMENDATION_COLUMNS: &str = "id, strategy, parameter, current_value, recommended_value, variation, \
     stats_json, generated_at_ms, status, reason, consumed_at_ms";

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_ms(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value).ok_or_else(|| anyhow!("timestamp out of range: {value}"))
}

fn opt_from_ms(value: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    value.map(from_ms).transpose()
}

fn uuid_col(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let s: String = row.try_get(col)?;
    Uuid::parse_str(&s).with_context(|| format!("bad uuid in column {col}: {s}"))
}

fn parse_col<T>(row: &SqliteRow, col: &str) -> Result<T>
where
    T: FromStr<Err = CanaryError>,
{
    let s: String = row.try_get(col)?;
    Ok(s.parse::<T>()?)
}

fn decision_from_row(row: &SqliteRow) -> Result<ShadowDecision> {
    let grid_json: Option<String> = row.try_get("grid_json")?;
    let params_json: String = row.try_get("params_json")?;
    let features_json: String = row.try_get("features_json")?;
    Ok(ShadowDecision {
        id: uuid_col(row, "id")?,
        scan_id: uuid_col(row, "scan_id")?,
        variation: parse_col(row, "variation")?,
        strategy: row.try_get("strategy")?,
        symbol: row.try_get("symbol")?,
        timestamp: from_ms(row.try_get("ts_ms")?)?,
        would_take_trade: row.try_get("would_take")?,
        side: parse_col(row, "side")?,
        entry_price: row.try_get("entry_price")?,
        stop_loss: row.try_get("stop_loss")?,
        take_profit: row.try_get("take_profit")?,
        position_size_mult: row.try_get("size_mult")?,
        grid: grid_json.map(|g| serde_json::from_str(&g)).transpose()?,
        params: serde_json::from_str(&params_json)?,
        features: serde_json::from_str(&features_json)?,
        ml_confidence: row.try_get("ml_confidence")?,
    })
}

fn outcome_from_row(row: &SqliteRow) -> Result<ShadowOutcome> {
    Ok(ShadowOutcome {
        decision_id: uuid_col(row, "decision_id")?,
        pnl_pct: row.try_get("pnl_pct")?,
        exit_reason: parse_col(row, "exit_reason")?,
        exit_price: row.try_get("exit_price")?,
        avg_entry_price: row.try_get("avg_entry_price")?,
        filled_fraction: row.try_get("filled_fraction")?,
        holding_minutes: row.try_get("holding_minutes")?,
        evaluated_at: from_ms(row.try_get("evaluated_at_ms")?)?,
    })
}

fn recommendation_from_row(row: &SqliteRow) -> Result<RecommendationRecord> {
    let stats_json: String = row.try_get("stats_json")?;
    Ok(RecommendationRecord {
        recommendation: Recommendation {
            id: uuid_col(row, "id")?,
            strategy: row.try_get("strategy")?,
            parameter: row.try_get("parameter")?,
            current_value: row.try_get("current_value")?,
            recommended_value: row.try_get("recommended_value")?,
            variation: parse_col(row, "variation")?,
            stats: serde_json::from_str(&stats_json)?,
            generated_at: from_ms(row.try_get("generated_at_ms")?)?,
        },
        status: parse_col(row, "status")?,
        reason: row.try_get("reason")?,
        consumed_at: opt_from_ms(row.try_get("consumed_at_ms")?)?,
    })
}

fn adjustment_from_row(row: &SqliteRow) -> Result<Adjustment> {
    let checks_json: String = row.try_get("checks_json")?;
    let baseline_json: Option<String> = row.try_get("baseline_json")?;
    Ok(Adjustment {
        id: uuid_col(row, "id")?,
        recommendation_id: uuid_col(row, "recommendation_id")?,
        strategy: row.try_get("strategy")?,
        parameter: row.try_get("parameter")?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        applied_at: from_ms(row.try_get("applied_at_ms")?)?,
        mode: parse_col(row, "mode")?,
        checks_passed: serde_json::from_str(&checks_json)?,
        baseline: baseline_json.map(|b| serde_json::from_str(&b)).transpose()?,
        status: parse_col(row, "status")?,
        underperforming_since: opt_from_ms(row.try_get("underperforming_since_ms")?)?,
        closed_at: opt_from_ms(row.try_get("closed_at_ms")?)?,
        close_reason: row.try_get("close_reason")?,
    })
}

fn snapshot_from_row(row: &SqliteRow) -> Result<PerformanceSnapshot> {
    let trade_count: i64 = row.try_get("trade_count")?;
    let window_hours: i64 = row.try_get("window_hours")?;
    Ok(PerformanceSnapshot {
        variation: parse_col(row, "variation")?,
        strategy: row.try_get("strategy")?,
        window_hours: u32::try_from(window_hours)?,
        trade_count: usize::try_from(trade_count)?,
        win_rate: row.try_get("win_rate")?,
        avg_pnl_pct: row.try_get("avg_pnl_pct")?,
        median_pnl_pct: row.try_get("median_pnl_pct")?,
        avg_weighted_return: row.try_get("avg_weighted_return")?,
        delta_vs_champion: row.try_get("delta_vs_champion")?,
        p_value: row.try_get("p_value")?,
        computed_at: from_ms(row.try_get("computed_at_ms")?)?,
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and ensure the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid SQLite URL: {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open SQLite database: {url}"))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("Failed to create schema")?;
        }
        Ok(())
    }

    // -- Ingestion-side writers ---------------------------------------------

    pub async fn insert_candles(&self, symbol: &str, candles: &[Candle]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for c in candles {
            sqlx::query(
                "INSERT OR REPLACE INTO price_bars (symbol, open_time_ms, close_time_ms, open, high, low, close)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(symbol)
            .bind(ms(c.open_time))
            .bind(ms(c.close_time))
            .bind(c.open)
            .bind(c.high)
            .bind(c.low)
            .bind(c.close)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_live_trade(&self, trade: &LiveTrade) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO live_trades (id, strategy, symbol, closed_at_ms, pnl_pct) VALUES (?, ?, ?, ?, ?)")
            .bind(&trade.id)
            .bind(&trade.strategy)
            .bind(&trade.symbol)
            .bind(ms(trade.closed_at))
            .bind(trade.pnl_pct)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_regime(&self, status: &RegimeStatus) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO regime_state (id, stable, since_ms, label) VALUES (1, ?, ?, ?)")
            .bind(status.stable)
            .bind(ms(status.since))
            .bind(&status.label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_champion(
        conn: &mut sqlx::SqliteConnection,
        champion: &ChampionConfig,
    ) -> Result<()> {
        sqlx::query("DELETE FROM champion_params").execute(&mut *conn).await?;
        for (strategy, params) in &champion.strategies {
            for (name, value) in params.iter() {
                sqlx::query("INSERT INTO champion_params (strategy, parameter, value) VALUES (?, ?, ?)")
                    .bind(strategy)
                    .bind(name)
                    .bind(*value)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        sqlx::query(
            "INSERT OR REPLACE INTO champion_meta (id, version, updated_at_ms, last_adjustment) VALUES (1, ?, ?, ?)",
        )
        .bind(i64::try_from(champion.version)?)
        .bind(ms(champion.updated_at))
        .bind(champion.last_adjustment.map(|id| id.to_string()))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn write_adjustment_status(conn: &mut sqlx::SqliteConnection, adj: &Adjustment) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE adjustments SET status = ?, underperforming_since_ms = ?, closed_at_ms = ?, close_reason = ?
             WHERE id = ?",
        )
        .bind(adj.status.to_string())
        .bind(adj.underperforming_since.map(ms))
        .bind(adj.closed_at.map(ms))
        .bind(&adj.close_reason)
        .bind(adj.id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ShadowStore for SqliteStore {
    async fn insert_decisions(&self, decisions: &[ShadowDecision]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for d in decisions {
            sqlx::query(&format!(
                "INSERT INTO shadow_decisions ({DECISION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(d.id.to_string())
            .bind(d.scan_id.to_string())
            .bind(d.variation.to_string())
            .bind(&d.strategy)
            .bind(&d.symbol)
            .bind(ms(d.timestamp))
            .bind(d.would_take_trade)
            .bind(d.side.to_string())
            .bind(d.entry_price)
            .bind(d.stop_loss)
            .bind(d.take_profit)
            .bind(d.position_size_mult)
            .bind(d.grid.as_ref().map(serde_json::to_string).transpose()?)
            .bind(serde_json::to_string(&d.params)?)
            .bind(serde_json::to_string(&d.features)?)
            .bind(d.ml_confidence)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn decisions_for_scan(&self, scan_id: Uuid) -> Result<Vec<ShadowDecision>> {
        let rows = sqlx::query(&format!("SELECT {DECISION_COLUMNS} FROM shadow_decisions WHERE scan_id = ?"))
            .bind(scan_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decision_from_row).collect()
    }

    async fn pending_decisions(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<ShadowDecision>> {
        let rows = sqlx::query(&format!(
            "SELECT {DECISION_COLUMNS} FROM shadow_decisions d
             WHERE d.would_take = 1 AND d.ts_ms <= ?
               AND NOT EXISTS (SELECT 1 FROM shadow_outcomes o WHERE o.decision_id = d.id)
             ORDER BY d.ts_ms ASC LIMIT ?"
        ))
        .bind(ms(cutoff))
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decision_from_row).collect()
    }

    async fn insert_outcome(&self, outcome: &ShadowOutcome) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO shadow_outcomes
             (decision_id, pnl_pct, exit_reason, exit_price, avg_entry_price, filled_fraction, holding_minutes, evaluated_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(outcome.decision_id.to_string())
        .bind(outcome.pnl_pct)
        .bind(outcome.exit_reason.to_string())
        .bind(outcome.exit_price)
        .bind(outcome.avg_entry_price)
        .bind(outcome.filled_fraction)
        .bind(outcome.holding_minutes)
        .bind(ms(outcome.evaluated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn outcome(&self, decision_id: Uuid) -> Result<Option<ShadowOutcome>> {
        let row = sqlx::query("SELECT * FROM shadow_outcomes WHERE decision_id = ?")
            .bind(decision_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(outcome_from_row).transpose()
    }

    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<ResolvedShadow>> {
        let rows = sqlx::query(
            "SELECT d.variation, d.strategy, d.symbol, d.ts_ms, d.size_mult, d.params_json, o.*
             FROM shadow_outcomes o JOIN shadow_decisions d ON d.id = o.decision_id
             WHERE d.ts_ms >= ?
             ORDER BY d.ts_ms ASC",
        )
        .bind(ms(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let params_json: String = row.try_get("params_json")?;
                Ok(ResolvedShadow {
                    variation: parse_col(row, "variation")?,
                    strategy: row.try_get("strategy")?,
                    symbol: row.try_get("symbol")?,
                    decided_at: from_ms(row.try_get("ts_ms")?)?,
                    position_size_mult: row.try_get("size_mult")?,
                    params: serde_json::from_str(&params_json)?,
                    outcome: outcome_from_row(row)?,
                })
            })
            .collect()
    }

    async fn replace_snapshots(&self, snapshots: &[PerformanceSnapshot]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM performance_snapshots").execute(&mut *tx).await?;
        for s in snapshots {
            sqlx::query(
                "INSERT INTO performance_snapshots
                 (variation, strategy, window_hours, trade_count, win_rate, avg_pnl_pct, median_pnl_pct,
                  avg_weighted_return, delta_vs_champion, p_value, computed_at_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(s.variation.to_string())
            .bind(&s.strategy)
            .bind(i64::from(s.window_hours))
            .bind(i64::try_from(s.trade_count)?)
            .bind(s.win_rate)
            .bind(s.avg_pnl_pct)
            .bind(s.median_pnl_pct)
            .bind(s.avg_weighted_return)
            .bind(s.delta_vs_champion)
            .bind(s.p_value)
            .bind(ms(s.computed_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn snapshots(&self) -> Result<Vec<PerformanceSnapshot>> {
        let rows = sqlx::query("SELECT * FROM performance_snapshots ORDER BY strategy, window_hours, variation")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn insert_recommendations(&self, recs: &[Recommendation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in recs {
            sqlx::query(&format!(
                "INSERT INTO recommendations ({RECOMMENDATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)"
            ))
            .bind(r.id.to_string())
            .bind(&r.strategy)
            .bind(&r.parameter)
            .bind(r.current_value)
            .bind(r.recommended_value)
            .bind(r.variation.to_string())
            .bind(serde_json::to_string(&r.stats)?)
            .bind(ms(r.generated_at))
            .bind(RecommendationStatus::Pending.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn recommendation(&self, id: Uuid) -> Result<Option<RecommendationRecord>> {
        let row = sqlx::query(&format!("SELECT {RECOMMENDATION_COLUMNS} FROM recommendations WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(recommendation_from_row).transpose()
    }

    async fn pending_recommendations(&self) -> Result<Vec<Recommendation>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations WHERE status = ? ORDER BY generated_at_ms ASC"
        ))
        .bind(RecommendationStatus::Pending.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| recommendation_from_row(row).map(|r| r.recommendation))
            .collect()
    }

    async fn recent_recommendations(&self, limit: usize) -> Result<Vec<RecommendationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM recommendations ORDER BY generated_at_ms DESC LIMIT ?"
        ))
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(recommendation_from_row).collect()
    }

    async fn consume_recommendation(
        &self,
        id: Uuid,
        status: RecommendationStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE recommendations SET status = ?, reason = ?, consumed_at_ms = ? WHERE id = ? AND status = ?",
        )
        .bind(status.to_string())
        .bind(reason)
        .bind(ms(at))
        .bind(id.to_string())
        .bind(RecommendationStatus::Pending.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.recommendation(id).await?.is_none() {
            bail!(CanaryError::NotFound(format!("recommendation {id}")));
        }
        Ok(result.rows_affected() == 1)
    }

    async fn commit_adjustment(
        &self,
        adjustment: &Adjustment,
        superseded: Option<Uuid>,
        champion: &ChampionConfig,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let consumed = sqlx::query(
            "UPDATE recommendations SET status = ?, consumed_at_ms = ? WHERE id = ? AND status = ?",
        )
        .bind(RecommendationStatus::Applied.to_string())
        .bind(ms(adjustment.applied_at))
        .bind(adjustment.recommendation_id.to_string())
        .bind(RecommendationStatus::Pending.to_string())
        .execute(&mut *tx)
        .await?;
        if consumed.rows_affected() != 1 {
            // Dropping the transaction rolls it back.
            bail!(CanaryError::InvalidState(format!(
                "recommendation {} is not pending",
                adjustment.recommendation_id
            )));
        }

        if let Some(prev) = superseded {
            let result = sqlx::query(
                "UPDATE adjustments SET status = 'SUPERSEDED', closed_at_ms = ?, close_reason = ?
                 WHERE id = ? AND status = 'ACTIVE'",
            )
            .bind(ms(adjustment.applied_at))
            .bind(format!("superseded by {}", adjustment.id))
            .bind(prev.to_string())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() != 1 {
                bail!(CanaryError::InvalidState(format!("adjustment {prev} is not active")));
            }
        }

        sqlx::query(&format!(
            "INSERT INTO adjustments ({ADJUSTMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(adjustment.id.to_string())
        .bind(adjustment.recommendation_id.to_string())
        .bind(&adjustment.strategy)
        .bind(&adjustment.parameter)
        .bind(adjustment.old_value)
        .bind(adjustment.new_value)
        .bind(ms(adjustment.applied_at))
        .bind(adjustment.mode.to_string())
        .bind(serde_json::to_string(&adjustment.checks_passed)?)
        .bind(adjustment.baseline.as_ref().map(serde_json::to_string).transpose()?)
        .bind(adjustment.status.to_string())
        .bind(adjustment.underperforming_since.map(ms))
        .bind(adjustment.closed_at.map(ms))
        .bind(&adjustment.close_reason)
        .execute(&mut *tx)
        .await?;

        Self::write_champion(&mut tx, champion).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_rollback(&self, adjustment: &Adjustment, champion: &ChampionConfig) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let active: Option<String> = sqlx::query_scalar("SELECT status FROM adjustments WHERE id = ?")
            .bind(adjustment.id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        match active.as_deref() {
            Some("ACTIVE") => {}
            Some(other) => bail!(CanaryError::InvalidState(format!("adjustment {} is {other}", adjustment.id))),
            None => bail!(CanaryError::NotFound(format!("adjustment {}", adjustment.id))),
        }

        Self::write_adjustment_status(&mut tx, adjustment).await?;
        Self::write_champion(&mut tx, champion).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_underperforming_since(&self, id: Uuid, since: Option<DateTime<Utc>>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE adjustments SET underperforming_since_ms = ? WHERE id = ? AND status = 'ACTIVE'",
        )
        .bind(since.map(ms))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: Option<String> = sqlx::query_scalar("SELECT status FROM adjustments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            bail!(CanaryError::NotFound(format!("adjustment {id}")));
        }
        Ok(false)
    }

    async fn adjustment(&self, id: Uuid) -> Result<Option<Adjustment>> {
        let row = sqlx::query(&format!("SELECT {ADJUSTMENT_COLUMNS} FROM adjustments WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(adjustment_from_row).transpose()
    }

    async fn active_adjustments(&self) -> Result<Vec<Adjustment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ADJUSTMENT_COLUMNS} FROM adjustments WHERE status = 'ACTIVE' ORDER BY applied_at_ms ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(adjustment_from_row).collect()
    }

    async fn adjustments_since(&self, since: DateTime<Utc>) -> Result<Vec<Adjustment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ADJUSTMENT_COLUMNS} FROM adjustments WHERE applied_at_ms >= ? ORDER BY applied_at_ms ASC"
        ))
        .bind(ms(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(adjustment_from_row).collect()
    }

    async fn latest_adjustment(&self, strategy: &str, parameter: &str) -> Result<Option<Adjustment>> {
        let row = sqlx::query(&format!(
            "SELECT {ADJUSTMENT_COLUMNS} FROM adjustments WHERE strategy = ? AND parameter = ?
             ORDER BY applied_at_ms DESC LIMIT 1"
        ))
        .bind(strategy)
        .bind(parameter)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(adjustment_from_row).transpose()
    }

    async fn recent_adjustments(&self, limit: usize) -> Result<Vec<Adjustment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ADJUSTMENT_COLUMNS} FROM adjustments ORDER BY applied_at_ms DESC LIMIT ?"
        ))
        .bind(i64::try_from(limit)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(adjustment_from_row).collect()
    }

    async fn load_champion(&self) -> Result<Option<ChampionConfig>> {
        let Some(meta) = sqlx::query("SELECT version, updated_at_ms, last_adjustment FROM champion_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let rows = sqlx::query("SELECT strategy, parameter, value FROM champion_params")
            .fetch_all(&self.pool)
            .await?;
        let mut strategies: BTreeMap<String, ParameterSet> = BTreeMap::new();
        for row in &rows {
            let strategy: String = row.try_get("strategy")?;
            let parameter: String = row.try_get("parameter")?;
            let value: f64 = row.try_get("value")?;
            strategies.entry(strategy).or_default().set(parameter, value);
        }

        let version: i64 = meta.try_get("version")?;
        let last_adjustment: Option<String> = meta.try_get("last_adjustment")?;
        Ok(Some(ChampionConfig {
            version: u64::try_from(version)?,
            updated_at: from_ms(meta.try_get("updated_at_ms")?)?,
            last_adjustment: last_adjustment.map(|s| Uuid::parse_str(&s)).transpose()?,
            strategies,
        }))
    }

    async fn save_champion(&self, champion: &ChampionConfig) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_champion(&mut tx, champion).await?;
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collaborator feeds
// ---------------------------------------------------------------------------

#[async_trait]
impl PriceProvider for SqliteStore {
    async fn candles(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT open_time_ms, close_time_ms, open, high, low, close FROM price_bars
             WHERE symbol = ? AND open_time_ms >= ? AND open_time_ms < ?
             ORDER BY open_time_ms ASC",
        )
        .bind(symbol)
        .bind(ms(start))
        .bind(ms(end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Candle {
                    open_time: from_ms(row.try_get("open_time_ms")?)?,
                    close_time: from_ms(row.try_get("close_time_ms")?)?,
                    open: row.try_get("open")?,
                    high: row.try_get("high")?,
                    low: row.try_get("low")?,
                    close: row.try_get("close")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl TradeLedger for SqliteStore {
    async fn trades_since(&self, strategy: &str, since: DateTime<Utc>) -> Result<Vec<LiveTrade>> {
        let rows = sqlx::query(
            "SELECT id, strategy, symbol, closed_at_ms, pnl_pct FROM live_trades
             WHERE strategy = ? AND closed_at_ms >= ? ORDER BY closed_at_ms ASC",
        )
        .bind(strategy)
        .bind(ms(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LiveTrade {
                    id: row.try_get("id")?,
                    strategy: row.try_get("strategy")?,
                    symbol: row.try_get("symbol")?,
                    closed_at: from_ms(row.try_get("closed_at_ms")?)?,
                    pnl_pct: row.try_get("pnl_pct")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RegimeSignal for SqliteStore {
    async fn current(&self) -> Result<RegimeStatus> {
        let row = sqlx::query("SELECT stable, since_ms, label FROM regime_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("no regime reading recorded"))?;
        Ok(RegimeStatus {
            stable: row.try_get("stable")?,
            since: from_ms(row.try_get("since_ms")?)?,
            label: row.try_get("label")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
