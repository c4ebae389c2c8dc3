//! Persistence layer.
//!
//! `ShadowStore` covers the four append-mostly tables (decisions, outcomes,
//! recommendations, adjustments), the derived snapshot table and the
//! mutable champion row set. Two backends: an in-process [`MemoryStore`]
//! and a SQLite-backed [`SqliteStore`].
//!
//! Operator control state (emergency stop) is small and lives in a JSON
//! file next to the database so it survives restarts independently.

pub mod memory;
pub mod sqlite;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::params::ChampionConfig;
use crate::types::{
    Adjustment, PerformanceSnapshot, Recommendation, RecommendationRecord, RecommendationStatus,
    ResolvedShadow, ShadowDecision, ShadowOutcome,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default control-state file path.
const DEFAULT_CONTROL_FILE: &str = "canary_control.json";

/// Maximum retries for transient store failures.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 200;

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ShadowStore: Send + Sync {
    async fn insert_decisions(&self, decisions: &[ShadowDecision]) -> Result<()>;

    async fn decisions_for_scan(&self, scan_id: Uuid) -> Result<Vec<ShadowDecision>>;

    /// Taken decisions at or before `cutoff` with no outcome yet, oldest first.
    async fn pending_decisions(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<ShadowDecision>>;

    /// Write-once. Returns `false` if the decision already has an outcome.
    async fn insert_outcome(&self, outcome: &ShadowOutcome) -> Result<bool>;

    async fn outcome(&self, decision_id: Uuid) -> Result<Option<ShadowOutcome>>;

    /// Outcomes whose decision was made at or after `since`.
    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<ResolvedShadow>>;

    /// Replace the whole snapshot table.
    async fn replace_snapshots(&self, snapshots: &[PerformanceSnapshot]) -> Result<()>;

    async fn snapshots(&self) -> Result<Vec<PerformanceSnapshot>>;

    /// Stored as `PENDING`.
    async fn insert_recommendations(&self, recs: &[Recommendation]) -> Result<()>;

    async fn recommendation(&self, id: Uuid) -> Result<Option<RecommendationRecord>>;

    async fn pending_recommendations(&self) -> Result<Vec<Recommendation>>;

    /// Newest first.
    async fn recent_recommendations(&self, limit: usize) -> Result<Vec<RecommendationRecord>>;

    /// Move a `PENDING` recommendation to a terminal status. Returns `false`
    /// if it was already consumed.
    async fn consume_recommendation(
        &self,
        id: Uuid,
        status: RecommendationStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically: insert `adjustment`, mark its recommendation `APPLIED`,
    /// mark `superseded` (if any) `SUPERSEDED`, and persist `champion`.
    /// Fails without side effects if the recommendation is not pending.
    async fn commit_adjustment(
        &self,
        adjustment: &Adjustment,
        superseded: Option<Uuid>,
        champion: &ChampionConfig,
    ) -> Result<()>;

    /// Atomically persist a rolled-back adjustment and the restored champion.
    async fn commit_rollback(&self, adjustment: &Adjustment, champion: &ChampionConfig) -> Result<()>;

    /// Set the underperformance clock of an ACTIVE adjustment. Returns
    /// false, writing nothing, once the adjustment has been closed.
    async fn set_underperforming_since(&self, id: Uuid, since: Option<DateTime<Utc>>) -> Result<bool>;

    async fn adjustment(&self, id: Uuid) -> Result<Option<Adjustment>>;

    async fn active_adjustments(&self) -> Result<Vec<Adjustment>>;

    /// Adjustments applied at or after `since`, oldest first.
    async fn adjustments_since(&self, since: DateTime<Utc>) -> Result<Vec<Adjustment>>;

    /// Most recently applied adjustment for one parameter.
    async fn latest_adjustment(&self, strategy: &str, parameter: &str) -> Result<Option<Adjustment>>;

    /// Newest first.
    async fn recent_adjustments(&self, limit: usize) -> Result<Vec<Adjustment>>;

    async fn load_champion(&self) -> Result<Option<ChampionConfig>>;

    /// Seed the champion row set. Later changes go through adjustments.
    async fn save_champion(&self, champion: &ChampionConfig) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Run a store operation with retry + exponential backoff.
pub async fn with_retry<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
            debug!(attempt, delay_ms = delay, op, "Retrying store operation");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, op, error = %e, "Store operation failed");
                last_error = Some(e);
            }
        }
    }

    let err = last_error.unwrap_or_else(|| anyhow!("no attempts made"));
    Err(err.context(format!("{op} failed after {MAX_RETRIES} retries")))
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

/// Operator switches that must survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    pub auto_apply_enabled: bool,
    pub stop_reason: Option<String>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            auto_apply_enabled: true,
            stop_reason: None,
            stopped_at: None,
            resumed_at: None,
        }
    }
}

/// Save control state to a JSON file.
pub fn save_control_state(state: &ControlState, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_CONTROL_FILE);
    let json = serde_json::to_string_pretty(state).context("Failed to serialise control state")?;

    std::fs::write(path, &json).context(format!("Failed to write control state to {path}"))?;

    debug!(path, auto_apply = state.auto_apply_enabled, "Control state saved");
    Ok(())
}

/// Load control state from a JSON file.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_control_state(path: Option<&str>) -> Result<Option<ControlState>> {
    let path = path.unwrap_or(DEFAULT_CONTROL_FILE);

    if !Path::new(path).exists() {
        info!(path, "No saved control state found, starting with auto-apply enabled");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).context(format!("Failed to read control state from {path}"))?;

    let state: ControlState =
        serde_json::from_str(&json).context(format!("Failed to parse control state from {path}"))?;

    info!(
        path,
        auto_apply = state.auto_apply_enabled,
        reason = ?state.stop_reason,
        "Control state loaded from disk"
    );

    Ok(Some(state))
}

/// Delete the control-state file (for testing or reset).
pub fn delete_control_state(path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_CONTROL_FILE);
    if Path::new(path).exists() {
        std::fs::remove_file(path).context(format!("Failed to delete control state file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_path() -> String {
        let mut p = std::env::temp_dir();
        p.push(format!("canary_test_control_{}.json", Uuid::new_v4()));
        p.to_string_lossy().to_string()
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path();
        let state = ControlState {
            auto_apply_enabled: false,
            stop_reason: Some("exchange outage".into()),
            stopped_at: Some(Utc::now()),
            resumed_at: None,
        };
        save_control_state(&state, Some(&path)).unwrap();

        let loaded = load_control_state(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded, state);

        delete_control_state(Some(&path)).unwrap();
    }

    #[test]
    fn test_load_nonexistent() {
        let loaded = load_control_state(Some("/tmp/canary_nonexistent_control_12345.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_default_enables_auto_apply() {
        assert!(ControlState::default().auto_apply_enabled);
    }

    #[test]
    fn test_delete_nonexistent_ok() {
        assert!(delete_control_state(Some("/tmp/canary_does_not_exist_xyz.json")).is_ok());
    }

    #[tokio::test]
    async fn test_with_retry_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry("flaky", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("connection reset"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
