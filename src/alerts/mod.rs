//! Operator notifications.
//!
//! Publishing is fire-and-forget: a notifier never returns an error to the
//! caller, and a failing channel can never affect trading logic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::Adjustment;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Request timeout for outbound alert calls.
const ALERT_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub applied: usize,
    pub rejected: usize,
    pub expired: usize,
    pub rolled_back_24h: usize,
    pub active_adjustments: usize,
    pub champion_version: u64,
    pub auto_apply_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    AdjustmentApplied {
        adjustment: Adjustment,
    },
    RecommendationRejected {
        recommendation_id: Uuid,
        summary: String,
        reason: String,
    },
    RecommendationExpired {
        recommendation_id: Uuid,
        summary: String,
    },
    RollbackTriggered {
        adjustment_id: Uuid,
        strategy: String,
        parameter: String,
        restored_value: f64,
        reason: String,
        automatic: bool,
    },
    EmergencyStop {
        reason: String,
    },
    Resumed,
    DailySummary(DailySummary),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::AdjustmentApplied { adjustment: a } => write!(
                f,
                "Applied {} adjustment {}.{}: {} -> {} (id {})",
                a.mode, a.strategy, a.parameter, a.old_value, a.new_value, a.id
            ),
            Notification::RecommendationRejected { summary, reason, .. } => {
                write!(f, "Rejected recommendation {summary}: {reason}")
            }
            Notification::RecommendationExpired { summary, .. } => {
                write!(f, "Recommendation expired unapplied: {summary}")
            }
            Notification::RollbackTriggered {
                adjustment_id,
                strategy,
                parameter,
                restored_value,
                reason,
                automatic,
            } => write!(
                f,
                "{} rollback of {adjustment_id}: {strategy}.{parameter} restored to {restored_value} ({reason})",
                if *automatic { "Automatic" } else { "Manual" }
            ),
            Notification::EmergencyStop { reason } => {
                write!(f, "EMERGENCY STOP: automatic adjustments halted ({reason})")
            }
            Notification::Resumed => write!(f, "Automatic adjustments resumed"),
            Notification::DailySummary(s) => write!(
                f,
                "Daily summary: applied={} rejected={} expired={} rollbacks(24h)={} active={} champion=v{} auto={}",
                s.applied,
                s.rejected,
                s.expired,
                s.rolled_back_24h,
                s.active_adjustments,
                s.champion_version,
                if s.auto_apply_enabled { "on" } else { "off" }
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, event: &Notification);
}

/// Writes every event to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, event: &Notification) {
        info!(event = %event, "Notification");
    }
}

/// Keeps the most recent events in memory for the read API.
pub struct RecentEvents {
    capacity: usize,
    events: Mutex<VecDeque<(DateTime<Utc>, Notification)>>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Newest first.
    pub fn snapshot(&self) -> Vec<(DateTime<Utc>, Notification)> {
        match self.events.lock() {
            Ok(events) => events.iter().rev().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().rev().cloned().collect(),
        }
    }
}

#[async_trait]
impl Notifier for RecentEvents {
    async fn publish(&self, event: &Notification) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back((Utc::now(), event.clone()));
    }
}

/// Sends events to a Telegram chat.
pub struct TelegramNotifier {
    http: Client,
    bot_token: SecretString,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, chat_id: String) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(ALERT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, bot_token, chat_id })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn publish(&self, event: &Notification) {
        let url = format!("{TELEGRAM_API_URL}/bot{}/sendMessage", self.bot_token.expose_secret());
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": format!("[CANARY] {event}"),
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => debug!("Telegram alert sent"),
            Ok(resp) => warn!(status = %resp.status(), "Telegram alert rejected"),
            Err(e) => warn!(error = %e, "Telegram alert failed"),
        }
    }
}

/// Publishes to every inner notifier.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl Notifier for Fanout {
    async fn publish(&self, event: &Notification) {
        for sink in &self.sinks {
            sink.publish(event).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recent_events_bounded_newest_first() {
        let recent = RecentEvents::new(2);
        recent.publish(&Notification::Resumed).await;
        recent
            .publish(&Notification::EmergencyStop { reason: "a".into() })
            .await;
        recent
            .publish(&Notification::EmergencyStop { reason: "b".into() })
            .await;

        let events = recent.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1, Notification::EmergencyStop { reason: "b".into() });
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_sinks() {
        let a = Arc::new(RecentEvents::new(10));
        let b = Arc::new(RecentEvents::new(10));
        let fanout = Fanout::new().with(a.clone()).with(b.clone()).with(Arc::new(LogNotifier));
        fanout.publish(&Notification::Resumed).await;
        assert_eq!(a.snapshot().len(), 1);
        assert_eq!(b.snapshot().len(), 1);
    }

    #[test]
    fn test_rollback_text_is_human_readable() {
        let event = Notification::RollbackTriggered {
            adjustment_id: Uuid::nil(),
            strategy: "swing".into(),
            parameter: "stop_loss_pct".into(),
            restored_value: 3.0,
            reason: "3 consecutive live losses".into(),
            automatic: true,
        };
        let text = event.to_string();
        assert!(text.starts_with("Automatic rollback"));
        assert!(text.contains("swing.stop_loss_pct restored to 3"));
        assert!(text.contains("3 consecutive live losses"));
    }

    #[test]
    fn test_notification_serializes_with_kind_tag() {
        let json = serde_json::to_value(Notification::EmergencyStop { reason: "drawdown".into() }).unwrap();
        assert_eq!(json["kind"], "emergency_stop");
        assert_eq!(json["reason"], "drawdown");
    }
}
