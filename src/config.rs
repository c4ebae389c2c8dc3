//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! policy knob has a default, so a config file only needs the champion
//! parameter sets. Secrets (the Telegram bot token) are referenced by
//! env-var name and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;

use crate::engine::Schedule;
use crate::params::{ChampionConfig, ParameterSet};
use crate::shadow::registry::VariationConfig;
use crate::shadow::stats::{Bootstrap, DEFAULT_RESAMPLES, DEFAULT_SEED};
use crate::shadow::{AnalyzerConfig, EvaluatorConfig};
use crate::thresholds::{MagnitudeCaps, ManagerConfig, RollbackPolicy, SafetyPolicy};
use crate::types::{CanaryError, TradeSide};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub evaluator: EvaluatorSection,
    #[serde(default)]
    pub analyzer: AnalyzerSection,
    #[serde(default)]
    pub thresholds: ThresholdsSection,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    /// Initial production parameters per strategy. Used to seed an empty store.
    pub champion: BTreeMap<String, ParameterSet>,
    /// Entry rule per strategy.
    #[serde(default)]
    pub detectors: BTreeMap<String, DetectorConfig>,
    /// Replacements for entries of the built-in variation catalog.
    #[serde(default)]
    pub variations: BTreeMap<String, VariationConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "CANARY-001".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub evaluator_interval_secs: u64,
    pub analyzer_interval_hours: u64,
    pub manager_interval_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            evaluator_interval_secs: 300,
            analyzer_interval_hours: 6,
            manager_interval_hours: 24,
        }
    }
}

impl ScheduleConfig {
    pub fn to_schedule(&self) -> Schedule {
        Schedule {
            evaluator_every: std::time::Duration::from_secs(self.evaluator_interval_secs.max(1)),
            analyzer_every: std::time::Duration::from_secs(self.analyzer_interval_hours.max(1) * 3600),
            manager_every: std::time::Duration::from_secs(self.manager_interval_hours.max(1) * 3600),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EvaluatorSection {
    pub min_resolution_delay_minutes: i64,
    pub max_hold_hours: i64,
    pub stale_grace_hours: i64,
    /// Round-trip fee deducted from every simulated fill, in percent.
    pub fee_pct: f64,
    pub batch_limit: usize,
    pub concurrency: usize,
}

impl Default for EvaluatorSection {
    fn default() -> Self {
        Self {
            min_resolution_delay_minutes: 30,
            max_hold_hours: 48,
            stale_grace_hours: 6,
            fee_pct: 0.1,
            batch_limit: 500,
            concurrency: 8,
        }
    }
}

impl EvaluatorSection {
    pub fn to_config(&self) -> EvaluatorConfig {
        EvaluatorConfig {
            min_resolution_delay: Duration::minutes(self.min_resolution_delay_minutes),
            max_hold: Duration::hours(self.max_hold_hours),
            stale_grace: Duration::hours(self.stale_grace_hours),
            fee_pct: self.fee_pct,
            batch_limit: self.batch_limit,
            concurrency: self.concurrency,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnalyzerSection {
    pub windows_hours: Vec<u32>,
    pub min_samples: usize,
    pub p_threshold: f64,
    pub durability_min_samples: usize,
    pub bootstrap_resamples: usize,
    pub bootstrap_seed: u64,
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        Self {
            windows_hours: vec![24, 168],
            min_samples: 30,
            p_threshold: 0.10,
            durability_min_samples: 10,
            bootstrap_resamples: DEFAULT_RESAMPLES,
            bootstrap_seed: DEFAULT_SEED,
        }
    }
}

impl AnalyzerSection {
    pub fn to_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            windows_hours: self.windows_hours.clone(),
            min_samples: self.min_samples,
            p_threshold: self.p_threshold,
            durability_min_samples: self.durability_min_samples,
            bootstrap: Bootstrap {
                resamples: self.bootstrap_resamples,
                seed: self.bootstrap_seed,
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ThresholdsSection {
    pub daily_cap: usize,
    pub min_regime_stable_hours: i64,
    pub min_real_trades: usize,
    pub recommendation_ttl_hours: i64,
    pub baseline_lookback_hours: i64,
    /// JSON file holding the emergency-stop state.
    pub control_file: String,
    pub magnitude_caps: MagnitudeCaps,
    pub rollback: RollbackSection,
}

impl Default for ThresholdsSection {
    fn default() -> Self {
        Self {
            daily_cap: 3,
            min_regime_stable_hours: 12,
            min_real_trades: 10,
            recommendation_ttl_hours: 24,
            baseline_lookback_hours: 72,
            control_file: "canary_control.json".to_string(),
            magnitude_caps: MagnitudeCaps::default(),
            rollback: RollbackSection::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RollbackSection {
    /// Win-rate drop, in percentage points, that triggers a rollback.
    pub win_rate_drop_pct: f64,
    pub win_rate_window_hours: i64,
    pub min_trades_for_win_rate: usize,
    pub max_consecutive_losses: usize,
    pub underperformance_hours: i64,
}

impl Default for RollbackSection {
    fn default() -> Self {
        Self {
            win_rate_drop_pct: 15.0,
            win_rate_window_hours: 24,
            min_trades_for_win_rate: 5,
            max_consecutive_losses: 3,
            underperformance_hours: 48,
        }
    }
}

impl ThresholdsSection {
    pub fn to_config(&self) -> ManagerConfig {
        ManagerConfig {
            safety: SafetyPolicy {
                daily_cap: self.daily_cap,
                magnitude_caps: self.magnitude_caps,
                min_regime_stable: Duration::hours(self.min_regime_stable_hours),
                min_real_trades: self.min_real_trades,
            },
            rollback: RollbackPolicy {
                win_rate_drop_pct: self.rollback.win_rate_drop_pct,
                win_rate_window: Duration::hours(self.rollback.win_rate_window_hours),
                min_trades_for_win_rate: self.rollback.min_trades_for_win_rate,
                max_consecutive_losses: self.rollback.max_consecutive_losses,
                underperformance_window: Duration::hours(self.rollback.underperformance_hours),
            },
            recommendation_ttl: Duration::hours(self.recommendation_ttl_hours),
            baseline_lookback: Duration::hours(self.baseline_lookback_hours),
            control_file: Some(self.control_file.clone()),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            url: "sqlite://canary.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8088,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    pub telegram_chat_id_env: Option<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token_env: None,
            telegram_chat_id_env: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ConfidenceGate,
    Grid,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    pub rule: RuleKind,
    #[serde(default = "default_side")]
    pub side: TradeSide,
}

fn default_side() -> TradeSide {
    TradeSide::Long
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CanaryError> {
        if self.champion.is_empty() {
            return Err(CanaryError::Config("at least one [champion.<strategy>] table is required".into()));
        }
        for (strategy, params) in &self.champion {
            params
                .validate()
                .map_err(|e| CanaryError::Config(format!("champion.{strategy}: {e}")))?;
        }
        for strategy in self.detectors.keys() {
            if !self.champion.contains_key(strategy) {
                return Err(CanaryError::Config(format!("detector {strategy} has no champion parameters")));
            }
        }
        if self.analyzer.windows_hours.is_empty() || self.analyzer.windows_hours.contains(&0) {
            return Err(CanaryError::Config("analyzer.windows_hours must list positive windows".into()));
        }
        if !(0.0..=1.0).contains(&self.analyzer.p_threshold) {
            return Err(CanaryError::Config("analyzer.p_threshold must be within [0, 1]".into()));
        }
        if self.evaluator.max_hold_hours <= 0 {
            return Err(CanaryError::Config("evaluator.max_hold_hours must be positive".into()));
        }
        Ok(())
    }

    /// Initial champion built from the `[champion]` tables.
    pub fn initial_champion(&self) -> ChampionConfig {
        ChampionConfig::new(self.champion.clone())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
