//! CANARY daemon.
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the store, seeds or restores the champion configuration, and runs the
//! shadow/threshold cadence loop with graceful shutdown.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use canary::alerts::{Fanout, LogNotifier, Notifier, TelegramNotifier};
use canary::api;
use canary::config::{self, AppConfig, RuleKind, StorageBackend};
use canary::engine::Orchestrator;
use canary::params::ChampionHandle;
use canary::shadow::{ShadowAnalyzer, ShadowEvaluator, ShadowLogger, VariationRegistry};
use canary::storage::{self, MemoryStore, ShadowStore, SqliteStore};
use canary::strategy::rules::{ConfidenceGate, GridEntry};
use canary::strategy::{DetectorSet, StrategyDetector};
use canary::thresholds::ThresholdManager;

const BANNER: &str = r#"
   ____    _    _   _    _    ______   __
  / ___|  / \  | \ | |  / \  |  _ \ \ / /
 | |     / _ \ |  \| | / _ \ | |_) \ V /
 | |___ / ___ \| |\  |/ ___ \|  _ < | |
  \____/_/   \_\_| \_/_/   \_\_| \_\|_|

  Shadow experimentation & adaptive thresholds
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("CANARY_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        config = %config_path,
        strategies = cfg.champion.len(),
        "CANARY starting up"
    );

    // -- Storage and collaborator feeds ----------------------------------

    // Price bars, live trades and regime readings are written to the same
    // SQLite database by the ingestion pipeline.
    let sqlite = Arc::new(SqliteStore::connect(&cfg.storage.url, cfg.storage.max_connections).await?);
    let store: Arc<dyn ShadowStore> = match cfg.storage.backend {
        StorageBackend::Sqlite => sqlite.clone(),
        StorageBackend::Memory => {
            warn!("Memory backend selected: shadow data will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    // -- Champion ---------------------------------------------------------

    let champion = match store.load_champion().await? {
        Some(c) => {
            info!(version = c.version, last_adjustment = ?c.last_adjustment, "Resumed champion from store");
            c
        }
        None => {
            let c = cfg.initial_champion();
            store.save_champion(&c).await.context("Failed to seed champion")?;
            info!(version = c.version, "Seeded champion from config");
            c
        }
    };
    let champion = Arc::new(ChampionHandle::new(champion));

    // -- Components --------------------------------------------------------

    let registry = Arc::new(VariationRegistry::from_config(&cfg.variations)?);
    let detectors = build_detectors(&cfg);
    let notifier = build_notifier(&cfg);

    let control_file = cfg.thresholds.control_file.clone();
    let control = storage::load_control_state(Some(&control_file))?.unwrap_or_default();
    if !control.auto_apply_enabled {
        warn!(reason = ?control.stop_reason, "Emergency stop is active from a previous run");
    }

    let manager = ThresholdManager::new(
        store.clone(),
        champion.clone(),
        sqlite.clone(),
        sqlite.clone(),
        notifier,
        cfg.thresholds.to_config(),
        control,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        ShadowLogger::new(store.clone(), registry.clone(), detectors, champion.clone()),
        ShadowEvaluator::new(store.clone(), sqlite.clone(), cfg.evaluator.to_config()),
        ShadowAnalyzer::new(store.clone(), registry, champion, cfg.analyzer.to_config()),
        manager,
        cfg.schedule.to_schedule(),
    ));

    // -- Run ---------------------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if cfg.api.enabled {
        api::spawn_api(orchestrator.clone(), cfg.api.port, shutdown_rx.clone()).await?;
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received.");
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Entering main loop. Press Ctrl+C to stop.");
    orchestrator.run(shutdown_rx).await;

    let champion = orchestrator.champion().await;
    info!(
        champion_version = champion.version,
        auto_apply = orchestrator.control().await.auto_apply_enabled,
        "CANARY shut down cleanly."
    );
    Ok(())
}

/// One detector per configured strategy; strategies without an explicit
/// rule get the confidence gate.
fn build_detectors(cfg: &AppConfig) -> DetectorSet {
    let mut set = DetectorSet::new();
    for strategy in cfg.champion.keys() {
        let detector: Arc<dyn StrategyDetector> = match cfg.detectors.get(strategy) {
            Some(d) if d.rule == RuleKind::Grid => Arc::new(GridEntry::new(strategy.clone(), d.side)),
            Some(d) => Arc::new(ConfidenceGate::new(strategy.clone(), d.side)),
            None => Arc::new(ConfidenceGate::new(strategy.clone(), canary::types::TradeSide::Long)),
        };
        set.register(detector);
    }
    set
}

/// Log sink always; Telegram when both env vars resolve.
fn build_notifier(cfg: &AppConfig) -> Arc<dyn Notifier> {
    let mut fanout = Fanout::new().with(Arc::new(LogNotifier));

    let token = cfg
        .alerts
        .telegram_bot_token_env
        .as_deref()
        .and_then(|env| AppConfig::resolve_env(env).ok());
    let chat = cfg
        .alerts
        .telegram_chat_id_env
        .as_deref()
        .and_then(|env| AppConfig::resolve_env(env).ok());

    match (token, chat) {
        (Some(token), Some(chat_id)) => match TelegramNotifier::new(SecretString::new(token), chat_id) {
            Ok(telegram) => {
                info!("Telegram alerts enabled");
                fanout = fanout.with(Arc::new(telegram));
            }
            Err(e) => warn!(error = %e, "Telegram client setup failed; alerts go to the log only"),
        },
        _ => info!("Telegram not configured; alerts go to the log only"),
    }

    Arc::new(fanout)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("canary=info"));

    let json_logging = std::env::var("CANARY_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
