//! External collaborator feeds.
//!
//! Price history, the market-regime signal and the live trade ledger are
//! owned by other parts of the trading system. CANARY only reads them
//! through these traits.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::types::{Candle, LiveTrade, RegimeStatus};

/// Historical OHLC bars.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Bars for `symbol` whose open time lies in `[start, end)`, oldest first.
    async fn candles(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Candle>>;
}

/// Market-regime stability signal.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegimeSignal: Send + Sync {
    async fn current(&self) -> Result<RegimeStatus>;
}

/// Completed real trades.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TradeLedger: Send + Sync {
    /// Trades for `strategy` closed at or after `since`, oldest first.
    async fn trades_since(&self, strategy: &str, since: DateTime<Utc>) -> Result<Vec<LiveTrade>>;
}
