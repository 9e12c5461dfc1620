//! Latest bid/ask per instrument, fed by the external market-data stream.
//!
//! Pure read model: the engine is the sole writer and readers get
//! eventually-consistent snapshots. A missing symbol is reported as `None`,
//! never an error, so scan cycles can skip it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// One market-data tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Cache of the latest tick per symbol.
#[derive(Default)]
pub struct PriceCache {
    ticks: RwLock<HashMap<String, PriceTick>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a tick, accepting symbols not yet tracked. Ticks with a
    /// non-positive or crossed quote are dropped.
    pub async fn update(&self, tick: PriceTick) {
        if tick.bid <= Decimal::ZERO || tick.ask <= Decimal::ZERO || tick.ask < tick.bid {
            warn!(symbol = %tick.symbol, bid = %tick.bid, ask = %tick.ask, "Dropping malformed tick");
            return;
        }
        let mut ticks = self.ticks.write().await;
        ticks.insert(tick.symbol.to_uppercase(), tick);
    }

    /// Latest quote for a symbol, if any.
    pub async fn get(&self, symbol: &str) -> Option<PriceTick> {
        let ticks = self.ticks.read().await;
        ticks.get(&symbol.to_uppercase()).cloned()
    }

    /// Snapshot of every tracked symbol.
    pub async fn snapshot(&self) -> HashMap<String, PriceTick> {
        self.ticks.read().await.clone()
    }

    /// Drain a tick stream into the cache until the sender side closes.
    pub async fn run_feed(&self, mut rx: mpsc::UnboundedReceiver<PriceTick>) {
        while let Some(tick) = rx.recv().await {
            debug!(symbol = %tick.symbol, bid = %tick.bid, ask = %tick.ask, "Tick");
            self.update(tick).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tick(symbol: &str, bid: Decimal, ask: Decimal) -> PriceTick {
        PriceTick {
            symbol: symbol.to_string(),
            bid,
            ask,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_update_and_get() {
        let cache = PriceCache::new();
        cache.update(tick("eurusd", dec!(1.1000), dec!(1.1001))).await;

        let quote = cache.get("EURUSD").await.unwrap();
        assert_eq!(quote.bid, dec!(1.1000));
        assert_eq!(quote.ask, dec!(1.1001));

        assert!(cache.get("GBPUSD").await.is_none());
        assert_eq!(cache.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_crossed_quote() {
        let cache = PriceCache::new();
        cache.update(tick("EURUSD", dec!(1.2), dec!(1.1))).await;
        assert!(cache.get("EURUSD").await.is_none());
    }
}
