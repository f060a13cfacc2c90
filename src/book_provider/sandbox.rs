//! Sandbox `BookProvider`: synthesizes a depth book around a seeded mid
//! price for each symbol, advancing the mid with a small deterministic
//! drift on every `tick()`. No network dependency — used for sandbox mode
//! and as the deterministic fixture for detector/executor tests, the way
//! the teacher's `SandboxState` mirrors live prices without hitting a venue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use super::{BookProvider, BookStore, ConnectionState, ConnectionStatus};
use crate::models::{Level, OrderBookSnapshot};

#[derive(Clone)]
struct Seed {
    mid: Decimal,
    step: Decimal,
    depth_levels: usize,
    level_qty: Decimal,
    level_step: Decimal,
}

pub struct SandboxBookProvider {
    name: String,
    store: BookStore,
    seeds: Arc<RwLock<HashMap<String, Seed>>>,
}

impl SandboxBookProvider {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            store: BookStore::new(),
            seeds: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn seed(
        &self,
        symbol: impl Into<String>,
        mid: Decimal,
        step: Decimal,
        depth_levels: usize,
        level_qty: Decimal,
        level_step: Decimal,
    ) {
        let symbol = symbol.into();
        self.seeds.write().insert(
            symbol.clone(),
            Seed {
                mid,
                step,
                depth_levels,
                level_qty,
                level_step,
            },
        );
        self.rebuild(&symbol);
    }

    /// Directly set bids/asks, bypassing the synthetic walk — used by tests
    /// that need an exact, hand-crafted book.
    pub fn set_book(&self, symbol: impl Into<String>, bids: Vec<Level>, asks: Vec<Level>) {
        let symbol = symbol.into();
        let snapshot = OrderBookSnapshot::new(self.name.clone(), symbol, bids, asks, Utc::now());
        self.store.put(snapshot);
    }

    /// Advance every seeded symbol's mid by its configured drift and
    /// rebuild its book. Intended to be called on a timer by the sandbox
    /// provider's own poll loop.
    pub fn tick(&self) {
        let symbols: Vec<String> = self.seeds.read().keys().cloned().collect();
        for symbol in symbols {
            let mut seeds = self.seeds.write();
            if let Some(seed) = seeds.get_mut(&symbol) {
                seed.mid += seed.step;
                let seed = seed.clone();
                drop(seeds);
                self.rebuild_from(&symbol, &seed);
            }
        }
    }

    fn rebuild(&self, symbol: &str) {
        if let Some(seed) = self.seeds.read().get(symbol).cloned() {
            self.rebuild_from(symbol, &seed);
        }
    }

    fn rebuild_from(&self, symbol: &str, seed: &Seed) {
        let half_spread = seed.mid * Decimal::new(5, 4); // 0.0005 * mid
        let mut bids = Vec::with_capacity(seed.depth_levels);
        let mut asks = Vec::with_capacity(seed.depth_levels);
        let best_bid = seed.mid - half_spread;
        let best_ask = seed.mid + half_spread;
        for i in 0..seed.depth_levels {
            let offset = seed.level_step * Decimal::from(i as u64);
            bids.push((best_bid - offset, seed.level_qty));
            asks.push((best_ask + offset, seed.level_qty));
        }
        let snapshot = OrderBookSnapshot::new(
            self.name.clone(),
            symbol.to_string(),
            bids,
            asks,
            Utc::now(),
        );
        self.store.put(snapshot);
    }
}

#[async_trait]
impl BookProvider for SandboxBookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_order_book(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.store.get(symbol)
    }

    fn get_connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            name: self.name.clone(),
            state: ConnectionState::Connected,
            last_update: Some(Utc::now()),
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn seeded_book_is_consistent_and_has_depth() {
        let provider = SandboxBookProvider::new("Binance");
        provider.seed("BTC-USD", dec!(50000), dec!(0), 5, dec!(1), dec!(1));
        let book = provider.get_order_book("BTC-USD").unwrap();
        assert!(book.is_consistent());
        assert_eq!(book.bids.len(), 5);
        assert_eq!(book.asks.len(), 5);
    }

    #[test]
    fn tick_drifts_mid_price() {
        let provider = SandboxBookProvider::new("Binance");
        provider.seed("BTC-USD", dec!(50000), dec!(10), 3, dec!(1), dec!(1));
        let before = provider.get_order_book("BTC-USD").unwrap().asks[0].0;
        provider.tick();
        let after = provider.get_order_book("BTC-USD").unwrap().asks[0].0;
        assert!(after > before);
    }
}
