//! `BookProvider` capability set: maintain a live snapshot per symbol and
//! report coarse connection health. Two concrete shapes (§4.B): a streaming
//! provider that reconnects with exponential backoff, and a sandbox
//! provider that synthesizes books for tests/sandbox mode without any
//! network dependency.

pub mod sandbox;
pub mod streaming;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::OrderBookSnapshot;

pub use sandbox::SandboxBookProvider;
pub use streaming::StreamingBookProvider;

/// Coarse connection health, reported independently of per-symbol staleness
/// (staleness is judged by consumers against `OrderBookSnapshot::last_update`,
/// not by the provider).
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub name: String,
    pub state: ConnectionState,
    pub last_update: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait BookProvider: Send + Sync {
    fn name(&self) -> &str;
    fn get_order_book(&self, symbol: &str) -> Option<OrderBookSnapshot>;
    fn get_connection_status(&self) -> ConnectionStatus;
}

/// Shared, thread-safe store of the latest snapshot per symbol for one
/// exchange. A single writer (the provider's own ingest loop) updates it;
/// readers get a consistent view through the lock's read guard, which is
/// the "atomic swap of the snapshot reference" the spec calls for in
/// practice — the guard is held only for the duration of the clone.
#[derive(Clone)]
pub struct BookStore {
    inner: Arc<RwLock<HashMap<String, OrderBookSnapshot>>>,
}

impl BookStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.inner.read().get(symbol).cloned()
    }

    pub fn put(&self, snapshot: OrderBookSnapshot) {
        self.inner.write().insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with a 5-second floor, per spec.md §4.B's failure
/// model. Doubles each call up to a ceiling, grounded in the teacher's
/// reconnect-on-error pattern in `scrapers/binance_price_feed.rs`.
pub struct Backoff {
    floor_ms: u64,
    ceiling_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            floor_ms: 5_000,
            ceiling_ms: 60_000,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> std::time::Duration {
        let exp = self.floor_ms.saturating_mul(1u64 << self.attempt.min(10));
        self.attempt += 1;
        std::time::Duration::from_millis(exp.min(self.ceiling_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_has_five_second_floor_and_doubles() {
        let mut b = Backoff::new();
        assert_eq!(b.next_delay().as_millis(), 5_000);
        assert_eq!(b.next_delay().as_millis(), 10_000);
        assert_eq!(b.next_delay().as_millis(), 20_000);
    }

    #[test]
    fn backoff_respects_ceiling() {
        let mut b = Backoff::new();
        for _ in 0..20 {
            b.next_delay();
        }
        assert!(b.next_delay().as_millis() <= 60_000);
    }

    #[test]
    fn book_store_roundtrip() {
        let store = BookStore::new();
        assert!(store.get("BTC-USD").is_none());
        let snap = OrderBookSnapshot::new("binance", "BTC-USD", vec![], vec![], Utc::now());
        store.put(snap);
        assert!(store.get("BTC-USD").is_some());
        assert_eq!(store.symbols(), vec!["BTC-USD".to_string()]);
    }
}
