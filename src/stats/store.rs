//! `rusqlite`-backed `EventStore` (SPEC_FULL.md §4 supplement): the four
//! tables spec.md §6 names (`ArbitrageEvents`, `Transactions`,
//! `HeatmapCells`, `AggregatedMetrics`) with the indexes it names. Schema is
//! created idempotently at open (`CREATE TABLE IF NOT EXISTS`); migrations
//! themselves stay out of scope per spec.md §1. Grounded in the teacher's
//! `signals/db_storage.rs`: WAL journal mode, a single connection behind a
//! `parking_lot::Mutex` (one writer, many short-lived lock holds), schema
//! bootstrap via `execute_batch`.
//!
//! `HeatmapCells` and `AggregatedMetrics` rows carry a `version` column used
//! for optimistic-concurrency upserts (spec.md §4.I / §5): a row is read,
//! mutated in memory, then written back conditioned on the version it was
//! read at. A conflicting concurrent writer causes zero rows to change;
//! the caller retries up to 5 times with `10·2ⁿ` ms backoff, then drops the
//! update and logs it (spec.md §7 — statistics lose one sample, never fatal).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::models::{AggregatedMetric, ArbitrageEvent, HeatmapCell, Transaction};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS arbitrage_events (
    id TEXT PRIMARY KEY,
    pair TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    day_of_week TEXT NOT NULL,
    hour INTEGER NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_pair ON arbitrage_events(pair);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON arbitrage_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_day_hour_ts ON arbitrage_events(day_of_week, hour, timestamp);

CREATE TABLE IF NOT EXISTS transactions (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    type TEXT NOT NULL,
    pair TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tx_timestamp ON transactions(timestamp);
CREATE INDEX IF NOT EXISTS idx_tx_type ON transactions(type);

CREATE TABLE IF NOT EXISTS heatmap_cells (
    id TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 0,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS aggregated_metrics (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    key TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agg_category ON aggregated_metrics(category);
"#;

pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("open sqlite database")?;
        conn.execute_batch(SCHEMA_SQL).context("create schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite database")?;
        conn.execute_batch(SCHEMA_SQL).context("create schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // -- ArbitrageEvents ---------------------------------------------------

    pub fn insert_event(&self, event: &ArbitrageEvent) -> Result<()> {
        let data = serde_json::to_string(event).context("serialize event")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO arbitrage_events (id, pair, timestamp, day_of_week, hour, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![event.id, event.pair, event.timestamp.to_rfc3339(), event.day_of_week, event.hour, data],
        )
        .context("insert event")?;
        Ok(())
    }

    /// Most recent `limit` events in descending time order — the window
    /// `getStats`'s `AvgSeriesDuration` scans to count direction-runs.
    pub fn recent_events(&self, limit: usize) -> Result<Vec<ArbitrageEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM arbitrage_events ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode event"))
            .collect()
    }

    /// Every event recorded for one calendar cell, ascending by time — the
    /// export surface's per-cell spreadsheet source.
    pub fn events_for_cell(&self, day_of_week: &str, hour: u32) -> Result<Vec<ArbitrageEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM arbitrage_events WHERE day_of_week = ?1 AND hour = ?2 ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![day_of_week, hour], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode event"))
            .collect()
    }

    /// One page of historical events ordered `(timestamp asc, id asc)`,
    /// strictly after `cursor` — the shape `StatsBootstrap` streams in
    /// batches of 5k-10k (spec.md §4.J).
    pub fn events_page(&self, cursor: Option<(chrono::DateTime<chrono::Utc>, &str)>, limit: usize) -> Result<Vec<ArbitrageEvent>> {
        let conn = self.conn.lock();
        let rows = match cursor {
            Some((ts, id)) => {
                let mut stmt = conn.prepare(
                    "SELECT data FROM arbitrage_events
                     WHERE (timestamp, id) > (?1, ?2)
                     ORDER BY timestamp ASC, id ASC LIMIT ?3",
                )?;
                stmt.query_map(params![ts.to_rfc3339(), id, limit as i64], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT data FROM arbitrage_events ORDER BY timestamp ASC, id ASC LIMIT ?1",
                )?;
                stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode event"))
            .collect()
    }

    pub fn event_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM arbitrage_events", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // -- Transactions --------------------------------------------------------

    pub fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        let data = serde_json::to_string(tx).context("serialize transaction")?;
        let type_str = match tx.r#type {
            crate::models::TransactionType::Arbitrage => "Arbitrage",
            crate::models::TransactionType::Rebalance => "Rebalance",
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO transactions (id, timestamp, type, pair, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tx.id, tx.timestamp.to_rfc3339(), type_str, tx.pair, data],
        )
        .context("insert transaction")?;
        Ok(())
    }

    pub fn transactions_by_type(&self, type_str: &str) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM transactions WHERE type = ?1 ORDER BY timestamp ASC")?;
        let rows = stmt
            .query_map(params![type_str], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode transaction"))
            .collect()
    }

    /// Most recent `limit` transactions (any type), descending time order —
    /// used by `SafetyMonitor`'s consecutive-loss check.
    pub fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM transactions ORDER BY timestamp DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode transaction"))
            .collect()
    }

    // -- HeatmapCells (optimistic-concurrency upsert) -----------------------

    fn load_heatmap(&self, id: &str) -> Result<Option<(HeatmapCell, i64)>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT data, version FROM heatmap_cells WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((data, version)) => Ok(Some((serde_json::from_str(&data).context("decode heatmap cell")?, version))),
            None => Ok(None),
        }
    }

    /// `version=0` writes an initial row (fails only if another writer beat
    /// us to the insert); otherwise writes conditioned on the version just
    /// read. Returns `true` iff the write applied.
    fn write_heatmap(&self, cell: &HeatmapCell, expected_version: i64) -> Result<bool> {
        let data = serde_json::to_string(cell).context("serialize heatmap cell")?;
        let conn = self.conn.lock();
        let changed = if expected_version == 0 {
            conn.execute(
                "INSERT OR IGNORE INTO heatmap_cells (id, version, data) VALUES (?1, 1, ?2)",
                params![cell.id, data],
            )
            .context("insert heatmap cell")?
        } else {
            conn.execute(
                "UPDATE heatmap_cells SET version = version + 1, data = ?1 WHERE id = ?2 AND version = ?3",
                params![data, cell.id, expected_version],
            )
            .context("update heatmap cell")?
        };
        Ok(changed > 0)
    }

    /// Reads-mutates-writes a heatmap cell with `mutate`, retrying on
    /// version conflict up to 5 times with `10·2ⁿ` ms backoff. After the
    /// 5th failed attempt, the update is dropped and logged (never fatal).
    pub async fn apply_heatmap<F>(&self, id: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut HeatmapCell),
    {
        for attempt in 0..5u32 {
            let (mut cell, version) = match self.load_heatmap(id)? {
                Some((cell, version)) => (cell, version),
                None => (HeatmapCell::new(id), 0),
            };
            mutate(&mut cell);
            if self.write_heatmap(&cell, version)? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10 * 2u64.pow(attempt))).await;
        }
        warn!(id, "heatmap cell update dropped after 5 conflict retries");
        Ok(())
    }

    pub fn all_heatmap_cells(&self) -> Result<Vec<HeatmapCell>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM heatmap_cells")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode heatmap cell"))
            .collect()
    }

    pub fn get_heatmap_cell(&self, id: &str) -> Result<Option<HeatmapCell>> {
        Ok(self.load_heatmap(id)?.map(|(cell, _)| cell))
    }

    // -- AggregatedMetrics (optimistic-concurrency upsert) ------------------

    fn load_metric(&self, id: &str) -> Result<Option<(AggregatedMetric, i64)>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT data, version FROM aggregated_metrics WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((data, version)) => Ok(Some((serde_json::from_str(&data).context("decode metric")?, version))),
            None => Ok(None),
        }
    }

    fn write_metric(&self, metric: &AggregatedMetric, expected_version: i64) -> Result<bool> {
        let data = serde_json::to_string(metric).context("serialize metric")?;
        let conn = self.conn.lock();
        let changed = if expected_version == 0 {
            conn.execute(
                "INSERT OR IGNORE INTO aggregated_metrics (id, category, key, version, data) VALUES (?1, ?2, ?3, 1, ?4)",
                params![metric.id, metric.category.as_str(), metric.key, data],
            )
            .context("insert metric")?
        } else {
            conn.execute(
                "UPDATE aggregated_metrics SET version = version + 1, data = ?1 WHERE id = ?2 AND version = ?3",
                params![data, metric.id, expected_version],
            )
            .context("update metric")?
        };
        Ok(changed > 0)
    }

    pub async fn apply_metric<F>(&self, category: crate::models::MetricCategory, key: &str, now: chrono::DateTime<chrono::Utc>, mutate: F) -> Result<()>
    where
        F: Fn(&mut AggregatedMetric),
    {
        let id = format!("{}:{}", category.as_str(), key);
        for attempt in 0..5u32 {
            let (mut metric, version) = match self.load_metric(&id)? {
                Some((metric, version)) => (metric, version),
                None => (AggregatedMetric::new(category, key, now), 0),
            };
            mutate(&mut metric);
            if self.write_metric(&metric, version)? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10 * 2u64.pow(attempt))).await;
        }
        warn!(id, "aggregated metric update dropped after 5 conflict retries");
        Ok(())
    }

    pub fn all_aggregated_metrics(&self) -> Result<Vec<AggregatedMetric>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM aggregated_metrics")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode metric"))
            .collect()
    }

    pub fn get_aggregated_metric(&self, id: &str) -> Result<Option<AggregatedMetric>> {
        Ok(self.load_metric(id)?.map(|(metric, _)| metric))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricCategory;
    use chrono::Utc;

    fn sample_event(pair: &str, spread_pct: f64) -> ArbitrageEvent {
        let now = Utc::now();
        ArbitrageEvent {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            direction: "B→C".to_string(),
            spread: spread_pct / 100.0,
            spread_percent: spread_pct,
            depth_buy: 10.0,
            depth_sell: 10.0,
            timestamp: now,
            day_of_week: "Mon".to_string(),
            hour: now.format("%H").to_string().parse().unwrap_or(0),
        }
    }

    #[test]
    fn insert_and_read_event_roundtrips() {
        let store = EventStore::open_in_memory().unwrap();
        let event = sample_event("BTC-USD", 1.5);
        store.insert_event(&event).unwrap();
        let recent = store.recent_events(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].pair, "BTC-USD");
    }

    #[test]
    fn events_for_cell_filters_by_day_and_hour() {
        let store = EventStore::open_in_memory().unwrap();
        let mut matching = sample_event("BTC-USD", 1.0);
        matching.day_of_week = "Tue".to_string();
        matching.hour = 9;
        let mut other_hour = sample_event("BTC-USD", 2.0);
        other_hour.day_of_week = "Tue".to_string();
        other_hour.hour = 10;
        store.insert_event(&matching).unwrap();
        store.insert_event(&other_hour).unwrap();

        let cell_events = store.events_for_cell("Tue", 9).unwrap();
        assert_eq!(cell_events.len(), 1);
        assert_eq!(cell_events[0].id, matching.id);
    }

    #[tokio::test]
    async fn heatmap_apply_is_idempotent_across_calls() {
        let store = EventStore::open_in_memory().unwrap();
        store.apply_heatmap("Mon-12", |c| c.apply_event(1.0, "B→C")).await.unwrap();
        store.apply_heatmap("Mon-12", |c| c.apply_event(3.0, "B→C")).await.unwrap();
        let cell = store.get_heatmap_cell("Mon-12").unwrap().unwrap();
        assert_eq!(cell.event_count, 2);
        assert!((cell.avg_spread_percent - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn concurrent_heatmap_applies_all_land() {
        let store = std::sync::Arc::new(EventStore::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.apply_heatmap("Tue-09", |c| c.apply_event(2.0, "B→C")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let cell = store.get_heatmap_cell("Tue-09").unwrap().unwrap();
        assert_eq!(cell.event_count, 20);
    }

    #[tokio::test]
    async fn metric_apply_accumulates() {
        let store = EventStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .apply_metric(MetricCategory::Pair, "BTC-USD", now, |m| m.apply_event(1.0, 5.0, 5.0, now))
            .await
            .unwrap();
        store
            .apply_metric(MetricCategory::Pair, "BTC-USD", now, |m| m.apply_event(3.0, 5.0, 5.0, now))
            .await
            .unwrap();
        let metric = store.get_aggregated_metric("Pair:BTC-USD").unwrap().unwrap();
        assert_eq!(metric.event_count, 2);
        assert!((metric.sum_spread_percent - 4.0).abs() < 1e-9);
    }

    #[test]
    fn transaction_roundtrip_and_type_filter() {
        let store = EventStore::open_in_memory().unwrap();
        let tx = crate::models::Transaction {
            id: "tx-1".to_string(),
            timestamp: Utc::now(),
            r#type: crate::models::TransactionType::Arbitrage,
            asset: "BTC".to_string(),
            pair: "BTC-USD".to_string(),
            amount: rust_decimal::Decimal::ONE,
            buy_exchange: "A".to_string(),
            sell_exchange: "B".to_string(),
            buy_order_id: Some("b1".to_string()),
            sell_order_id: Some("s1".to_string()),
            buy_order_status: crate::models::OrderStatus::Filled,
            sell_order_status: crate::models::OrderStatus::Filled,
            recovery_order_id: None,
            strategy: crate::models::ExecutionStrategy::Sequential,
            buy_cost: rust_decimal::Decimal::ONE,
            sell_proceeds: rust_decimal::Decimal::ONE,
            total_fees: rust_decimal::Decimal::ZERO,
            realized_profit: rust_decimal::Decimal::ZERO,
            status: crate::models::TransactionStatus::Success,
            is_recovered: false,
        };
        store.insert_transaction(&tx).unwrap();
        let found = store.transactions_by_type("Arbitrage").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "tx-1");
    }
}
