//! One-shot startup replay (spec.md §4.J): walks every persisted
//! `ArbitrageEvent` once, builds heatmap/aggregate state purely in memory,
//! then merge-saves it back through the same CAS primitives the live
//! `StatsEngine` uses — so a crash mid-bootstrap just means some events get
//! re-scanned and re-merged next boot, never double counted in a way that
//! corrupts the running aggregates (merge is commutative/associative).

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::store::EventStore;
use crate::models::{day_long_for, AggregatedMetric, ArbitrageEvent, HeatmapCell, MetricCategory};

const PAGE_SIZE: usize = 8000;
const SAVE_BATCH: usize = 500;

#[derive(Debug, Clone, Serialize, Default)]
pub struct BootstrapReport {
    pub events_scanned: u64,
    pub heatmap_cells_written: u64,
    pub metrics_written: u64,
}

pub struct StatsBootstrap;

impl StatsBootstrap {
    /// Replays history and writes the resulting aggregates back to `store`.
    /// Safe to call on an empty store (no-op) or to re-run after a partial
    /// prior run.
    pub async fn run(store: &EventStore) -> Result<BootstrapReport> {
        let mut heatmaps: HashMap<String, HeatmapCell> = HashMap::new();
        let mut metrics: HashMap<String, AggregatedMetric> = HashMap::new();
        let mut cursor: Option<(DateTime<Utc>, String)> = None;
        let mut events_scanned = 0u64;

        loop {
            let cursor_ref = cursor.as_ref().map(|(ts, id)| (*ts, id.as_str()));
            let page = store.events_page(cursor_ref, PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            for event in &page {
                events_scanned += 1;
                fold_event(&mut heatmaps, &mut metrics, event);
            }
            let last = page.last().expect("non-empty page");
            cursor = Some((last.timestamp, last.id.clone()));
            if page_len < PAGE_SIZE {
                break;
            }
        }

        info!(events_scanned, heatmap_cells = heatmaps.len(), metrics = metrics.len(), "bootstrap scan complete, merge-saving");

        let mut heatmap_cells_written = 0u64;
        for batch in heatmaps.into_values().collect::<Vec<_>>().chunks(SAVE_BATCH) {
            for cell in batch {
                let id = cell.id.clone();
                let cell = cell.clone();
                store.apply_heatmap(&id, move |existing| existing.merge(&cell)).await?;
                heatmap_cells_written += 1;
            }
        }

        let mut metrics_written = 0u64;
        for batch in metrics.into_values().collect::<Vec<_>>().chunks(SAVE_BATCH) {
            for metric in batch {
                let category = metric.category;
                let key = metric.key.clone();
                let now = metric.last_updated;
                let metric = metric.clone();
                store.apply_metric(category, &key, now, move |existing| existing.merge(&metric)).await?;
                metrics_written += 1;
            }
        }

        Ok(BootstrapReport {
            events_scanned,
            heatmap_cells_written,
            metrics_written,
        })
    }
}

fn fold_event(heatmaps: &mut HashMap<String, HeatmapCell>, metrics: &mut HashMap<String, AggregatedMetric>, event: &ArbitrageEvent) {
    let hour_key = event.hour_key();
    heatmaps
        .entry(hour_key.clone())
        .or_insert_with(|| HeatmapCell::new(&hour_key))
        .apply_event(event.spread_percent, &event.direction);

    let keys = [
        (MetricCategory::Pair, event.pair.clone()),
        (MetricCategory::Hour, event.hour_key()),
        (MetricCategory::Day, day_long_for(event.timestamp).to_string()),
        (MetricCategory::Direction, event.direction.clone()),
        (MetricCategory::Global, "Total".to_string()),
    ];
    for (category, key) in keys {
        let id = format!("{}:{}", category.as_str(), key);
        metrics
            .entry(id)
            .or_insert_with(|| AggregatedMetric::new(category, key, event.timestamp))
            .apply_event(event.spread_percent, event.depth_buy, event.depth_sell, event.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn event(pair: &str, direction: &str, hour: u32, spread_pct: f64) -> ArbitrageEvent {
        ArbitrageEvent {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            direction: direction.to_string(),
            spread: spread_pct / 100.0,
            spread_percent: spread_pct,
            depth_buy: 10.0,
            depth_sell: 10.0,
            timestamp: Utc::now(),
            day_of_week: "Mon".to_string(),
            hour,
        }
    }

    #[tokio::test]
    async fn bootstrap_rebuilds_aggregates_from_scratch() {
        let store = EventStore::open_in_memory().unwrap();
        store.insert_event(&event("BTC-USD", "B→C", 12, 1.0)).unwrap();
        store.insert_event(&event("BTC-USD", "B→C", 12, 3.0)).unwrap();
        store.insert_event(&event("ETH-USD", "C→B", 13, 2.0)).unwrap();

        let report = StatsBootstrap::run(&store).await.unwrap();
        assert_eq!(report.events_scanned, 3);

        let cell = store.get_heatmap_cell("Mon-12").unwrap().unwrap();
        assert_eq!(cell.event_count, 2);
        assert!((cell.avg_spread_percent - 2.0).abs() < 1e-9);

        let pair_metric = store.get_aggregated_metric("Pair:BTC-USD").unwrap().unwrap();
        assert_eq!(pair_metric.event_count, 2);
        let global = store.get_aggregated_metric("Global:Total").unwrap().unwrap();
        assert_eq!(global.event_count, 3);
    }

    #[tokio::test]
    async fn bootstrap_merges_on_top_of_existing_live_aggregates() {
        let store = EventStore::open_in_memory().unwrap();
        store.apply_heatmap("Mon-12", |c| c.apply_event(5.0, "B→C")).await.unwrap();
        store.insert_event(&event("BTC-USD", "B→C", 12, 1.0)).unwrap();

        StatsBootstrap::run(&store).await.unwrap();

        let cell = store.get_heatmap_cell("Mon-12").unwrap().unwrap();
        assert_eq!(cell.event_count, 2);
    }

    #[tokio::test]
    async fn bootstrap_on_empty_store_is_a_no_op() {
        let store = EventStore::open_in_memory().unwrap();
        let report = StatsBootstrap::run(&store).await.unwrap();
        assert_eq!(report.events_scanned, 0);
        assert_eq!(report.heatmap_cells_written, 0);
    }
}
