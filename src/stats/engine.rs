//! Incremental statistics aggregator (spec.md §4.I). Consumes `EventCh`
//! and `TransactionCh` concurrently; each event fans out to three
//! independent, idempotent processors (persistence, heatmap, aggregates)
//! run in parallel via `tokio::join!`, matching the teacher's
//! `tokio::join!`/`future::join_all` fan-out shape used elsewhere in this
//! crate (`rebalance/service.rs`). `get_stats` assembles the read surface
//! straight from the persisted `AggregatedMetric`/`HeatmapCell` rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::store::EventStore;
use crate::broadcast::BroadcastHub;
use crate::models::{
    day_long_for, ActivityZone, ArbitrageEvent, MetricCategory, Transaction, TransactionStatus, TransactionType,
};

const SERIES_WINDOW: usize = 1000;

#[derive(Debug, Clone, Serialize, Default)]
pub struct CategorySummary {
    pub count: u64,
    pub avg_spread: f64,
    pub max_spread: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalendarCell {
    pub count: u64,
    pub avg_spread_percent: f64,
    pub max_spread_percent: f64,
    pub volatility_score: f64,
    pub zone: &'static str,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StatsSummary {
    pub pairs: BTreeMap<String, CategorySummary>,
    pub hours: BTreeMap<u32, CategorySummary>,
    pub days: BTreeMap<String, CategorySummary>,
    pub direction_distribution: BTreeMap<String, CategorySummary>,
    pub global: CategorySummary,
    pub avg_series_duration: f64,
    pub calendar: BTreeMap<String, BTreeMap<u32, CalendarCell>>,
    pub total_realized_profit: Decimal,
    pub success_rate: f64,
    pub profitability_rate: f64,
}

pub struct StatsEngine {
    store: Option<Arc<EventStore>>,
    broadcast: Arc<BroadcastHub>,
    event_rx: AsyncMutex<mpsc::UnboundedReceiver<ArbitrageEvent>>,
    transaction_rx: AsyncMutex<mpsc::UnboundedReceiver<Transaction>>,
}

impl StatsEngine {
    pub fn new(
        store: Option<Arc<EventStore>>,
        broadcast: Arc<BroadcastHub>,
        event_rx: mpsc::UnboundedReceiver<ArbitrageEvent>,
        transaction_rx: mpsc::UnboundedReceiver<Transaction>,
    ) -> Self {
        Self {
            store,
            broadcast,
            event_rx: AsyncMutex::new(event_rx),
            transaction_rx: AsyncMutex::new(transaction_rx),
        }
    }

    /// Long-lived task: drains both channels concurrently until cancelled
    /// or both close. Each item is handled in its own spawned task so a
    /// slow processor on one event never head-of-line-blocks the next.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut event_rx = self.event_rx.lock().await;
        let mut transaction_rx = self.transaction_rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_rx.recv() => {
                    match event {
                        Some(event) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.process_event(event).await; });
                        }
                        None => break,
                    }
                }
                tx = transaction_rx.recv() => {
                    match tx {
                        Some(tx) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.process_transaction(tx).await; });
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Normalize, then fan out to persistence/heatmap/aggregates in
    /// parallel. Each processor is independently idempotent; a failure in
    /// one never blocks the others (spec.md §4.I).
    pub async fn process_event(&self, event: ArbitrageEvent) {
        let Some(store) = self.store.clone() else { return };

        let persist = {
            let store = store.clone();
            let event = event.clone();
            async move {
                if let Err(e) = store.insert_event(&event) {
                    warn!(error = %e, event_id = %event.id, "event persistence failed");
                }
            }
        };

        let heatmap = {
            let store = store.clone();
            let id = event.hour_key();
            let spread_percent = event.spread_percent;
            let direction = event.direction.clone();
            async move {
                if let Err(e) = store.apply_heatmap(&id, move |c| c.apply_event(spread_percent, &direction)).await {
                    warn!(error = %e, id, "heatmap upsert failed");
                }
            }
        };

        let aggregates = {
            let store = store.clone();
            let event = event.clone();
            async move {
                let keys = [
                    (MetricCategory::Pair, event.pair.clone()),
                    (MetricCategory::Hour, event.hour_key()),
                    (MetricCategory::Day, day_long_for(event.timestamp).to_string()),
                    (MetricCategory::Direction, event.direction.clone()),
                    (MetricCategory::Global, "Total".to_string()),
                ];
                for (category, key) in keys {
                    let spread_percent = event.spread_percent;
                    let depth_buy = event.depth_buy;
                    let depth_sell = event.depth_sell;
                    let now = event.timestamp;
                    if let Err(e) = store
                        .apply_metric(category, &key, now, move |m| m.apply_event(spread_percent, depth_buy, depth_sell, now))
                        .await
                    {
                        warn!(error = %e, category = category.as_str(), key, "aggregate upsert failed");
                    }
                }
            }
        };

        tokio::join!(persist, heatmap, aggregates);
    }

    pub async fn process_transaction(&self, tx: Transaction) {
        if let Some(store) = &self.store {
            if let Err(e) = store.insert_transaction(&tx) {
                warn!(error = %e, tx_id = %tx.id, "transaction persistence failed");
            }
        }
        self.broadcast.publish("ReceiveTransaction", &tx);
    }

    pub fn get_stats(&self) -> Result<StatsSummary> {
        let Some(store) = &self.store else {
            return Ok(StatsSummary::default());
        };

        let metrics = store.all_aggregated_metrics()?;
        let mut summary = StatsSummary::default();
        let mut hour_rows: BTreeMap<String, CategorySummary> = BTreeMap::new();

        for metric in &metrics {
            let avg = if metric.event_count > 0 {
                metric.sum_spread_percent / metric.event_count as f64 / 100.0
            } else {
                0.0
            };
            let cat_summary = CategorySummary {
                count: metric.event_count,
                avg_spread: avg,
                max_spread: metric.max_spread_percent / 100.0,
            };
            match metric.category {
                MetricCategory::Pair => {
                    summary.pairs.insert(metric.key.clone(), cat_summary);
                }
                MetricCategory::Hour => {
                    hour_rows.insert(metric.key.clone(), cat_summary);
                }
                MetricCategory::Day => {
                    summary.days.insert(metric.key.clone(), cat_summary);
                }
                MetricCategory::Direction => {
                    summary.direction_distribution.insert(metric.key.clone(), cat_summary);
                }
                MetricCategory::Global => {
                    summary.global = cat_summary;
                }
            }
        }

        // Summary.Hours groups Hour rows ("<DayShort>-<HH>") by the bare
        // hour-of-day, summing across every day that shares it.
        for (key, row) in &hour_rows {
            let Some(hh) = key.rsplit('-').next().and_then(|h| h.parse::<u32>().ok()) else {
                continue;
            };
            let entry = summary.hours.entry(hh).or_default();
            entry.count += row.count;
            entry.avg_spread = if entry.count > 0 {
                (entry.avg_spread * (entry.count - row.count) as f64 + row.avg_spread * row.count as f64) / entry.count as f64
            } else {
                0.0
            };
            entry.max_spread = entry.max_spread.max(row.max_spread);
        }

        // Calendar: per-(day,hour) detail with the rule-based volatility
        // score, driven directly off the Hour aggregated-metric rows.
        let max_hourly_count = hour_rows.values().map(|r| r.count).max().unwrap_or(0);
        for (key, row) in &hour_rows {
            let Some((day, hh)) = key.split_once('-') else { continue };
            let Ok(hh) = hh.parse::<u32>() else { continue };
            let count_score = if max_hourly_count == 0 {
                0.0
            } else {
                (row.count as f64 / max_hourly_count as f64).clamp(0.0, 1.0)
            };
            let spread_score = (row.avg_spread / 0.01).clamp(0.0, 1.0);
            let depth_score = if let Some(metric) = metrics.iter().find(|m| m.category == MetricCategory::Hour && m.key == *key) {
                (metric.sum_depth / metric.event_count.max(1) as f64 / 1000.0).clamp(0.0, 1.0)
            } else {
                0.0
            };
            const STABILITY_PLACEHOLDER: f64 = 0.5;
            let score = 0.4 * count_score + 0.3 * spread_score + 0.2 * depth_score + 0.1 * STABILITY_PLACEHOLDER;
            let cell = CalendarCell {
                count: row.count,
                avg_spread_percent: row.avg_spread * 100.0,
                max_spread_percent: row.max_spread * 100.0,
                volatility_score: score,
                zone: ActivityZone::from_score(score).as_str(),
            };
            summary.calendar.entry(day.to_string()).or_default().insert(hh, cell);
        }

        let recent = store.recent_events(SERIES_WINDOW)?;
        summary.avg_series_duration = avg_run_length(&recent);

        let transactions = store.transactions_by_type(type_str(TransactionType::Arbitrage))?;
        let total = transactions.len();
        if total > 0 {
            let successful = transactions.iter().filter(|t| t.status == TransactionStatus::Success).count();
            let profitable = transactions.iter().filter(|t| t.realized_profit > Decimal::ZERO).count();
            summary.success_rate = successful as f64 / total as f64;
            summary.profitability_rate = profitable as f64 / total as f64;
            summary.total_realized_profit = transactions.iter().map(|t| t.realized_profit).sum();
        }

        Ok(summary)
    }
}

fn type_str(t: TransactionType) -> &'static str {
    match t {
        TransactionType::Arbitrage => "Arbitrage",
        TransactionType::Rebalance => "Rebalance",
    }
}

/// `recent_events` returns descending time order; reverse to ascending,
/// then count runs of equal `direction` and average the run lengths.
fn avg_run_length(recent_desc: &[ArbitrageEvent]) -> f64 {
    if recent_desc.is_empty() {
        return 0.0;
    }
    let mut ascending: Vec<&ArbitrageEvent> = recent_desc.iter().collect();
    ascending.reverse();

    let mut runs = Vec::new();
    let mut current = &ascending[0].direction;
    let mut len = 1usize;
    for event in &ascending[1..] {
        if &event.direction == current {
            len += 1;
        } else {
            runs.push(len);
            current = &event.direction;
            len = 1;
        }
    }
    runs.push(len);
    runs.iter().sum::<usize>() as f64 / runs.len() as f64
}
