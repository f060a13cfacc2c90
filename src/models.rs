//! Core data model
//! Mission: one unambiguous shape for every value that crosses a channel or hits disk.

use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Semantic `(base, quote)` identifier. Immutable; the engine trades a fixed
/// configured set of these. Per-exchange symbol spelling is a rendering
/// concern, not part of identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Canonical `BASE-QUOTE` spelling used as the internal symbol key.
    pub fn symbol(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }

    /// Render the exchange-specific spelling for a given exchange name.
    /// Most venues want `BASEQUOTE` (e.g. `BTCUSDT`); a couple want the
    /// dashed form. Unknown exchanges fall back to the concatenated form.
    pub fn render_for(&self, exchange: &str) -> String {
        match exchange {
            "coinbase" | "Coinbase" => format!("{}-{}", self.base, self.quote),
            _ => format!("{}{}", self.base, self.quote),
        }
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One price level: `(price, quantity)`.
pub type Level = (Decimal, Decimal);

/// Live top-of-book / depth-20 snapshot for one `(exchange, symbol)`.
/// Owned by its `BookProvider`; externally read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: String,
    pub symbol: String,
    /// Descending by price.
    pub bids: Vec<Level>,
    /// Ascending by price.
    pub asks: Vec<Level>,
    pub last_update: DateTime<Utc>,
}

impl OrderBookSnapshot {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        bids: Vec<Level>,
        asks: Vec<Level>,
        last_update: DateTime<Utc>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            bids,
            asks,
            last_update,
        }
    }

    /// Inner-spread invariant: `bids[0].price < asks[0].price` when both
    /// sides are non-empty. Snapshots that fail this are skipped by callers,
    /// never acted on.
    pub fn is_consistent(&self) -> bool {
        match (self.bids.first(), self.asks.first()) {
            (Some((bid, _)), Some((ask, _))) => bid < ask,
            _ => true,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_update)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age_ms: i64) -> bool {
        self.age(now).num_milliseconds() > max_age_ms
    }
}

/// Outcome status of one detection sample flowing downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityStatus {
    Detected,
    SentToTrade,
    SentToPassiveRebalance,
    Discarded,
}

/// One detection sample. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub id: String,
    pub symbol: String,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub avg_buy_price: Decimal,
    pub avg_sell_price: Decimal,
    pub buy_depth: Decimal,
    pub sell_depth: Decimal,
    pub volume: Decimal,
    pub buy_fee: Decimal,
    pub sell_fee: Decimal,
    pub gross_profit_pct: f64,
    pub net_profit_pct: f64,
    pub is_sandbox: bool,
    pub timestamp: DateTime<Utc>,
    pub status: OpportunityStatus,
}

impl ArbitrageOpportunity {
    /// Notional value of the trade in quote-currency terms, used for the
    /// `$10` minimum-notional gate.
    pub fn notional_usd(&self) -> Decimal {
        self.avg_buy_price * self.volume
    }
}

pub fn day_short(dt: DateTime<Utc>) -> &'static str {
    match dt.weekday() {
        chrono::Weekday::Mon => "Mon",
        chrono::Weekday::Tue => "Tue",
        chrono::Weekday::Wed => "Wed",
        chrono::Weekday::Thu => "Thu",
        chrono::Weekday::Fri => "Fri",
        chrono::Weekday::Sat => "Sat",
        chrono::Weekday::Sun => "Sun",
    }
}

fn day_long(dt: DateTime<Utc>) -> &'static str {
    match dt.weekday() {
        chrono::Weekday::Mon => "Monday",
        chrono::Weekday::Tue => "Tuesday",
        chrono::Weekday::Wed => "Wednesday",
        chrono::Weekday::Thu => "Thursday",
        chrono::Weekday::Fri => "Friday",
        chrono::Weekday::Sat => "Saturday",
        chrono::Weekday::Sun => "Sunday",
    }
}

/// Compact, persisted derivative of an opportunity used for stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageEvent {
    pub id: String,
    pub pair: String,
    /// `"B→C"` style: first letter of buy exchange, arrow, first letter of sell exchange.
    pub direction: String,
    /// Fractional spread, e.g. `0.012` for 1.2%.
    pub spread: f64,
    pub spread_percent: f64,
    pub depth_buy: f64,
    pub depth_sell: f64,
    pub timestamp: DateTime<Utc>,
    pub day_of_week: String,
    pub hour: u32,
}

impl ArbitrageEvent {
    pub fn from_opportunity(opp: &ArbitrageOpportunity) -> Self {
        let ts = opp.timestamp;
        let spread = opp.net_profit_pct / 100.0;
        Self {
            id: opp.id.clone(),
            pair: opp.symbol.clone(),
            direction: direction_code(&opp.buy_exchange, &opp.sell_exchange),
            spread,
            spread_percent: spread * 100.0,
            depth_buy: opp.buy_depth.to_string().parse().unwrap_or(0.0),
            depth_sell: opp.sell_depth.to_string().parse().unwrap_or(0.0),
            timestamp: ts,
            day_of_week: day_short(ts).to_string(),
            hour: ts.hour(),
        }
    }

    pub fn hour_key(&self) -> String {
        format!("{}-{:02}", self.day_of_week, self.hour)
    }
}

pub fn direction_code(buy_exchange: &str, sell_exchange: &str) -> String {
    let b = buy_exchange.chars().next().unwrap_or('?').to_ascii_uppercase();
    let s = sell_exchange.chars().next().unwrap_or('?').to_ascii_uppercase();
    format!("{}→{}", b, s)
}

pub fn day_long_for(dt: DateTime<Utc>) -> &'static str {
    day_long(dt)
}

/// What kind of trade produced a `Transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Arbitrage,
    Rebalance,
}

/// Execution strategy used for the two legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    Sequential,
    Concurrent,
}

/// Terminal status of an attempted trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Success,
    Failed,
    Recovered,
    OneSidedFill,
}

/// One attempted trade outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub r#type: TransactionType,
    pub asset: String,
    pub pair: String,
    pub amount: Decimal,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    pub buy_order_status: OrderStatus,
    pub sell_order_status: OrderStatus,
    pub recovery_order_id: Option<String>,
    pub strategy: ExecutionStrategy,
    pub buy_cost: Decimal,
    pub sell_proceeds: Decimal,
    pub total_fees: Decimal,
    pub realized_profit: Decimal,
    pub status: TransactionStatus,
    pub is_recovered: bool,
}

/// Category a metric row is keyed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricCategory {
    Pair,
    Hour,
    Day,
    Direction,
    Global,
}

impl MetricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricCategory::Pair => "Pair",
            MetricCategory::Hour => "Hour",
            MetricCategory::Day => "Day",
            MetricCategory::Direction => "Direction",
            MetricCategory::Global => "Global",
        }
    }
}

/// Time-independent summary keyed `"{category}:{key}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub id: String,
    pub category: MetricCategory,
    pub key: String,
    pub event_count: u64,
    pub sum_spread_percent: f64,
    pub max_spread_percent: f64,
    pub sum_depth: f64,
    pub last_updated: DateTime<Utc>,
}

impl AggregatedMetric {
    pub fn new(category: MetricCategory, key: impl Into<String>, now: DateTime<Utc>) -> Self {
        let key = key.into();
        Self {
            id: format!("{}:{}", category.as_str(), key),
            category,
            key,
            event_count: 0,
            sum_spread_percent: 0.0,
            max_spread_percent: f64::NEG_INFINITY,
            sum_depth: 0.0,
            last_updated: now,
        }
    }

    pub fn apply_event(&mut self, spread_percent: f64, depth_buy: f64, depth_sell: f64, now: DateTime<Utc>) {
        self.event_count += 1;
        self.sum_spread_percent += spread_percent;
        self.sum_depth += (depth_buy + depth_sell) / 2.0;
        self.max_spread_percent = self.max_spread_percent.max(spread_percent);
        self.last_updated = now;
    }

    /// Merge another row produced independently over the same key
    /// (summation for count/sum/depth, max for max) — used by bootstrap.
    pub fn merge(&mut self, other: &AggregatedMetric) {
        self.event_count += other.event_count;
        self.sum_spread_percent += other.sum_spread_percent;
        self.sum_depth += other.sum_depth;
        self.max_spread_percent = self.max_spread_percent.max(other.max_spread_percent);
        if other.last_updated > self.last_updated {
            self.last_updated = other.last_updated;
        }
    }
}

/// One `(dayOfWeek, hour)` bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapCell {
    pub id: String,
    pub event_count: u64,
    pub avg_spread_percent: f64,
    pub max_spread_percent: f64,
    pub direction_bias: BTreeMap<String, u64>,
    pub volatility_score: f64,
}

impl HeatmapCell {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_count: 0,
            avg_spread_percent: 0.0,
            max_spread_percent: f64::NEG_INFINITY,
            direction_bias: BTreeMap::new(),
            volatility_score: 0.0,
        }
    }

    /// Incremental weighted-mean upsert.
    pub fn apply_event(&mut self, spread_percent: f64, direction: &str) {
        let new_count = self.event_count + 1;
        self.avg_spread_percent =
            (self.avg_spread_percent * self.event_count as f64 + spread_percent) / new_count as f64;
        self.event_count = new_count;
        self.max_spread_percent = self.max_spread_percent.max(spread_percent);
        *self.direction_bias.entry(direction.to_string()).or_insert(0) += 1;
    }

    /// Merge two independently-accumulated cells with weighted-mean averaging.
    pub fn merge(&mut self, other: &HeatmapCell) {
        let total = self.event_count + other.event_count;
        if total == 0 {
            return;
        }
        self.avg_spread_percent = (self.avg_spread_percent * self.event_count as f64
            + other.avg_spread_percent * other.event_count as f64)
            / total as f64;
        self.max_spread_percent = self.max_spread_percent.max(other.max_spread_percent);
        for (k, v) in &other.direction_bias {
            *self.direction_bias.entry(k.clone()).or_insert(0) += v;
        }
        self.event_count = total;
    }
}

/// Activity-zone classification of an hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityZone {
    LowActivity,
    Normal,
    HighActivity,
}

impl ActivityZone {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            ActivityZone::HighActivity
        } else if score >= 0.4 {
            ActivityZone::Normal
        } else {
            ActivityZone::LowActivity
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityZone::HighActivity => "high_activity",
            ActivityZone::Normal => "normal",
            ActivityZone::LowActivity => "low_activity",
        }
    }
}

/// One asset's free balance on one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub exchange: String,
    pub asset: String,
    pub free: Decimal,
}

/// Normalized deviation of one asset's balance on one exchange from its
/// mean across all tracked exchanges, clamped to `[-1, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryDeviation {
    pub asset: String,
    pub exchange: String,
    pub deviation: Decimal,
}

/// Order lifecycle status reported by an `ExchangeClient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
    Rejected,
}

impl OrderStatus {
    pub fn is_filled_at_all(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }
}

/// Response to an order placement/status call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: OrderStatus,
    pub original_qty: Decimal,
    pub executed_qty: Decimal,
    pub price: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Maker/taker fee pair for one exchange.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker: Decimal,
    pub taker: Decimal,
}

/// Process-wide, persisted configuration/toggle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    pub is_sandbox_mode: bool,
    pub is_auto_trade_enabled: bool,
    pub is_auto_rebalance_enabled: bool,
    pub min_profit_threshold: f64,
    pub is_smart_strategy_enabled: bool,
    pub safe_balance_multiplier: f64,
    pub use_taker_fees: bool,
    pub pair_thresholds: BTreeMap<String, f64>,
    pub max_drawdown_usd: f64,
    pub max_consecutive_losses: u32,
    pub is_safety_kill_switch_triggered: bool,
    pub kill_switch_reason: Option<String>,
    pub min_rebalance_skew_threshold: f64,
    pub wallet_overrides: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            is_sandbox_mode: true,
            is_auto_trade_enabled: false,
            is_auto_rebalance_enabled: false,
            min_profit_threshold: 0.10,
            is_smart_strategy_enabled: true,
            safe_balance_multiplier: 0.5,
            use_taker_fees: true,
            pair_thresholds: BTreeMap::new(),
            max_drawdown_usd: 500.0,
            max_consecutive_losses: 5,
            is_safety_kill_switch_triggered: false,
            kill_switch_reason: None,
            min_rebalance_skew_threshold: 0.10,
            wallet_overrides: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn pair_symbol_and_render() {
        let p = TradingPair::new("BTC", "USD");
        assert_eq!(p.symbol(), "BTC-USD");
        assert_eq!(p.render_for("binance"), "BTCUSD");
        assert_eq!(p.render_for("coinbase"), "BTC-USD");
    }

    #[test]
    fn snapshot_consistency() {
        let now = Utc::now();
        let good = OrderBookSnapshot::new(
            "binance",
            "BTCUSD",
            vec![(dec!(100), dec!(1))],
            vec![(dec!(101), dec!(1))],
            now,
        );
        assert!(good.is_consistent());

        let bad = OrderBookSnapshot::new(
            "binance",
            "BTCUSD",
            vec![(dec!(101), dec!(1))],
            vec![(dec!(100), dec!(1))],
            now,
        );
        assert!(!bad.is_consistent());
    }

    #[test]
    fn staleness() {
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let snap = OrderBookSnapshot::new("binance", "BTCUSD", vec![], vec![], old);
        assert!(snap.is_stale(Utc::now(), 500));
    }

    #[test]
    fn heatmap_weighted_mean() {
        let mut cell = HeatmapCell::new("Mon-12");
        cell.apply_event(1.0, "B→C");
        cell.apply_event(3.0, "B→C");
        assert!((cell.avg_spread_percent - 2.0).abs() < 1e-9);
        assert_eq!(cell.event_count, 2);
        assert_eq!(cell.max_spread_percent, 3.0);
    }

    #[test]
    fn heatmap_merge_matches_sequential_apply() {
        let mut sequential = HeatmapCell::new("Mon-12");
        for v in [1.0, 3.0, 5.0, 2.0] {
            sequential.apply_event(v, "B→C");
        }

        let mut a = HeatmapCell::new("Mon-12");
        a.apply_event(1.0, "B→C");
        a.apply_event(3.0, "B→C");
        let mut b = HeatmapCell::new("Mon-12");
        b.apply_event(5.0, "B→C");
        b.apply_event(2.0, "B→C");
        a.merge(&b);

        assert!((a.avg_spread_percent - sequential.avg_spread_percent).abs() < 1e-9);
        assert_eq!(a.event_count, sequential.event_count);
    }

    #[test]
    fn aggregated_metric_merge_sums_and_maxes() {
        let now = Utc::now();
        let mut a = AggregatedMetric::new(MetricCategory::Pair, "BTC-USD", now);
        a.apply_event(1.0, 10.0, 10.0, now);
        let mut b = AggregatedMetric::new(MetricCategory::Pair, "BTC-USD", now);
        b.apply_event(3.0, 20.0, 20.0, now);
        a.merge(&b);
        assert_eq!(a.event_count, 2);
        assert!((a.sum_spread_percent - 4.0).abs() < 1e-9);
        assert_eq!(a.max_spread_percent, 3.0);
    }

    #[test]
    fn activity_zone_thresholds() {
        assert_eq!(ActivityZone::from_score(0.75), ActivityZone::HighActivity);
        assert_eq!(ActivityZone::from_score(0.5), ActivityZone::Normal);
        assert_eq!(ActivityZone::from_score(0.1), ActivityZone::LowActivity);
    }
}
