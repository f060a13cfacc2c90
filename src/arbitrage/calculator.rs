//! Order-book walk and fee-aware net-profit calculation (spec.md §4.E).
//! Pure — no channel or I/O dependency, so the detector and its tests can
//! drive it directly against hand-built books. Grounded in the teacher's
//! `arbitrage/engine.rs` walk-the-book loop and `arbitrage/fees.rs` maker/
//! taker selection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{ArbitrageOpportunity, FeeSchedule, Level, OpportunityStatus, OrderBookSnapshot};

/// `netProfitPct` below this is noise, never worth emitting at all.
const NOISE_FLOOR_PCT: f64 = -1.0;

/// Per-exchange balance available to cap tradable volume when
/// `safe_balance_multiplier` is engaged.
#[derive(Debug, Clone, Copy)]
pub struct BalanceCap {
    pub quote_balance: Decimal,
    pub base_balance: Decimal,
}

pub struct ArbitrageCalculator;

impl ArbitrageCalculator {
    /// Runs the calculation for the single best cross-exchange pair (lowest
    /// best ask vs. highest best bid) across whatever exchanges currently
    /// have a book for the symbol. Returns `None` if there's no tradeable
    /// cross-exchange pair, either book is empty, or the result falls below
    /// the noise floor.
    ///
    /// This only ever considers the single globally-best pair; with three or
    /// more quoting exchanges it will miss profitable non-best ordered pairs.
    /// Callers that need every `(buyEx, sellEx)` pair per spec.md §4.F.3
    /// should use [`Self::calculate_pair`] directly over each two-exchange
    /// combination instead.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate(
        symbol: &str,
        books: &HashMap<String, OrderBookSnapshot>,
        fees: &HashMap<String, FeeSchedule>,
        use_taker_fees: bool,
        safe_balance_multiplier: Option<f64>,
        balance_caps: &HashMap<String, BalanceCap>,
        is_sandbox: bool,
        now: DateTime<Utc>,
    ) -> Option<ArbitrageOpportunity> {
        let best_buy = select_best_ask(books)?;
        let best_sell = select_best_bid(books)?;
        if best_buy == best_sell {
            return None;
        }

        let buy_book = books.get(&best_buy)?;
        let sell_book = books.get(&best_sell)?;

        Self::calculate_pair(
            symbol,
            &best_buy,
            buy_book,
            &best_sell,
            sell_book,
            fees,
            use_taker_fees,
            safe_balance_multiplier,
            balance_caps,
            is_sandbox,
            now,
        )
    }

    /// Runs the calculation for one specific ordered `(buyEx, sellEx)` pair,
    /// as spec.md §4.F.3 requires invoking once per ordered pair rather than
    /// only the globally-best one. Returns `None` if either book is empty,
    /// nothing fills, or the result falls below the noise floor.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_pair(
        symbol: &str,
        buy_exchange: &str,
        buy_book: &OrderBookSnapshot,
        sell_exchange: &str,
        sell_book: &OrderBookSnapshot,
        fees: &HashMap<String, FeeSchedule>,
        use_taker_fees: bool,
        safe_balance_multiplier: Option<f64>,
        balance_caps: &HashMap<String, BalanceCap>,
        is_sandbox: bool,
        now: DateTime<Utc>,
    ) -> Option<ArbitrageOpportunity> {
        let best_ask_price = buy_book.asks.first()?.0;

        let total_ask_liquidity: Decimal = buy_book.asks.iter().map(|(_, q)| *q).sum();
        let total_bid_liquidity: Decimal = sell_book.bids.iter().map(|(_, q)| *q).sum();
        let mut max_volume = total_ask_liquidity.min(total_bid_liquidity);

        if let Some(multiplier) = safe_balance_multiplier {
            let multiplier = Decimal::from_f64_retain(multiplier).unwrap_or(Decimal::ONE);
            if let Some(cap) = balance_caps.get(buy_exchange) {
                let buy_side_cap = cap.quote_balance / best_ask_price;
                max_volume = max_volume.min(multiplier * buy_side_cap);
            }
            if let Some(cap) = balance_caps.get(sell_exchange) {
                max_volume = max_volume.min(multiplier * cap.base_balance);
            }
        }
        max_volume = max_volume.round_dp(8);
        if max_volume <= Decimal::ZERO {
            return None;
        }

        let (buy_cost, buy_filled) = walk_asks(&buy_book.asks, max_volume);
        if buy_filled <= Decimal::ZERO {
            return None;
        }
        let avg_buy_price = buy_cost / buy_filled;

        let (sell_proceeds, sell_filled) = walk_bids(&sell_book.bids, buy_filled);
        if sell_filled <= Decimal::ZERO {
            return None;
        }
        let avg_sell_price = sell_proceeds / sell_filled;
        let filled = buy_filled.min(sell_filled);

        let default_fees = FeeSchedule {
            maker: Decimal::ZERO,
            taker: Decimal::ZERO,
        };
        let buy_fee_sched = fees.get(buy_exchange).copied().unwrap_or(default_fees);
        let sell_fee_sched = fees.get(sell_exchange).copied().unwrap_or(default_fees);
        let buy_fee_rate = if use_taker_fees { buy_fee_sched.taker } else { buy_fee_sched.maker };
        let sell_fee_rate = if use_taker_fees { sell_fee_sched.taker } else { sell_fee_sched.maker };

        let gross_pct = ((avg_sell_price - avg_buy_price) / avg_buy_price * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0);
        let net_pct = gross_pct - buy_fee_rate.to_f64().unwrap_or(0.0) * 100.0
            - sell_fee_rate.to_f64().unwrap_or(0.0) * 100.0;

        if net_pct < NOISE_FLOOR_PCT {
            return None;
        }

        Some(ArbitrageOpportunity {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            buy_exchange: buy_exchange.to_string(),
            sell_exchange: sell_exchange.to_string(),
            avg_buy_price,
            avg_sell_price,
            buy_depth: total_ask_liquidity,
            sell_depth: total_bid_liquidity,
            volume: filled,
            buy_fee: buy_fee_rate,
            sell_fee: sell_fee_rate,
            gross_profit_pct: gross_pct,
            net_profit_pct: net_pct,
            is_sandbox,
            timestamp: now,
            status: OpportunityStatus::Detected,
        })
    }
}

/// Lowest best ask across exchanges. Ties broken by larger top-level
/// quantity, then lexicographic exchange name, for deterministic tests.
fn select_best_ask(books: &HashMap<String, OrderBookSnapshot>) -> Option<String> {
    let mut candidates: Vec<(&String, Decimal, Decimal)> = books
        .iter()
        .filter_map(|(ex, book)| book.asks.first().map(|(p, q)| (ex, *p, *q)))
        .collect();
    candidates.sort_by(|(ex_a, price_a, qty_a), (ex_b, price_b, qty_b)| {
        price_a
            .cmp(price_b)
            .then_with(|| qty_b.cmp(qty_a))
            .then_with(|| ex_a.cmp(ex_b))
    });
    candidates.first().map(|(ex, _, _)| (*ex).clone())
}

/// Highest best bid across exchanges, same tie-break shape as the ask side.
fn select_best_bid(books: &HashMap<String, OrderBookSnapshot>) -> Option<String> {
    let mut candidates: Vec<(&String, Decimal, Decimal)> = books
        .iter()
        .filter_map(|(ex, book)| book.bids.first().map(|(p, q)| (ex, *p, *q)))
        .collect();
    candidates.sort_by(|(ex_a, price_a, qty_a), (ex_b, price_b, qty_b)| {
        price_b
            .cmp(price_a)
            .then_with(|| qty_b.cmp(qty_a))
            .then_with(|| ex_a.cmp(ex_b))
    });
    candidates.first().map(|(ex, _, _)| (*ex).clone())
}

/// Walks ascending-price ask levels until `target` quantity has been
/// accumulated (or the book runs out). Returns `(total_cost, filled_qty)`.
fn walk_asks(levels: &[Level], target: Decimal) -> (Decimal, Decimal) {
    let mut remaining = target;
    let mut cost = Decimal::ZERO;
    let mut filled = Decimal::ZERO;
    for (price, qty) in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = (*qty).min(remaining);
        cost += take * price;
        filled += take;
        remaining -= take;
    }
    (cost, filled)
}

/// Walks descending-price bid levels until `target` quantity has been
/// matched (or the book runs out). Returns `(total_proceeds, filled_qty)`.
fn walk_bids(levels: &[Level], target: Decimal) -> (Decimal, Decimal) {
    let mut remaining = target;
    let mut proceeds = Decimal::ZERO;
    let mut filled = Decimal::ZERO;
    for (price, qty) in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = (*qty).min(remaining);
        proceeds += take * price;
        filled += take;
        remaining -= take;
    }
    (proceeds, filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(exchange: &str, bids: Vec<Level>, asks: Vec<Level>) -> OrderBookSnapshot {
        OrderBookSnapshot::new(exchange, "BTC-USD", bids, asks, Utc::now())
    }

    fn fee(rate: Decimal) -> FeeSchedule {
        FeeSchedule { maker: rate, taker: rate }
    }

    #[test]
    fn picks_lowest_ask_and_highest_bid() {
        let mut books = HashMap::new();
        books.insert("A".to_string(), book("A", vec![(dec!(49900), dec!(1))], vec![(dec!(50000), dec!(1))]));
        books.insert("B".to_string(), book("B", vec![(dec!(51000), dec!(1))], vec![(dec!(50200), dec!(1))]));

        let mut fees = HashMap::new();
        fees.insert("A".to_string(), fee(dec!(0.001)));
        fees.insert("B".to_string(), fee(dec!(0.001)));

        let opp = ArbitrageCalculator::calculate("BTC-USD", &books, &fees, true, None, &HashMap::new(), true, Utc::now())
            .expect("opportunity");
        assert_eq!(opp.buy_exchange, "A");
        assert_eq!(opp.sell_exchange, "B");
        assert_eq!(opp.avg_buy_price, dec!(50000));
        assert_eq!(opp.avg_sell_price, dec!(51000));
    }

    #[test]
    fn same_best_exchange_yields_no_opportunity() {
        let mut books = HashMap::new();
        books.insert("A".to_string(), book("A", vec![(dec!(50100), dec!(1))], vec![(dec!(50000), dec!(1))]));
        let fees = HashMap::new();
        assert!(ArbitrageCalculator::calculate("BTC-USD", &books, &fees, true, None, &HashMap::new(), true, Utc::now()).is_none());
    }

    #[test]
    fn net_profit_below_noise_floor_is_discarded() {
        let mut books = HashMap::new();
        books.insert("A".to_string(), book("A", vec![(dec!(100), dec!(1))], vec![(dec!(100), dec!(1))]));
        books.insert("B".to_string(), book("B", vec![(dec!(101), dec!(1))], vec![(dec!(98), dec!(1))]));
        let mut fees = HashMap::new();
        fees.insert("A".to_string(), fee(dec!(0.05)));
        fees.insert("B".to_string(), fee(dec!(0.05)));
        assert!(ArbitrageCalculator::calculate("BTC-USD", &books, &fees, true, None, &HashMap::new(), true, Utc::now()).is_none());
    }

    #[test]
    fn safe_balance_multiplier_caps_volume() {
        let mut books = HashMap::new();
        books.insert("A".to_string(), book("A", vec![(dec!(49900), dec!(10))], vec![(dec!(50000), dec!(10))]));
        books.insert("B".to_string(), book("B", vec![(dec!(51000), dec!(10))], vec![(dec!(50200), dec!(10))]));
        let mut fees = HashMap::new();
        fees.insert("A".to_string(), fee(dec!(0)));
        fees.insert("B".to_string(), fee(dec!(0)));

        let mut caps = HashMap::new();
        caps.insert(
            "A".to_string(),
            BalanceCap { quote_balance: dec!(5000), base_balance: dec!(1000) },
        );
        caps.insert(
            "B".to_string(),
            BalanceCap { quote_balance: dec!(1000000), base_balance: dec!(1000) },
        );

        let opp = ArbitrageCalculator::calculate(
            "BTC-USD",
            &books,
            &fees,
            true,
            Some(0.5),
            &caps,
            true,
            Utc::now(),
        )
        .expect("opportunity");
        // 0.5 * (5000 / 50000) = 0.05 BTC tradable cap from A's quote balance.
        assert_eq!(opp.volume, dec!(0.05));
    }

    #[test]
    fn tie_break_prefers_larger_quantity_then_name() {
        let mut books = HashMap::new();
        books.insert("B".to_string(), book("B", vec![(dec!(49000), dec!(1))], vec![(dec!(50000), dec!(1))]));
        books.insert("A".to_string(), book("A", vec![(dec!(49000), dec!(1))], vec![(dec!(50000), dec!(5))]));
        books.insert("C".to_string(), book("C", vec![(dec!(51000), dec!(1))], vec![(dec!(52000), dec!(1))]));
        let fees = HashMap::new();
        let opp = ArbitrageCalculator::calculate("BTC-USD", &books, &fees, true, None, &HashMap::new(), true, Utc::now())
            .expect("opportunity");
        assert_eq!(opp.buy_exchange, "A");
    }
}
