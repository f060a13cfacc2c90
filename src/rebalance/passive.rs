//! Consumer of `PassiveRebalanceCh` (spec.md §4.L): accepts sub-threshold
//! but positive opportunities that happen to also improve inventory skew,
//! discounting the required profit floor in proportion to how much the
//! trade helps (spec.md §4.K's "passive-rebalance threshold discount").
//! Grounded in the teacher's `RebalancingService`-adjacent poll/consume
//! split — the poller owns deviations, this owns the discount math and the
//! executor hand-off.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::service::RebalancingService;
use crate::executor::OrderExecutor;
use crate::models::{ArbitrageOpportunity, ExecutionStrategy};
use crate::persistence::StatePersistence;

/// Below this, an opportunity isn't worth executing even as a passive
/// rebalance — matches the detector's own floor for routing here at all.
const ABSOLUTE_FLOOR_PCT: f64 = 0.01;

/// Deviation magnitude beyond which a side is considered to "help" or to
/// be "desperate" for the discount rules below.
const DEVIATION_HELP_THRESHOLD: f64 = 0.10;

/// Scales how much of the computed incentive is subtracted from the
/// user's threshold to form the discounted profit floor.
const INCENTIVE_DISCOUNT_RATE: f64 = 0.4;

const DISCOUNTED_FLOOR_MIN_PCT: f64 = 0.05;

pub struct PassiveRebalancer {
    rebalancing: Arc<RebalancingService>,
    executor: Arc<OrderExecutor>,
    state: Arc<StatePersistence>,
    passive_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ArbitrageOpportunity>>,
}

impl PassiveRebalancer {
    pub fn new(
        rebalancing: Arc<RebalancingService>,
        executor: Arc<OrderExecutor>,
        state: Arc<StatePersistence>,
        passive_rx: mpsc::UnboundedReceiver<ArbitrageOpportunity>,
    ) -> Self {
        Self {
            rebalancing,
            executor,
            state,
            passive_rx: tokio::sync::Mutex::new(passive_rx),
        }
    }

    /// Long-lived task: drains `PassiveRebalanceCh` until cancelled or the
    /// channel closes.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.passive_rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                opp = rx.recv() => {
                    match opp {
                        Some(opp) => self.handle(opp, &cancel).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle(&self, opportunity: ArbitrageOpportunity, cancel: &CancellationToken) {
        let app_state = self.state.read();
        if app_state.is_safety_kill_switch_triggered || !app_state.is_auto_trade_enabled {
            return;
        }
        if opportunity.net_profit_pct < ABSOLUTE_FLOOR_PCT {
            return;
        }

        let asset = base_asset(&opportunity.symbol);
        let sell_dev = self
            .rebalancing
            .get_deviation(&asset, &opportunity.sell_exchange)
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0);
        let buy_dev = self
            .rebalancing
            .get_deviation(&asset, &opportunity.buy_exchange)
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0);

        let Some(incentive) = incentive_score(sell_dev, buy_dev) else {
            return;
        };

        let floor = discounted_floor(app_state.min_profit_threshold, incentive);
        if opportunity.net_profit_pct < floor {
            return;
        }

        info!(
            symbol = %opportunity.symbol,
            asset,
            incentive,
            floor,
            net_pct = opportunity.net_profit_pct,
            "passive rebalance opportunity accepted"
        );
        self.executor
            .execute(&opportunity, floor, ExecutionStrategy::Sequential, cancel)
            .await;
    }
}

/// `sellDev`/`buyDev` are the N-exchange deviations of the traded asset on
/// each leg's exchange. Returns `None` when neither side clears the help
/// threshold (no incentive at all).
fn incentive_score(sell_dev: f64, buy_dev: f64) -> Option<f64> {
    if sell_dev > DEVIATION_HELP_THRESHOLD && buy_dev < -DEVIATION_HELP_THRESHOLD {
        Some(sell_dev + buy_dev.abs())
    } else if sell_dev > 2.0 * DEVIATION_HELP_THRESHOLD {
        Some(sell_dev)
    } else {
        None
    }
}

fn discounted_floor(user_threshold: f64, incentive: f64) -> f64 {
    (user_threshold - INCENTIVE_DISCOUNT_RATE * incentive).max(DISCOUNTED_FLOOR_MIN_PCT)
}

fn base_asset(symbol: &str) -> String {
    symbol.split('-').next().unwrap_or(symbol).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_helping_sums_incentive() {
        let incentive = incentive_score(0.15, -0.12).unwrap();
        assert!((incentive - 0.27).abs() < 1e-9);
    }

    #[test]
    fn desperate_unload_uses_sell_dev_alone() {
        let incentive = incentive_score(0.25, 0.0).unwrap();
        assert_eq!(incentive, 0.25);
    }

    #[test]
    fn balanced_inventory_has_no_incentive() {
        assert!(incentive_score(0.05, -0.05).is_none());
    }

    #[test]
    fn discounted_floor_never_drops_below_minimum() {
        let floor = discounted_floor(0.10, 5.0);
        assert_eq!(floor, DISCOUNTED_FLOOR_MIN_PCT);
    }

    #[test]
    fn discounted_floor_scales_with_incentive() {
        let floor = discounted_floor(0.50, 0.27);
        assert!((floor - (0.50 - 0.4 * 0.27)).abs() < 1e-9);
    }
}
