//! Inventory/drawdown safety supervisor (spec.md §4.M). Runs on a 30s
//! timer; inspects recent transactions for either a run of all-failed/
//! partial outcomes or a 24h realized-profit drawdown past the configured
//! limit, and trips the persisted kill-switch when either fires. Grounded
//! in the teacher's `risk.rs` — a standalone supervisor that reads recent
//! outcomes and flips a shared gate rather than intercepting each trade
//! itself.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::broadcast::BroadcastHub;
use crate::models::TransactionStatus;
use crate::persistence::StatePersistence;
use crate::stats::EventStore;

const DRAWDOWN_WINDOW_HOURS: i64 = 24;

pub struct SafetyMonitor {
    store: Arc<EventStore>,
    state: Arc<StatePersistence>,
    broadcast: Arc<BroadcastHub>,
}

impl SafetyMonitor {
    pub fn new(store: Arc<EventStore>, state: Arc<StatePersistence>, broadcast: Arc<BroadcastHub>) -> Self {
        Self { store, state, broadcast }
    }

    /// Long-lived task: ticks every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        warn!(error = %e, "safety monitor tick failed");
                    }
                }
            }
        }
    }

    /// One evaluation pass, callable directly in tests. Returns `Ok(true)`
    /// iff this call tripped the kill-switch.
    pub fn tick(&self) -> anyhow::Result<bool> {
        let app_state = self.state.read();
        if !app_state.is_auto_trade_enabled || app_state.is_safety_kill_switch_triggered {
            return Ok(false);
        }

        if let Some(reason) = self.consecutive_loss_reason(app_state.max_consecutive_losses)? {
            self.trip(&reason);
            return Ok(true);
        }

        if let Some(reason) = self.drawdown_reason(app_state.max_drawdown_usd)? {
            self.trip(&reason);
            return Ok(true);
        }

        Ok(false)
    }

    /// Trips iff the last `max_consecutive_losses` transactions are *all*
    /// `Failed` or `OneSidedFill` (the spec's "Partial" outcome).
    fn consecutive_loss_reason(&self, max_consecutive_losses: u32) -> anyhow::Result<Option<String>> {
        let n = max_consecutive_losses as usize;
        if n == 0 {
            return Ok(None);
        }
        let recent = self.store.recent_transactions(n)?;
        if recent.len() < n {
            return Ok(None);
        }
        let all_losses = recent
            .iter()
            .all(|tx| matches!(tx.status, TransactionStatus::Failed | TransactionStatus::OneSidedFill));
        if all_losses {
            Ok(Some(format!(
                "{n} consecutive failed/one-sided-fill transactions"
            )))
        } else {
            Ok(None)
        }
    }

    fn drawdown_reason(&self, max_drawdown_usd: f64) -> anyhow::Result<Option<String>> {
        let cutoff = Utc::now() - ChronoDuration::hours(DRAWDOWN_WINDOW_HOURS);
        let recent = self.store.recent_transactions(1000)?;
        let drawdown: Decimal = recent
            .iter()
            .filter(|tx| tx.timestamp >= cutoff && tx.status == TransactionStatus::Success)
            .map(|tx| tx.realized_profit)
            .sum();

        let limit = Decimal::from_f64_retain(max_drawdown_usd).unwrap_or(Decimal::ZERO);
        if drawdown < -limit {
            Ok(Some(format!(
                "24h realized profit {drawdown} below -{max_drawdown_usd} drawdown limit"
            )))
        } else {
            Ok(None)
        }
    }

    fn trip(&self, reason: &str) {
        error!(reason, "safety kill-switch tripped");
        let _ = self.state.update(|s| {
            s.is_safety_kill_switch_triggered = true;
            s.kill_switch_reason = Some(reason.to_string());
            s.is_auto_trade_enabled = false;
        });
        self.broadcast.publish(
            "ReceiveSafetyUpdate",
            &serde_json::json!({ "killSwitchTriggered": true, "reason": reason }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStrategy, OrderStatus, Transaction, TransactionType};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn monitor() -> (SafetyMonitor, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let state = Arc::new(StatePersistence::load(dir.path().join("appstate.json")));
        state.update(|s| s.is_auto_trade_enabled = true).unwrap();
        let broadcast = Arc::new(BroadcastHub::new());
        (SafetyMonitor::new(store, state, broadcast), dir)
    }

    fn failed_tx(profit: Decimal, status: TransactionStatus) -> Transaction {
        Transaction {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            r#type: TransactionType::Arbitrage,
            asset: "BTC".to_string(),
            pair: "BTC-USD".to_string(),
            amount: dec!(0),
            buy_exchange: "A".to_string(),
            sell_exchange: "B".to_string(),
            buy_order_id: None,
            sell_order_id: None,
            buy_order_status: OrderStatus::Failed,
            sell_order_status: OrderStatus::Failed,
            recovery_order_id: None,
            strategy: ExecutionStrategy::Sequential,
            buy_cost: dec!(0),
            sell_proceeds: dec!(0),
            total_fees: dec!(0),
            realized_profit: profit,
            status,
            is_recovered: false,
        }
    }

    #[test]
    fn consecutive_failures_trip_kill_switch() {
        let (monitor, _dir) = monitor();
        monitor.state.update(|s| s.max_consecutive_losses = 3).unwrap();
        for _ in 0..3 {
            monitor
                .store
                .insert_transaction(&failed_tx(dec!(0), TransactionStatus::Failed))
                .unwrap();
        }
        assert!(monitor.tick().unwrap());
        assert!(monitor.state.read().is_safety_kill_switch_triggered);
        assert!(!monitor.state.read().is_auto_trade_enabled);
    }

    #[test]
    fn one_success_breaks_the_losing_streak() {
        let (monitor, _dir) = monitor();
        monitor.state.update(|s| s.max_consecutive_losses = 3).unwrap();
        monitor.store.insert_transaction(&failed_tx(dec!(0), TransactionStatus::Failed)).unwrap();
        monitor.store.insert_transaction(&failed_tx(dec!(50), TransactionStatus::Success)).unwrap();
        monitor.store.insert_transaction(&failed_tx(dec!(0), TransactionStatus::Failed)).unwrap();
        assert!(!monitor.tick().unwrap());
    }

    #[test]
    fn drawdown_past_limit_trips_kill_switch() {
        let (monitor, _dir) = monitor();
        monitor.state.update(|s| s.max_drawdown_usd = 100.0).unwrap();
        monitor
            .store
            .insert_transaction(&failed_tx(dec!(-150), TransactionStatus::Success))
            .unwrap();
        assert!(monitor.tick().unwrap());
    }

    #[test]
    fn kill_switch_already_tripped_short_circuits() {
        let (monitor, _dir) = monitor();
        monitor.state.update(|s| s.is_safety_kill_switch_triggered = true).unwrap();
        assert!(!monitor.tick().unwrap());
    }
}
