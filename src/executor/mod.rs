//! Order execution engine (spec.md §4.H): preflight checks, Sequential and
//! Concurrent strategies, partial-fill propagation, and the one-sided-fill
//! recovery protocol. Grounded in the teacher's `vault/trade_executor.rs`
//! two-leg dispatch and `risk.rs` preflight-gate ordering.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::book_provider::BookProvider;
use crate::broadcast::BroadcastHub;
use crate::exchange_client::ExchangeClient;
use crate::models::{
    ArbitrageOpportunity, ExecutionStrategy, OrderStatus, Transaction, TransactionStatus, TransactionType,
};
use crate::persistence::StatePersistence;

/// Fallback fee rate applied to a leg when the exchange reports zero fee.
const FALLBACK_FEE_RATE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

const STALENESS_MS: i64 = 500;

pub struct OrderExecutor {
    clients: HashMap<String, Arc<dyn ExchangeClient>>,
    providers: HashMap<String, Arc<dyn BookProvider>>,
    state: Arc<StatePersistence>,
    broadcast: Arc<BroadcastHub>,
    transaction_tx: tokio::sync::mpsc::UnboundedSender<Transaction>,
}

impl OrderExecutor {
    pub fn new(
        clients: HashMap<String, Arc<dyn ExchangeClient>>,
        providers: HashMap<String, Arc<dyn BookProvider>>,
        state: Arc<StatePersistence>,
        broadcast: Arc<BroadcastHub>,
        transaction_tx: tokio::sync::mpsc::UnboundedSender<Transaction>,
    ) -> Self {
        Self {
            clients,
            providers,
            state,
            broadcast,
            transaction_tx,
        }
    }

    /// Executes `opportunity` under `strategy` if, and only if, it clears
    /// every preflight check. Returns `true` iff the trade completed as a
    /// clean two-leg `Success`.
    pub async fn execute(
        &self,
        opportunity: &ArbitrageOpportunity,
        min_profit_threshold: f64,
        strategy: ExecutionStrategy,
        ctx: &CancellationToken,
    ) -> bool {
        if ctx.is_cancelled() {
            return false;
        }

        if self.state.read().is_safety_kill_switch_triggered {
            info!(symbol = %opportunity.symbol, "trade aborted: kill-switch active");
            return false;
        }

        if self.is_stale(opportunity) {
            warn!(symbol = %opportunity.symbol, "Trade aborted: Stale data");
            return false;
        }

        let effective_threshold = match self.recheck_slippage(opportunity, min_profit_threshold).await {
            Some(false) => {
                info!(symbol = %opportunity.symbol, "trade aborted: slippage below threshold");
                return false;
            }
            _ => min_profit_threshold,
        };
        let _ = effective_threshold;

        let transaction = match strategy {
            ExecutionStrategy::Sequential => self.execute_sequential(opportunity).await,
            ExecutionStrategy::Concurrent => self.execute_concurrent(opportunity).await,
        };

        let success = transaction.status == TransactionStatus::Success;
        let _ = self.transaction_tx.send(transaction.clone());
        self.broadcast.publish("ReceiveTransaction", &transaction);
        success
    }

    fn is_stale(&self, opportunity: &ArbitrageOpportunity) -> bool {
        let now = Utc::now();
        for exchange in [&opportunity.buy_exchange, &opportunity.sell_exchange] {
            if let Some(provider) = self.providers.get(exchange) {
                if let Some(book) = provider.get_order_book(&opportunity.symbol) {
                    if book.is_stale(now, STALENESS_MS) {
                        return true;
                    }
                } else {
                    return true;
                }
            }
        }
        false
    }

    /// Queries current top-of-book prices and recomputes the spread.
    /// Returns `Some(false)` to abort, `Some(true)`/`None` to proceed
    /// (unavailable prices proceed with a warning, per spec.md §4.H).
    async fn recheck_slippage(&self, opportunity: &ArbitrageOpportunity, min_profit_threshold: f64) -> Option<bool> {
        let buy_client = self.clients.get(&opportunity.buy_exchange)?;
        let sell_client = self.clients.get(&opportunity.sell_exchange)?;

        let buy_price = match buy_client.get_price(&opportunity.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "slippage recheck: buy price unavailable, proceeding");
                return None;
            }
        };
        let sell_price = match sell_client.get_price(&opportunity.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "slippage recheck: sell price unavailable, proceeding");
                return None;
            }
        };

        if buy_price <= Decimal::ZERO {
            return None;
        }
        let spread_pct = ((sell_price - buy_price) / buy_price * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0);
        Some(spread_pct >= min_profit_threshold)
    }

    async fn execute_sequential(&self, opportunity: &ArbitrageOpportunity) -> Transaction {
        let buy_client = self.clients.get(&opportunity.buy_exchange);
        let sell_client = self.clients.get(&opportunity.sell_exchange);
        let (Some(buy_client), Some(sell_client)) = (buy_client, sell_client) else {
            return self.rejected_transaction(opportunity, ExecutionStrategy::Sequential);
        };

        let buy_resp = match buy_client.place_market_buy(&opportunity.symbol, opportunity.volume).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(error = %e, "buy leg request failed");
                return self.failed_transaction(opportunity, ExecutionStrategy::Sequential, None, None);
            }
        };
        if !buy_resp.status.is_filled_at_all() {
            return self.failed_transaction(opportunity, ExecutionStrategy::Sequential, Some(buy_resp), None);
        }

        let sell_volume = buy_resp.executed_qty;
        let sell_resp = sell_client.place_market_sell(&opportunity.symbol, sell_volume).await;

        match sell_resp {
            Ok(sell_resp) if sell_resp.status.is_filled_at_all() => {
                let filled_qty = sell_resp.executed_qty;
                self.success_transaction(opportunity, ExecutionStrategy::Sequential, buy_resp, sell_resp, filled_qty)
            }
            sell_result => {
                warn!(symbol = %opportunity.symbol, "leg2 failed, attempting recovery");
                let recovery = buy_client.place_market_sell(&opportunity.symbol, sell_volume).await;
                self.recovery_transaction(
                    opportunity,
                    ExecutionStrategy::Sequential,
                    buy_resp,
                    sell_result.ok(),
                    recovery,
                    sell_volume,
                )
            }
        }
    }

    async fn execute_concurrent(&self, opportunity: &ArbitrageOpportunity) -> Transaction {
        let buy_client = self.clients.get(&opportunity.buy_exchange);
        let sell_client = self.clients.get(&opportunity.sell_exchange);
        let (Some(buy_client), Some(sell_client)) = (buy_client, sell_client) else {
            return self.rejected_transaction(opportunity, ExecutionStrategy::Concurrent);
        };

        let (buy_result, sell_result) = tokio::join!(
            buy_client.place_market_buy(&opportunity.symbol, opportunity.volume),
            sell_client.place_market_sell(&opportunity.symbol, opportunity.volume)
        );

        let buy_ok = buy_result.as_ref().map(|r| r.status.is_filled_at_all()).unwrap_or(false);
        let sell_ok = sell_result.as_ref().map(|r| r.status.is_filled_at_all()).unwrap_or(false);

        match (buy_ok, sell_ok) {
            (true, true) => {
                let buy_resp = buy_result.unwrap();
                let sell_resp = sell_result.unwrap();
                let qty = buy_resp.executed_qty.min(sell_resp.executed_qty);
                self.success_transaction(opportunity, ExecutionStrategy::Concurrent, buy_resp, sell_resp, qty)
            }
            (true, false) => {
                let buy_resp = buy_result.unwrap();
                let qty = buy_resp.executed_qty;
                warn!(symbol = %opportunity.symbol, "concurrent sell leg failed, recovering on buy exchange");
                let recovery = buy_client.place_market_sell(&opportunity.symbol, qty).await;
                self.recovery_transaction(
                    opportunity,
                    ExecutionStrategy::Concurrent,
                    buy_resp,
                    sell_result.ok(),
                    recovery,
                    qty,
                )
            }
            (false, true) => {
                let sell_resp = sell_result.unwrap();
                let qty = sell_resp.executed_qty;
                warn!(symbol = %opportunity.symbol, "concurrent buy leg failed, recovering on sell exchange");
                let recovery = sell_client.place_market_buy(&opportunity.symbol, qty).await;
                self.recovery_transaction_sell_side(opportunity, sell_resp, buy_result.ok(), recovery, qty)
            }
            (false, false) => self.failed_transaction(
                opportunity,
                ExecutionStrategy::Concurrent,
                buy_result.ok(),
                sell_result.ok(),
            ),
        }
    }

    fn leg_fee(&self, reported_fee: Decimal, notional: Decimal) -> Decimal {
        if reported_fee > Decimal::ZERO {
            reported_fee
        } else {
            notional * FALLBACK_FEE_RATE
        }
    }

    fn success_transaction(
        &self,
        opportunity: &ArbitrageOpportunity,
        strategy: ExecutionStrategy,
        buy_resp: crate::models::OrderResponse,
        sell_resp: crate::models::OrderResponse,
        qty: Decimal,
    ) -> Transaction {
        let avg_buy = buy_resp.avg_price.unwrap_or(opportunity.avg_buy_price);
        let avg_sell = sell_resp.avg_price.unwrap_or(opportunity.avg_sell_price);
        let buy_cost = avg_buy * qty;
        let sell_proceeds = avg_sell * qty;
        let buy_fee = self.leg_fee(buy_resp.fee, buy_cost);
        let sell_fee = self.leg_fee(sell_resp.fee, sell_proceeds);
        let total_fees = buy_fee + sell_fee;
        let realized_profit = (sell_proceeds - buy_cost) - total_fees;

        info!(symbol = %opportunity.symbol, %realized_profit, "trade succeeded");

        Transaction {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            r#type: TransactionType::Arbitrage,
            asset: base_asset(&opportunity.symbol),
            pair: opportunity.symbol.clone(),
            amount: qty,
            buy_exchange: opportunity.buy_exchange.clone(),
            sell_exchange: opportunity.sell_exchange.clone(),
            buy_order_id: Some(buy_resp.order_id),
            sell_order_id: Some(sell_resp.order_id),
            buy_order_status: buy_resp.status,
            sell_order_status: sell_resp.status,
            recovery_order_id: None,
            strategy,
            buy_cost,
            sell_proceeds,
            total_fees,
            realized_profit,
            status: TransactionStatus::Success,
            is_recovered: false,
        }
    }

    fn recovery_transaction(
        &self,
        opportunity: &ArbitrageOpportunity,
        strategy: ExecutionStrategy,
        buy_resp: crate::models::OrderResponse,
        failed_sell: Option<crate::models::OrderResponse>,
        recovery: Result<crate::models::OrderResponse, anyhow::Error>,
        qty: Decimal,
    ) -> Transaction {
        let (status, recovery_order_id, is_recovered) = match &recovery {
            Ok(r) if r.status == OrderStatus::Filled => {
                (TransactionStatus::Recovered, Some(r.order_id.clone()), true)
            }
            _ => {
                error!(symbol = %opportunity.symbol, "One-Sided Fill (CRITICAL): recovery failed");
                (TransactionStatus::OneSidedFill, None, false)
            }
        };

        Transaction {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            r#type: TransactionType::Arbitrage,
            asset: base_asset(&opportunity.symbol),
            pair: opportunity.symbol.clone(),
            amount: qty,
            buy_exchange: opportunity.buy_exchange.clone(),
            sell_exchange: opportunity.sell_exchange.clone(),
            buy_order_id: Some(buy_resp.order_id),
            sell_order_id: failed_sell.map(|r| r.order_id),
            buy_order_status: buy_resp.status,
            sell_order_status: failed_sell_status(status),
            recovery_order_id,
            strategy,
            buy_cost: Decimal::ZERO,
            sell_proceeds: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
            status,
            is_recovered,
        }
    }

    /// Mirror of `recovery_transaction` for the case where the *sell* leg
    /// succeeded first and the *buy* leg needs recovering (Concurrent mode
    /// can fail on either side).
    fn recovery_transaction_sell_side(
        &self,
        opportunity: &ArbitrageOpportunity,
        sell_resp: crate::models::OrderResponse,
        failed_buy: Option<crate::models::OrderResponse>,
        recovery: Result<crate::models::OrderResponse, anyhow::Error>,
        qty: Decimal,
    ) -> Transaction {
        let (status, recovery_order_id, is_recovered) = match &recovery {
            Ok(r) if r.status == OrderStatus::Filled => {
                (TransactionStatus::Recovered, Some(r.order_id.clone()), true)
            }
            _ => {
                error!(symbol = %opportunity.symbol, "One-Sided Fill (CRITICAL): recovery failed");
                (TransactionStatus::OneSidedFill, None, false)
            }
        };

        Transaction {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            r#type: TransactionType::Arbitrage,
            asset: base_asset(&opportunity.symbol),
            pair: opportunity.symbol.clone(),
            amount: qty,
            buy_exchange: opportunity.buy_exchange.clone(),
            sell_exchange: opportunity.sell_exchange.clone(),
            buy_order_id: failed_buy.map(|r| r.order_id),
            sell_order_id: Some(sell_resp.order_id),
            buy_order_status: failed_sell_status(status),
            sell_order_status: sell_resp.status,
            recovery_order_id,
            strategy: ExecutionStrategy::Concurrent,
            buy_cost: Decimal::ZERO,
            sell_proceeds: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
            status,
            is_recovered,
        }
    }

    fn failed_transaction(
        &self,
        opportunity: &ArbitrageOpportunity,
        strategy: ExecutionStrategy,
        buy_resp: Option<crate::models::OrderResponse>,
        sell_resp: Option<crate::models::OrderResponse>,
    ) -> Transaction {
        Transaction {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            r#type: TransactionType::Arbitrage,
            asset: base_asset(&opportunity.symbol),
            pair: opportunity.symbol.clone(),
            amount: Decimal::ZERO,
            buy_exchange: opportunity.buy_exchange.clone(),
            sell_exchange: opportunity.sell_exchange.clone(),
            buy_order_id: buy_resp.as_ref().map(|r| r.order_id.clone()),
            sell_order_id: sell_resp.as_ref().map(|r| r.order_id.clone()),
            buy_order_status: buy_resp.map(|r| r.status).unwrap_or(OrderStatus::Failed),
            sell_order_status: sell_resp.map(|r| r.status).unwrap_or(OrderStatus::Failed),
            recovery_order_id: None,
            strategy,
            buy_cost: Decimal::ZERO,
            sell_proceeds: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
            status: TransactionStatus::Failed,
            is_recovered: false,
        }
    }

    fn rejected_transaction(&self, opportunity: &ArbitrageOpportunity, strategy: ExecutionStrategy) -> Transaction {
        warn!(symbol = %opportunity.symbol, "trade rejected: unknown exchange client");
        self.failed_transaction(opportunity, strategy, None, None)
    }
}

fn failed_sell_status(status: TransactionStatus) -> OrderStatus {
    match status {
        TransactionStatus::Recovered => OrderStatus::Cancelled,
        _ => OrderStatus::Failed,
    }
}

fn base_asset(symbol: &str) -> String {
    symbol.split('-').next().unwrap_or(symbol).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book_provider::SandboxBookProvider;
    use crate::exchange_client::sandbox_state::PriceOracle;
    use crate::exchange_client::{SandboxExchangeClient, SandboxState};
    use crate::models::OpportunityStatus;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    struct FixedOracle(Decimal);
    #[async_trait]
    impl PriceOracle for FixedOracle {
        async fn price(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            Ok(self.0)
        }
    }

    fn opportunity(volume: Decimal) -> ArbitrageOpportunity {
        ArbitrageOpportunity {
            id: "opp-1".to_string(),
            symbol: "BTC-USD".to_string(),
            buy_exchange: "A".to_string(),
            sell_exchange: "B".to_string(),
            avg_buy_price: dec!(50000),
            avg_sell_price: dec!(51000),
            buy_depth: dec!(10),
            sell_depth: dec!(10),
            volume,
            buy_fee: dec!(0.001),
            sell_fee: dec!(0.001),
            gross_profit_pct: 2.0,
            net_profit_pct: 1.8,
            is_sandbox: true,
            timestamp: Utc::now(),
            status: OpportunityStatus::Detected,
        }
    }

    fn executor_with_books(a_mid: Decimal, b_mid: Decimal) -> (OrderExecutor, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let state = Arc::new(StatePersistence::load(dir.path().join("appstate.json")));
        let broadcast = Arc::new(BroadcastHub::new());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let a_book = SandboxBookProvider::new("A");
        a_book.seed("BTC-USD", a_mid, dec!(0), 3, dec!(100), dec!(1));
        let b_book = SandboxBookProvider::new("B");
        b_book.seed("BTC-USD", b_mid, dec!(0), 3, dec!(100), dec!(1));

        let mut providers: HashMap<String, Arc<dyn BookProvider>> = HashMap::new();
        providers.insert("A".to_string(), a_book.clone());
        providers.insert("B".to_string(), b_book.clone());

        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        clients.insert(
            "A".to_string(),
            Arc::new(SandboxExchangeClient::new(
                "A",
                SandboxState::new([("USD".to_string(), dec!(1000000)), ("BTC".to_string(), dec!(100))]),
                a_book.clone() as Arc<dyn PriceOracle>,
            )),
        );
        clients.insert(
            "B".to_string(),
            Arc::new(SandboxExchangeClient::new(
                "B",
                SandboxState::new([("USD".to_string(), dec!(1000000)), ("BTC".to_string(), dec!(100))]),
                b_book.clone() as Arc<dyn PriceOracle>,
            )),
        );

        (OrderExecutor::new(clients, providers, state, broadcast, tx), dir)
    }

    #[tokio::test]
    async fn sequential_success_computes_expected_pnl() {
        let (executor, _dir) = executor_with_books(dec!(50000), dec!(51000));
        let ctx = CancellationToken::new();
        let ok = executor
            .execute(&opportunity(dec!(0.1)), 0.1, ExecutionStrategy::Sequential, &ctx)
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn slippage_abort_returns_false() {
        let (executor, _dir) = executor_with_books(dec!(50000), dec!(50020));
        let ctx = CancellationToken::new();
        let ok = executor
            .execute(&opportunity(dec!(0.1)), 5.0, ExecutionStrategy::Sequential, &ctx)
            .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_immediately() {
        let (executor, _dir) = executor_with_books(dec!(50000), dec!(51000));
        let ctx = CancellationToken::new();
        ctx.cancel();
        let ok = executor
            .execute(&opportunity(dec!(0.1)), 0.1, ExecutionStrategy::Sequential, &ctx)
            .await;
        assert!(!ok);
    }

    /// A fake leg that always fills `qty` at `price` and reports `price` as
    /// its current top-of-book quote, so the preflight slippage recheck
    /// passes deterministically.
    struct FakeLeg {
        price: Decimal,
        fill_qty: Decimal,
        status: OrderStatus,
    }

    #[async_trait]
    impl ExchangeClient for FakeLeg {
        fn name(&self) -> &str {
            "fake"
        }
        async fn place_market_buy(&self, _symbol: &str, qty: Decimal) -> anyhow::Result<crate::models::OrderResponse> {
            Ok(self.response(qty))
        }
        async fn place_market_sell(&self, _symbol: &str, qty: Decimal) -> anyhow::Result<crate::models::OrderResponse> {
            Ok(self.response(qty))
        }
        async fn place_limit_buy(
            &self,
            _symbol: &str,
            qty: Decimal,
            _price: Decimal,
        ) -> anyhow::Result<crate::models::OrderResponse> {
            Ok(self.response(qty))
        }
        async fn place_limit_sell(
            &self,
            _symbol: &str,
            qty: Decimal,
            _price: Decimal,
        ) -> anyhow::Result<crate::models::OrderResponse> {
            Ok(self.response(qty))
        }
        async fn get_order_status(&self, _order_id: &str) -> anyhow::Result<crate::models::OrderResponse> {
            Ok(self.response(self.fill_qty))
        }
        async fn cancel_order(&self, _order_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_balances(&self) -> anyhow::Result<Vec<crate::models::Balance>> {
            Ok(vec![])
        }
        async fn get_spot_fees(&self, _symbol: &str) -> anyhow::Result<crate::models::FeeSchedule> {
            Ok(crate::models::FeeSchedule { maker: Decimal::ZERO, taker: Decimal::ZERO })
        }
        async fn get_price(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            Ok(self.price)
        }
        async fn withdraw(
            &self,
            _asset: &str,
            _amount: Decimal,
            _address: &str,
            _network: Option<&str>,
        ) -> anyhow::Result<String> {
            Ok("withdrawal".to_string())
        }
        async fn get_deposit_address(&self, _asset: &str) -> anyhow::Result<String> {
            Ok("address".to_string())
        }
        async fn deposit_sandbox_funds(&self, _asset: &str, _amount: Decimal) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl FakeLeg {
        fn response(&self, requested: Decimal) -> crate::models::OrderResponse {
            crate::models::OrderResponse {
                order_id: Uuid::new_v4().to_string(),
                status: self.status,
                original_qty: requested,
                executed_qty: self.fill_qty,
                price: Some(self.price),
                avg_price: Some(self.price),
                fee: Decimal::ZERO,
                fee_currency: "USD".to_string(),
                error_message: None,
                created_at: Utc::now(),
            }
        }
    }

    #[tokio::test]
    async fn sequential_partial_sell_fill_uses_actual_sell_quantity() {
        let dir = tempdir().unwrap();
        let state = Arc::new(StatePersistence::load(dir.path().join("appstate.json")));
        let broadcast = Arc::new(BroadcastHub::new());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        clients.insert(
            "A".to_string(),
            Arc::new(FakeLeg { price: dec!(50000), fill_qty: dec!(1.0), status: OrderStatus::Filled }),
        );
        // Sell leg only partially fills: buy requested/filled 1.0, sell only
        // manages 0.4 even though the leg2 request (propagated from the buy
        // fill) was also 1.0.
        clients.insert(
            "B".to_string(),
            Arc::new(FakeLeg { price: dec!(51000), fill_qty: dec!(0.4), status: OrderStatus::PartiallyFilled }),
        );

        let executor = OrderExecutor::new(clients, HashMap::new(), state, broadcast, tx);
        let ctx = CancellationToken::new();
        let ok = executor
            .execute(&opportunity(dec!(1.0)), 0.1, ExecutionStrategy::Sequential, &ctx)
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn sequential_partial_sell_fill_transaction_matches_actual_fill() {
        let dir = tempdir().unwrap();
        let state = Arc::new(StatePersistence::load(dir.path().join("appstate.json")));
        let broadcast = Arc::new(BroadcastHub::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        clients.insert(
            "A".to_string(),
            Arc::new(FakeLeg { price: dec!(50000), fill_qty: dec!(1.0), status: OrderStatus::Filled }),
        );
        clients.insert(
            "B".to_string(),
            Arc::new(FakeLeg { price: dec!(51000), fill_qty: dec!(0.4), status: OrderStatus::PartiallyFilled }),
        );

        let executor = OrderExecutor::new(clients, HashMap::new(), state, broadcast, tx);
        let ctx = CancellationToken::new();
        executor
            .execute(&opportunity(dec!(1.0)), 0.1, ExecutionStrategy::Sequential, &ctx)
            .await;

        let transaction = rx.try_recv().expect("transaction recorded");
        assert_eq!(transaction.status, TransactionStatus::Success);
        // amount/sell_proceeds must reflect the sell leg's actual 0.4 fill,
        // not the 1.0 quantity requested of it.
        assert_eq!(transaction.amount, dec!(0.4));
        assert_eq!(transaction.sell_proceeds, dec!(51000) * dec!(0.4));
    }
}
