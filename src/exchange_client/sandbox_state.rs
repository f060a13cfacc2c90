//! In-memory simulated exchange (spec.md §4.D). Balances are a thread-safe
//! map mutated via atomic upsert; orders fill at the live price read from a
//! paired price oracle (deliberately NOT isolated from real prices — the
//! spec chooses realism over isolation).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::ExchangeClient;
use crate::models::{Balance, FeeSchedule, OrderResponse, OrderStatus};

/// Anything that can answer "what's the current price of this symbol" —
/// in production this is the paired Real exchange client; in tests it is
/// whatever fixture the test wires in.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price(&self, symbol: &str) -> Result<Decimal>;
}

#[async_trait]
impl PriceOracle for crate::book_provider::SandboxBookProvider {
    async fn price(&self, symbol: &str) -> Result<Decimal> {
        let book = self
            .get_order_book(symbol)
            .ok_or_else(|| anyhow::anyhow!("no book for {symbol}"))?;
        let bid = book.bids.first().map(|(p, _)| *p);
        let ask = book.asks.first().map(|(p, _)| *p);
        match (bid, ask) {
            (Some(b), Some(a)) => Ok((b + a) / Decimal::from(2)),
            (Some(b), None) => Ok(b),
            (None, Some(a)) => Ok(a),
            (None, None) => bail!("empty book for {symbol}"),
        }
    }
}

#[derive(Clone)]
pub struct SandboxState {
    balances: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl SandboxState {
    pub fn new(starter: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        Self {
            balances: Arc::new(RwLock::new(starter.into_iter().collect())),
        }
    }

    pub fn balance(&self, asset: &str) -> Decimal {
        *self.balances.read().get(asset).unwrap_or(&Decimal::ZERO)
    }

    pub fn deposit(&self, asset: &str, amount: Decimal) {
        *self.balances.write().entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    fn withdraw_internal(&self, asset: &str, amount: Decimal, error: &str) -> Result<()> {
        let mut balances = self.balances.write();
        let entry = balances.entry(asset.to_string()).or_insert(Decimal::ZERO);
        if *entry < amount {
            bail!("{error}");
        }
        *entry -= amount;
        Ok(())
    }

    /// Execute a buy: deduct `qty * price` quote, add `qty` base.
    pub fn fill_buy(&self, base: &str, quote: &str, qty: Decimal, price: Decimal) -> Result<()> {
        let cost = qty * price;
        self.withdraw_internal(quote, cost, "Insufficient quote balance")?;
        self.deposit(base, qty);
        Ok(())
    }

    /// Execute a sell: deduct `qty` base, add `qty * price` quote.
    pub fn fill_sell(&self, base: &str, quote: &str, qty: Decimal, price: Decimal) -> Result<()> {
        self.withdraw_internal(base, qty, "Insufficient base balance")?;
        self.deposit(quote, qty * price);
        Ok(())
    }

    pub fn all_balances(&self, exchange: &str) -> Vec<Balance> {
        self.balances
            .read()
            .iter()
            .map(|(asset, free)| Balance {
                exchange: exchange.to_string(),
                asset: asset.clone(),
                free: *free,
            })
            .collect()
    }
}

/// Split a canonical `BASE-QUOTE` symbol. Falls back to a 3-letter quote
/// guess (`USD`/`USDT`) when no dash is present, matching the loose
/// spellings venues use.
fn split_symbol(symbol: &str) -> (String, String) {
    if let Some((base, quote)) = symbol.split_once('-') {
        return (base.to_string(), quote.to_string());
    }
    for quote in ["USDT", "USD", "USDC"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return (base.to_string(), quote.to_string());
            }
        }
    }
    (symbol.to_string(), "USD".to_string())
}

pub struct SandboxExchangeClient {
    name: String,
    state: SandboxState,
    oracle: Arc<dyn PriceOracle>,
}

impl SandboxExchangeClient {
    pub fn new(name: impl Into<String>, state: SandboxState, oracle: Arc<dyn PriceOracle>) -> Self {
        Self {
            name: name.into(),
            state,
            oracle,
        }
    }

    fn fill_response(&self, qty: Decimal, price: Decimal) -> OrderResponse {
        OrderResponse {
            order_id: Uuid::new_v4().to_string(),
            status: OrderStatus::Filled,
            original_qty: qty,
            executed_qty: qty,
            price: Some(price),
            avg_price: Some(price),
            fee: Decimal::ZERO,
            fee_currency: "".to_string(),
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl ExchangeClient for SandboxExchangeClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_market_buy(&self, symbol: &str, qty: Decimal) -> Result<OrderResponse> {
        let (base, quote) = split_symbol(symbol);
        let price = self.oracle.price(symbol).await?;
        self.state.fill_buy(&base, &quote, qty, price)?;
        Ok(self.fill_response(qty, price))
    }

    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> Result<OrderResponse> {
        let (base, quote) = split_symbol(symbol);
        let price = self.oracle.price(symbol).await?;
        self.state.fill_sell(&base, &quote, qty, price)?;
        Ok(self.fill_response(qty, price))
    }

    async fn place_limit_buy(&self, symbol: &str, qty: Decimal, price: Decimal) -> Result<OrderResponse> {
        let (base, quote) = split_symbol(symbol);
        self.state.fill_buy(&base, &quote, qty, price)?;
        Ok(self.fill_response(qty, price))
    }

    async fn place_limit_sell(&self, symbol: &str, qty: Decimal, price: Decimal) -> Result<OrderResponse> {
        let (base, quote) = split_symbol(symbol);
        self.state.fill_sell(&base, &quote, qty, price)?;
        Ok(self.fill_response(qty, price))
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderResponse> {
        // The sandbox always fills synchronously; a status probe on a
        // known id reports it filled, unknown ids are a caller error.
        Ok(OrderResponse {
            order_id: order_id.to_string(),
            status: OrderStatus::Filled,
            original_qty: Decimal::ZERO,
            executed_qty: Decimal::ZERO,
            price: None,
            avg_price: None,
            fee: Decimal::ZERO,
            fee_currency: "".to_string(),
            error_message: None,
            created_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<()> {
        // Sandbox fills are synchronous; nothing to cancel.
        Ok(())
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        Ok(self.state.all_balances(&self.name))
    }

    async fn get_spot_fees(&self, _symbol: &str) -> Result<FeeSchedule> {
        Ok(FeeSchedule {
            maker: Decimal::new(1, 3),
            taker: Decimal::new(1, 3),
        })
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal> {
        self.oracle.price(symbol).await
    }

    async fn withdraw(&self, asset: &str, amount: Decimal, _address: &str, _network: Option<&str>) -> Result<String> {
        self.state.withdraw_internal(asset, amount, "Insufficient balance for withdrawal")?;
        Ok(Uuid::new_v4().to_string())
    }

    async fn get_deposit_address(&self, asset: &str) -> Result<String> {
        Ok(format!("sandbox-deposit-{}-{}", self.name, asset))
    }

    async fn deposit_sandbox_funds(&self, asset: &str, amount: Decimal) -> Result<()> {
        self.state.deposit(asset, amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct FixedOracle(Decimal);

    #[async_trait]
    impl PriceOracle for FixedOracle {
        async fn price(&self, _symbol: &str) -> Result<Decimal> {
            Ok(self.0)
        }
    }

    fn client(price: Decimal) -> SandboxExchangeClient {
        let state = SandboxState::new([("USD".to_string(), dec!(100000)), ("BTC".to_string(), dec!(10))]);
        SandboxExchangeClient::new("Binance", state, Arc::new(FixedOracle(price)))
    }

    #[tokio::test]
    async fn buy_deducts_quote_adds_base() {
        let c = client(dec!(50000));
        let resp = c.place_market_buy("BTC-USD", dec!(1)).await.unwrap();
        assert_eq!(resp.status, OrderStatus::Filled);
        assert_eq!(resp.executed_qty, dec!(1));
        assert_eq!(c.state.balance("BTC"), dec!(11));
        assert_eq!(c.state.balance("USD"), dec!(50000));
    }

    #[tokio::test]
    async fn sell_deducts_base_adds_quote() {
        let c = client(dec!(50000));
        let resp = c.place_market_sell("BTC-USD", dec!(2)).await.unwrap();
        assert_eq!(resp.executed_qty, dec!(2));
        assert_eq!(c.state.balance("BTC"), dec!(8));
        assert_eq!(c.state.balance("USD"), dec!(200000));
    }

    #[tokio::test]
    async fn insufficient_quote_balance_fails_buy() {
        let c = client(dec!(50000));
        let err = c.place_market_buy("BTC-USD", dec!(100)).await.unwrap_err();
        assert!(err.to_string().contains("Insufficient quote balance"));
    }

    #[tokio::test]
    async fn insufficient_base_balance_fails_sell() {
        let c = client(dec!(50000));
        let err = c.place_market_sell("BTC-USD", dec!(100)).await.unwrap_err();
        assert!(err.to_string().contains("Insufficient base balance"));
    }

    #[tokio::test]
    async fn deposit_is_additive() {
        let c = client(dec!(50000));
        c.deposit_sandbox_funds("ETH", dec!(5)).await.unwrap();
        c.deposit_sandbox_funds("ETH", dec!(2)).await.unwrap();
        assert_eq!(c.state.balance("ETH"), dec!(7));
    }

    #[test]
    fn split_symbol_handles_both_spellings() {
        assert_eq!(split_symbol("BTC-USD"), ("BTC".to_string(), "USD".to_string()));
        assert_eq!(split_symbol("BTCUSDT"), ("BTC".to_string(), "USDT".to_string()));
    }
}
