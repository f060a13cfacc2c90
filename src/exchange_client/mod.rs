//! `ExchangeClient` capability set: places/cancels orders, fetches
//! balances/fees/prices, and moves funds, with a Sandbox/Real mode switch
//! that is idempotent and reflected by every subsequent call (spec.md §4.C).

pub mod dual_mode;
pub mod http;
pub mod sandbox_state;

pub use dual_mode::DualModeClient;
pub use http::HttpExchangeClient;
pub use sandbox_state::{SandboxExchangeClient, SandboxState};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{Balance, FeeSchedule, OrderResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Sandbox,
    Real,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn place_market_buy(&self, symbol: &str, qty: Decimal) -> anyhow::Result<OrderResponse>;
    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> anyhow::Result<OrderResponse>;
    async fn place_limit_buy(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> anyhow::Result<OrderResponse>;
    async fn place_limit_sell(
        &self,
        symbol: &str,
        qty: Decimal,
        price: Decimal,
    ) -> anyhow::Result<OrderResponse>;
    async fn get_order_status(&self, order_id: &str) -> anyhow::Result<OrderResponse>;
    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()>;

    /// Live balance fetch; callers that want the stale-tolerant cached path
    /// should go through `DualModeClient`.
    async fn get_balances(&self) -> anyhow::Result<Vec<Balance>>;
    async fn get_spot_fees(&self, symbol: &str) -> anyhow::Result<FeeSchedule>;
    async fn get_price(&self, symbol: &str) -> anyhow::Result<Decimal>;

    async fn withdraw(
        &self,
        asset: &str,
        amount: Decimal,
        address: &str,
        network: Option<&str>,
    ) -> anyhow::Result<String>;
    async fn get_deposit_address(&self, asset: &str) -> anyhow::Result<String>;
    async fn deposit_sandbox_funds(&self, asset: &str, amount: Decimal) -> anyhow::Result<()>;
}
