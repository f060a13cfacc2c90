//! Sandbox/Real mode switch (spec.md §4.C). The switch is idempotent and
//! every subsequent call after a switch goes to the newly selected
//! delegate. Balance and fee lookups keep the last successful response
//! around and fall back to it when the live call errors, so a transient
//! venue outage degrades to staleness rather than failing the caller.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::warn;

use super::{ClientMode, ExchangeClient};
use crate::models::{Balance, FeeSchedule, OrderResponse};

pub struct DualModeClient {
    name: String,
    mode: RwLock<ClientMode>,
    sandbox: Arc<dyn ExchangeClient>,
    real: Arc<dyn ExchangeClient>,
    cached_balances: Mutex<Option<Vec<Balance>>>,
    cached_fees: Mutex<std::collections::HashMap<String, FeeSchedule>>,
}

impl DualModeClient {
    pub fn new(
        name: impl Into<String>,
        initial_mode: ClientMode,
        sandbox: Arc<dyn ExchangeClient>,
        real: Arc<dyn ExchangeClient>,
    ) -> Self {
        Self {
            name: name.into(),
            mode: RwLock::new(initial_mode),
            sandbox,
            real,
            cached_balances: Mutex::new(None),
            cached_fees: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn mode(&self) -> ClientMode {
        *self.mode.read()
    }

    /// Switches the active delegate. Idempotent: switching to the mode
    /// already in effect is a no-op.
    pub fn set_mode(&self, mode: ClientMode) {
        *self.mode.write() = mode;
    }

    fn active(&self) -> &Arc<dyn ExchangeClient> {
        match self.mode() {
            ClientMode::Sandbox => &self.sandbox,
            ClientMode::Real => &self.real,
        }
    }
}

#[async_trait]
impl ExchangeClient for DualModeClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_market_buy(&self, symbol: &str, qty: Decimal) -> anyhow::Result<OrderResponse> {
        self.active().place_market_buy(symbol, qty).await
    }

    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> anyhow::Result<OrderResponse> {
        self.active().place_market_sell(symbol, qty).await
    }

    async fn place_limit_buy(&self, symbol: &str, qty: Decimal, price: Decimal) -> anyhow::Result<OrderResponse> {
        self.active().place_limit_buy(symbol, qty, price).await
    }

    async fn place_limit_sell(&self, symbol: &str, qty: Decimal, price: Decimal) -> anyhow::Result<OrderResponse> {
        self.active().place_limit_sell(symbol, qty, price).await
    }

    async fn get_order_status(&self, order_id: &str) -> anyhow::Result<OrderResponse> {
        self.active().get_order_status(order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> anyhow::Result<()> {
        self.active().cancel_order(order_id).await
    }

    /// Falls back to the last successful fetch when the live call fails;
    /// callers must tolerate the resulting staleness.
    async fn get_balances(&self) -> anyhow::Result<Vec<Balance>> {
        match self.active().get_balances().await {
            Ok(balances) => {
                *self.cached_balances.lock() = Some(balances.clone());
                Ok(balances)
            }
            Err(e) => {
                if let Some(cached) = self.cached_balances.lock().clone() {
                    warn!(exchange = %self.name, error = %e, "balance fetch failed, serving cached balances");
                    Ok(cached)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn get_spot_fees(&self, symbol: &str) -> anyhow::Result<FeeSchedule> {
        match self.active().get_spot_fees(symbol).await {
            Ok(fees) => {
                self.cached_fees.lock().insert(symbol.to_string(), fees);
                Ok(fees)
            }
            Err(e) => {
                if let Some(cached) = self.cached_fees.lock().get(symbol).copied() {
                    warn!(exchange = %self.name, symbol, error = %e, "fee fetch failed, serving cached fees");
                    Ok(cached)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn get_price(&self, symbol: &str) -> anyhow::Result<Decimal> {
        self.active().get_price(symbol).await
    }

    async fn withdraw(
        &self,
        asset: &str,
        amount: Decimal,
        address: &str,
        network: Option<&str>,
    ) -> anyhow::Result<String> {
        self.active().withdraw(asset, amount, address, network).await
    }

    async fn get_deposit_address(&self, asset: &str) -> anyhow::Result<String> {
        self.active().get_deposit_address(asset).await
    }

    async fn deposit_sandbox_funds(&self, asset: &str, amount: Decimal) -> anyhow::Result<()> {
        self.sandbox.deposit_sandbox_funds(asset, amount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange_client::sandbox_state::{PriceOracle, SandboxExchangeClient, SandboxState};
    use anyhow::bail;
    use rust_decimal_macros::dec;

    struct FlakyOracle;
    #[async_trait]
    impl PriceOracle for FlakyOracle {
        async fn price(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            bail!("oracle unavailable")
        }
    }

    struct FailingClient;
    #[async_trait]
    impl ExchangeClient for FailingClient {
        fn name(&self) -> &str {
            "Failing"
        }
        async fn place_market_buy(&self, _: &str, _: Decimal) -> anyhow::Result<OrderResponse> {
            bail!("unreachable")
        }
        async fn place_market_sell(&self, _: &str, _: Decimal) -> anyhow::Result<OrderResponse> {
            bail!("unreachable")
        }
        async fn place_limit_buy(&self, _: &str, _: Decimal, _: Decimal) -> anyhow::Result<OrderResponse> {
            bail!("unreachable")
        }
        async fn place_limit_sell(&self, _: &str, _: Decimal, _: Decimal) -> anyhow::Result<OrderResponse> {
            bail!("unreachable")
        }
        async fn get_order_status(&self, _: &str) -> anyhow::Result<OrderResponse> {
            bail!("unreachable")
        }
        async fn cancel_order(&self, _: &str) -> anyhow::Result<()> {
            bail!("unreachable")
        }
        async fn get_balances(&self) -> anyhow::Result<Vec<Balance>> {
            bail!("venue unreachable")
        }
        async fn get_spot_fees(&self, _: &str) -> anyhow::Result<FeeSchedule> {
            bail!("venue unreachable")
        }
        async fn get_price(&self, _: &str) -> anyhow::Result<Decimal> {
            bail!("unreachable")
        }
        async fn withdraw(&self, _: &str, _: Decimal, _: &str, _: Option<&str>) -> anyhow::Result<String> {
            bail!("unreachable")
        }
        async fn get_deposit_address(&self, _: &str) -> anyhow::Result<String> {
            bail!("unreachable")
        }
        async fn deposit_sandbox_funds(&self, _: &str, _: Decimal) -> anyhow::Result<()> {
            bail!("unreachable")
        }
    }

    fn sandbox_client() -> Arc<dyn ExchangeClient> {
        let state = SandboxState::new([("USD".to_string(), dec!(1000))]);
        Arc::new(SandboxExchangeClient::new("Sandbox", state, Arc::new(FlakyOracle)))
    }

    #[test]
    fn mode_switch_is_idempotent_and_reflected() {
        let client = DualModeClient::new("Binance", ClientMode::Sandbox, sandbox_client(), Arc::new(FailingClient));
        assert_eq!(client.mode(), ClientMode::Sandbox);
        client.set_mode(ClientMode::Real);
        assert_eq!(client.mode(), ClientMode::Real);
        client.set_mode(ClientMode::Real);
        assert_eq!(client.mode(), ClientMode::Real);
    }

    #[tokio::test]
    async fn balance_fetch_falls_back_to_cache_on_failure() {
        let client = DualModeClient::new("Binance", ClientMode::Real, sandbox_client(), Arc::new(FailingClient));
        // Seed the cache manually, as if an earlier Sandbox-mode fetch succeeded.
        *client.cached_balances.lock() = Some(vec![Balance {
            exchange: "Binance".to_string(),
            asset: "USD".to_string(),
            free: dec!(500),
        }]);
        let balances = client.get_balances().await.unwrap();
        assert_eq!(balances[0].free, dec!(500));
    }

    #[tokio::test]
    async fn balance_fetch_without_cache_propagates_error() {
        let client = DualModeClient::new("Binance", ClientMode::Real, sandbox_client(), Arc::new(FailingClient));
        assert!(client.get_balances().await.is_err());
    }
}
