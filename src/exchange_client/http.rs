//! "Real" mode `ExchangeClient`. The exact wire protocol/authentication of
//! any given venue is out of scope (spec.md §1); this is a generic REST
//! client against a configurable base URL that a concrete per-venue
//! adapter would otherwise implement. Included so `DualModeClient` has a
//! genuine Real-mode collaborator to delegate to, not just a stub.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::ExchangeClient;
use crate::models::{Balance, FeeSchedule, OrderResponse, OrderStatus};

pub struct HttpExchangeClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
}

impl HttpExchangeClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        qty: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse> {
        #[derive(Deserialize)]
        struct WireOrder {
            order_id: String,
            status: String,
            executed_qty: Decimal,
            avg_price: Option<Decimal>,
            fee: Option<Decimal>,
            fee_currency: Option<String>,
        }

        let resp = self
            .http
            .post(format!("{}/order", self.base_url))
            .json(&serde_json::json!({
                "symbol": symbol,
                "side": side,
                "type": order_type,
                "qty": qty,
                "price": price,
            }))
            .send()
            .await
            .context("order placement request failed")?;

        let wire: WireOrder = resp.json().await.context("order response decode failed")?;
        let status = match wire.status.as_str() {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "FAILED" => OrderStatus::Failed,
            _ => OrderStatus::Pending,
        };

        Ok(OrderResponse {
            order_id: wire.order_id,
            status,
            original_qty: qty,
            executed_qty: wire.executed_qty,
            price,
            avg_price: wire.avg_price,
            fee: wire.fee.unwrap_or(Decimal::ZERO),
            fee_currency: wire.fee_currency.unwrap_or_default(),
            error_message: None,
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn place_market_buy(&self, symbol: &str, qty: Decimal) -> Result<OrderResponse> {
        self.place_order(symbol, "BUY", "MARKET", qty, None).await
    }

    async fn place_market_sell(&self, symbol: &str, qty: Decimal) -> Result<OrderResponse> {
        self.place_order(symbol, "SELL", "MARKET", qty, None).await
    }

    async fn place_limit_buy(&self, symbol: &str, qty: Decimal, price: Decimal) -> Result<OrderResponse> {
        self.place_order(symbol, "BUY", "LIMIT", qty, Some(price)).await
    }

    async fn place_limit_sell(&self, symbol: &str, qty: Decimal, price: Decimal) -> Result<OrderResponse> {
        self.place_order(symbol, "SELL", "LIMIT", qty, Some(price)).await
    }

    async fn get_order_status(&self, order_id: &str) -> Result<OrderResponse> {
        #[derive(Deserialize)]
        struct WireStatus {
            status: String,
            original_qty: Decimal,
            executed_qty: Decimal,
            avg_price: Option<Decimal>,
        }
        let resp = self
            .http
            .get(format!("{}/order/{}", self.base_url, order_id))
            .send()
            .await
            .context("order status request failed")?;
        let wire: WireStatus = resp.json().await.context("order status decode failed")?;
        let status = match wire.status.as_str() {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELLED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "FAILED" => OrderStatus::Failed,
            _ => OrderStatus::Pending,
        };
        Ok(OrderResponse {
            order_id: order_id.to_string(),
            status,
            original_qty: wire.original_qty,
            executed_qty: wire.executed_qty,
            price: None,
            avg_price: wire.avg_price,
            fee: Decimal::ZERO,
            fee_currency: "".to_string(),
            error_message: None,
            created_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.http
            .post(format!("{}/order/{}/cancel", self.base_url, order_id))
            .send()
            .await
            .context("cancel request failed")?;
        Ok(())
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        let resp = self
            .http
            .get(format!("{}/balances", self.base_url))
            .send()
            .await
            .context("balances request failed")?;
        let wire: Vec<(String, Decimal)> = resp.json().await.context("balances decode failed")?;
        Ok(wire
            .into_iter()
            .map(|(asset, free)| Balance {
                exchange: self.name.clone(),
                asset,
                free,
            })
            .collect())
    }

    async fn get_spot_fees(&self, symbol: &str) -> Result<FeeSchedule> {
        #[derive(Deserialize)]
        struct WireFees {
            maker: Decimal,
            taker: Decimal,
        }
        let resp = self
            .http
            .get(format!("{}/fees/{}", self.base_url, symbol))
            .send()
            .await
            .context("fees request failed")?;
        let wire: WireFees = resp.json().await.context("fees decode failed")?;
        Ok(FeeSchedule {
            maker: wire.maker,
            taker: wire.taker,
        })
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal> {
        #[derive(Deserialize)]
        struct WirePrice {
            price: Decimal,
        }
        let resp = self
            .http
            .get(format!("{}/price/{}", self.base_url, symbol))
            .send()
            .await
            .context("price request failed")?;
        let wire: WirePrice = resp.json().await.context("price decode failed")?;
        Ok(wire.price)
    }

    async fn withdraw(&self, asset: &str, amount: Decimal, address: &str, network: Option<&str>) -> Result<String> {
        #[derive(Deserialize)]
        struct WireWithdraw {
            withdrawal_id: String,
        }
        let resp = self
            .http
            .post(format!("{}/withdraw", self.base_url))
            .json(&serde_json::json!({
                "asset": asset,
                "amount": amount,
                "address": address,
                "network": network,
            }))
            .send()
            .await
            .context("withdraw request failed")?;
        let wire: WireWithdraw = resp.json().await.context("withdraw decode failed")?;
        Ok(wire.withdrawal_id)
    }

    async fn get_deposit_address(&self, asset: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct WireAddress {
            address: String,
        }
        let resp = self
            .http
            .get(format!("{}/deposit_address/{}", self.base_url, asset))
            .send()
            .await
            .context("deposit address request failed")?;
        let wire: WireAddress = resp.json().await.context("deposit address decode failed")?;
        Ok(wire.address)
    }

    async fn deposit_sandbox_funds(&self, _asset: &str, _amount: Decimal) -> Result<()> {
        anyhow::bail!("deposit_sandbox_funds is not applicable in Real mode")
    }
}
