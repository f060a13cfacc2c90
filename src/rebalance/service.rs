//! Per-asset, per-exchange inventory deviation tracking and transfer
//! proposals (spec.md §4.K). Polls balances from every exchange in
//! parallel every 60s; deviations and the derived legacy "skew" value are
//! cached for lock-free reads between polls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::RebalanceProposal;
use crate::exchange_client::ExchangeClient;
use crate::models::InventoryDeviation;
use crate::persistence::StatePersistence;

pub struct RebalancingService {
    clients: HashMap<String, Arc<dyn ExchangeClient>>,
    state: Arc<StatePersistence>,
    rebalance_tx: mpsc::UnboundedSender<RebalanceProposal>,
    /// `asset -> exchange -> deviation`.
    deviations: RwLock<BTreeMap<String, BTreeMap<String, Decimal>>>,
    proposals: RwLock<Vec<RebalanceProposal>>,
}

impl RebalancingService {
    pub fn new(
        clients: HashMap<String, Arc<dyn ExchangeClient>>,
        state: Arc<StatePersistence>,
        rebalance_tx: mpsc::UnboundedSender<RebalanceProposal>,
    ) -> Self {
        Self {
            clients,
            state,
            rebalance_tx,
            deviations: RwLock::new(BTreeMap::new()),
            proposals: RwLock::new(Vec::new()),
        }
    }

    /// Fetches balances from every exchange in parallel, recomputes
    /// deviations, and emits a proposal for any asset whose maximum
    /// absolute deviation exceeds the configured threshold.
    pub async fn poll(&self) -> Result<()> {
        let fetches = self.clients.iter().map(|(name, client)| {
            let name = name.clone();
            let client = client.clone();
            async move {
                let balances = client.get_balances().await;
                (name, balances)
            }
        });
        let results = futures_util::future::join_all(fetches).await;

        let mut by_asset: BTreeMap<String, BTreeMap<String, Decimal>> = BTreeMap::new();
        for (exchange, balances) in results {
            match balances {
                Ok(balances) => {
                    for balance in balances {
                        by_asset
                            .entry(balance.asset)
                            .or_default()
                            .insert(exchange.clone(), balance.free);
                    }
                }
                Err(e) => warn!(exchange, error = %e, "balance fetch failed during rebalance poll"),
            }
        }

        let threshold = self.state.read().min_rebalance_skew_threshold;
        let mut deviations = BTreeMap::new();
        let mut proposals = Vec::new();

        for (asset, per_exchange) in &by_asset {
            let total: Decimal = per_exchange.values().copied().sum();
            if total <= Decimal::ZERO || per_exchange.len() < 2 {
                continue;
            }
            let mean = total / Decimal::from(per_exchange.len() as u64);

            let mut asset_devs = BTreeMap::new();
            let mut max_abs_dev = Decimal::ZERO;
            let mut surplus_dev = Decimal::ZERO;
            let mut surplus_exchange = String::new();
            let mut deficit_dev = Decimal::ZERO;
            let mut deficit_exchange = String::new();

            for (exchange, balance) in per_exchange {
                let dev = ((*balance - mean) / total).clamp(-Decimal::ONE, Decimal::ONE).round_dp(4);
                asset_devs.insert(exchange.clone(), dev);
                if dev.abs() > max_abs_dev {
                    max_abs_dev = dev.abs();
                }
                // Source of a transfer is always the most-surplus exchange
                // (largest signed deviation), never the most-deficit one,
                // even when the deficit is the larger-magnitude outlier.
                if dev > surplus_dev || surplus_exchange.is_empty() {
                    surplus_dev = dev;
                    surplus_exchange = exchange.clone();
                }
                if dev < deficit_dev || deficit_exchange.is_empty() {
                    deficit_dev = dev;
                    deficit_exchange = exchange.clone();
                }
            }
            deviations.insert(asset.clone(), asset_devs);

            if max_abs_dev > Decimal::from_f64_retain(threshold).unwrap_or(Decimal::ZERO)
                && surplus_exchange != deficit_exchange
            {
                let amount = (surplus_dev.abs() * mean).round_dp(8);
                let proposal = RebalanceProposal {
                    asset: asset.clone(),
                    amount,
                    direction: format!("{} → {}", surplus_exchange, deficit_exchange),
                    estimated_fee: Decimal::ZERO,
                    cost_percentage: 0.0,
                    is_viable: true,
                    trend_description: format!("{asset} skew {surplus_dev} at {surplus_exchange}"),
                };
                info!(asset = %proposal.asset, direction = %proposal.direction, "rebalance proposal emitted");
                let _ = self.rebalance_tx.send(proposal.clone());
                proposals.push(proposal);
            }
        }

        *self.deviations.write() = deviations;
        *self.proposals.write() = proposals;
        Ok(())
    }

    pub fn get_deviation(&self, asset: &str, exchange: &str) -> Option<Decimal> {
        self.deviations.read().get(asset)?.get(exchange).copied()
    }

    pub fn get_all_deviations(&self) -> Vec<InventoryDeviation> {
        self.deviations
            .read()
            .iter()
            .flat_map(|(asset, per_exchange)| {
                per_exchange.iter().map(move |(exchange, dev)| InventoryDeviation {
                    asset: asset.clone(),
                    exchange: exchange.clone(),
                    deviation: *dev,
                })
            })
            .collect()
    }

    pub fn get_proposals(&self) -> Vec<RebalanceProposal> {
        self.proposals.read().clone()
    }

    /// Executes a proposed transfer: withdraws from the source exchange to
    /// the destination exchange's deposit address. Transfer routing/fee
    /// optimization beyond this is explicitly out of scope.
    pub async fn execute_rebalance(&self, proposal: &RebalanceProposal) -> Result<String> {
        let (from, to) = proposal
            .direction
            .split_once(" → ")
            .context("malformed rebalance direction")?;
        let from_client = self.clients.get(from).context("unknown source exchange")?;
        let to_client = self.clients.get(to).context("unknown destination exchange")?;
        let deposit_address = to_client.get_deposit_address(&proposal.asset).await?;
        from_client
            .withdraw(&proposal.asset, proposal.amount, &deposit_address, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange_client::{SandboxExchangeClient, SandboxState};
    use crate::exchange_client::sandbox_state::PriceOracle;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    struct FixedOracle(Decimal);
    #[async_trait]
    impl PriceOracle for FixedOracle {
        async fn price(&self, _symbol: &str) -> Result<Decimal> {
            Ok(self.0)
        }
    }

    fn service_with_balances(a_usd: Decimal, b_usd: Decimal) -> RebalancingService {
        let dir = tempdir().unwrap();
        let state = Arc::new(StatePersistence::load(dir.path().join("appstate.json")));
        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        clients.insert(
            "A".to_string(),
            Arc::new(SandboxExchangeClient::new(
                "A",
                SandboxState::new([("USD".to_string(), a_usd)]),
                Arc::new(FixedOracle(dec!(1))),
            )),
        );
        clients.insert(
            "B".to_string(),
            Arc::new(SandboxExchangeClient::new(
                "B",
                SandboxState::new([("USD".to_string(), b_usd)]),
                Arc::new(FixedOracle(dec!(1))),
            )),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        RebalancingService::new(clients, state, tx)
    }

    #[tokio::test]
    async fn balanced_inventory_yields_no_proposal() {
        let service = service_with_balances(dec!(1000), dec!(1000));
        service.poll().await.unwrap();
        assert!(service.get_proposals().is_empty());
    }

    #[tokio::test]
    async fn skewed_inventory_yields_proposal_and_bounded_deviation() {
        let service = service_with_balances(dec!(9000), dec!(1000));
        service.poll().await.unwrap();
        let proposals = service.get_proposals();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].direction, "A → B");

        let dev_a = service.get_deviation("USD", "A").unwrap();
        let dev_b = service.get_deviation("USD", "B").unwrap();
        assert!((dev_a + dev_b).abs() < dec!(0.0001));
    }

    /// N>=3 case where the most extreme deviation (by absolute value) is a
    /// drained exchange, not a surplus one: A=3500, B=3500, C=0 gives devs
    /// +0.1667, +0.1667, -0.3333. The transfer source must be a surplus
    /// exchange (A or B), never C picked as both source and destination.
    #[tokio::test]
    async fn drained_exchange_is_never_both_source_and_destination() {
        let dir = tempdir().unwrap();
        let state = Arc::new(StatePersistence::load(dir.path().join("appstate.json")));
        let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
        for (name, balance) in [("A", dec!(3500)), ("B", dec!(3500)), ("C", dec!(0))] {
            clients.insert(
                name.to_string(),
                Arc::new(SandboxExchangeClient::new(
                    name,
                    SandboxState::new([("USD".to_string(), balance)]),
                    Arc::new(FixedOracle(dec!(1))),
                )),
            );
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        let service = RebalancingService::new(clients, state, tx);
        service.poll().await.unwrap();

        let proposals = service.get_proposals();
        assert_eq!(proposals.len(), 1);
        let (from, to) = proposals[0].direction.split_once(" → ").unwrap();
        assert_ne!(from, to, "source and destination must never be the same exchange");
        assert!(from == "A" || from == "B", "source must be a surplus exchange, got {from}");
        assert_eq!(to, "C", "deficit exchange C must be the destination");
    }
}
