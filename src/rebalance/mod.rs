//! Inventory rebalancing & safety supervisor, split across the active
//! deviation-tracking poller (`service`) and the opportunistic consumer of
//! sub-threshold arbitrage (`passive`) per spec.md §4.K/§4.L.

pub mod passive;
pub mod service;

pub use passive::PassiveRebalancer;
pub use service::RebalancingService;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A proposed cross-exchange transfer to correct inventory skew.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceProposal {
    pub asset: String,
    pub amount: Decimal,
    /// `"A → B"` — human-readable source/destination.
    pub direction: String,
    pub estimated_fee: Decimal,
    pub cost_percentage: f64,
    pub is_viable: bool,
    pub trend_description: String,
}
