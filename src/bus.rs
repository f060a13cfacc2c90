//! Typed, in-process channel topology wiring every stage together.
//! Mission: producers and consumers never know about each other, only the bus.
//!
//! `MarketUpdate` and `StrategyUpdateCh` are broadcast (many independent
//! consumers observe every message); everything else is a single-consumer
//! mpsc queue, mirroring the split the teacher draws between its
//! `broadcast::channel::<WsServerEvent>` and `mpsc::channel::<EnrichmentJob>`
//! in `main.rs`.

use tokio::sync::{broadcast, mpsc};

use crate::models::{ArbitrageEvent, ArbitrageOpportunity, Transaction};
use crate::rebalance::RebalanceProposal;
use crate::strategy::StrategyUpdate;

/// Capacity of the `MarketUpdate` broadcast channel. Lagging subscribers
/// drop the oldest unread messages rather than block producers.
const MARKET_UPDATE_CAPACITY: usize = 4096;
const STRATEGY_UPDATE_CAPACITY: usize = 64;

pub struct ChannelBus {
    market_update_tx: broadcast::Sender<String>,
    strategy_update_tx: broadcast::Sender<StrategyUpdate>,

    trade_tx: mpsc::UnboundedSender<ArbitrageOpportunity>,
    trade_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ArbitrageOpportunity>>>,

    passive_rebalance_tx: mpsc::UnboundedSender<ArbitrageOpportunity>,
    passive_rebalance_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ArbitrageOpportunity>>>,

    event_tx: mpsc::UnboundedSender<ArbitrageEvent>,
    event_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ArbitrageEvent>>>,

    transaction_tx: mpsc::UnboundedSender<Transaction>,
    transaction_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Transaction>>>,

    rebalance_tx: mpsc::UnboundedSender<RebalanceProposal>,
    rebalance_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<RebalanceProposal>>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        let (market_update_tx, _) = broadcast::channel(MARKET_UPDATE_CAPACITY);
        let (strategy_update_tx, _) = broadcast::channel(STRATEGY_UPDATE_CAPACITY);
        let (trade_tx, trade_rx) = mpsc::unbounded_channel();
        let (passive_rebalance_tx, passive_rebalance_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transaction_tx, transaction_rx) = mpsc::unbounded_channel();
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();

        Self {
            market_update_tx,
            strategy_update_tx,
            trade_tx,
            trade_rx: tokio::sync::Mutex::new(Some(trade_rx)),
            passive_rebalance_tx,
            passive_rebalance_rx: tokio::sync::Mutex::new(Some(passive_rebalance_rx)),
            event_tx,
            event_rx: tokio::sync::Mutex::new(Some(event_rx)),
            transaction_tx,
            transaction_rx: tokio::sync::Mutex::new(Some(transaction_rx)),
            rebalance_tx,
            rebalance_rx: tokio::sync::Mutex::new(Some(rebalance_rx)),
        }
    }

    pub fn market_update_sender(&self) -> broadcast::Sender<String> {
        self.market_update_tx.clone()
    }

    pub fn subscribe_market_update(&self) -> broadcast::Receiver<String> {
        self.market_update_tx.subscribe()
    }

    pub fn publish_market_update(&self, symbol: String) {
        // Fire-and-forget: no subscribers is a valid, common state at startup.
        let _ = self.market_update_tx.send(symbol);
    }

    pub fn strategy_update_sender(&self) -> broadcast::Sender<StrategyUpdate> {
        self.strategy_update_tx.clone()
    }

    pub fn subscribe_strategy_update(&self) -> broadcast::Receiver<StrategyUpdate> {
        self.strategy_update_tx.subscribe()
    }

    pub fn publish_strategy_update(&self, update: StrategyUpdate) {
        let _ = self.strategy_update_tx.send(update);
    }

    pub fn trade_sender(&self) -> mpsc::UnboundedSender<ArbitrageOpportunity> {
        self.trade_tx.clone()
    }

    pub async fn take_trade_receiver(&self) -> Option<mpsc::UnboundedReceiver<ArbitrageOpportunity>> {
        self.trade_rx.lock().await.take()
    }

    pub fn passive_rebalance_sender(&self) -> mpsc::UnboundedSender<ArbitrageOpportunity> {
        self.passive_rebalance_tx.clone()
    }

    pub async fn take_passive_rebalance_receiver(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<ArbitrageOpportunity>> {
        self.passive_rebalance_rx.lock().await.take()
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<ArbitrageEvent> {
        self.event_tx.clone()
    }

    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ArbitrageEvent>> {
        self.event_rx.lock().await.take()
    }

    pub fn transaction_sender(&self) -> mpsc::UnboundedSender<Transaction> {
        self.transaction_tx.clone()
    }

    pub async fn take_transaction_receiver(&self) -> Option<mpsc::UnboundedReceiver<Transaction>> {
        self.transaction_rx.lock().await.take()
    }

    pub fn rebalance_sender(&self) -> mpsc::UnboundedSender<RebalanceProposal> {
        self.rebalance_tx.clone()
    }

    pub async fn take_rebalance_receiver(&self) -> Option<mpsc::UnboundedReceiver<RebalanceProposal>> {
        self.rebalance_rx.lock().await.take()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}
