//! Event-driven arbitrage detector (spec.md §4.F). Wakes on every
//! `MarketUpdate(symbol)`, snapshots the latest book per exchange that
//! carries that symbol, and fans the result out to the event stream, the
//! trade channel, or the passive-rebalance channel depending on the
//! computed net profit. Subscribes to `StrategyUpdateCh` to keep its active
//! threshold current without either side owning the other (spec.md §9's
//! "cyclic references ... broken by channels").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::calculator::ArbitrageCalculator;
use crate::book_provider::BookProvider;
use crate::broadcast::BroadcastHub;
use crate::exchange_client::ExchangeClient;
use crate::models::{ArbitrageEvent, ArbitrageOpportunity, FeeSchedule, OrderBookSnapshot};
use crate::persistence::StatePersistence;
use crate::strategy::StrategyUpdate;

/// Heatmap noise clamp: events outside this spread-percent range are never
/// persisted to stats, even though they may still be tradeable.
const HEATMAP_MIN_PCT: f64 = -0.5;
const HEATMAP_MAX_PCT: f64 = 10.0;

/// Passive-rebalance floor: below this, an opportunity isn't worth
/// forwarding to the passive rebalancer at all.
const PASSIVE_FLOOR_PCT: f64 = 0.01;

/// Sandbox mode relaxes the live profit floor for trade emission.
const SANDBOX_PROFIT_FLOOR_PCT: f64 = -0.5;

const RECENT_CAP: usize = 100;

const STALENESS_MS: i64 = 500;

pub struct ArbitrageDetector {
    providers: HashMap<String, Arc<dyn BookProvider>>,
    clients: HashMap<String, Arc<dyn ExchangeClient>>,
    state: Arc<StatePersistence>,
    broadcast: Arc<BroadcastHub>,

    active_threshold: parking_lot::RwLock<(f64, String)>,
    recent: parking_lot::Mutex<VecDeque<ArbitrageOpportunity>>,

    market_update_rx: AsyncMutex<broadcast::Receiver<String>>,
    strategy_update_rx: AsyncMutex<broadcast::Receiver<StrategyUpdate>>,

    trade_tx: mpsc::UnboundedSender<ArbitrageOpportunity>,
    passive_tx: mpsc::UnboundedSender<ArbitrageOpportunity>,
    event_tx: mpsc::UnboundedSender<ArbitrageEvent>,

    min_notional_usd: f64,
}

impl ArbitrageDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: HashMap<String, Arc<dyn BookProvider>>,
        clients: HashMap<String, Arc<dyn ExchangeClient>>,
        state: Arc<StatePersistence>,
        broadcast: Arc<BroadcastHub>,
        market_update_rx: broadcast::Receiver<String>,
        strategy_update_rx: broadcast::Receiver<StrategyUpdate>,
        trade_tx: mpsc::UnboundedSender<ArbitrageOpportunity>,
        passive_tx: mpsc::UnboundedSender<ArbitrageOpportunity>,
        event_tx: mpsc::UnboundedSender<ArbitrageEvent>,
        min_notional_usd: f64,
    ) -> Self {
        let initial_threshold = state.read().min_profit_threshold;
        Self {
            providers,
            clients,
            state,
            broadcast,
            active_threshold: parking_lot::RwLock::new((initial_threshold, "Manual Mode".to_string())),
            recent: parking_lot::Mutex::new(VecDeque::new()),
            market_update_rx: AsyncMutex::new(market_update_rx),
            strategy_update_rx: AsyncMutex::new(strategy_update_rx),
            trade_tx,
            passive_tx,
            event_tx,
            min_notional_usd,
        }
    }

    pub fn active_threshold(&self) -> (f64, String) {
        self.active_threshold.read().clone()
    }

    pub fn recent_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Long-lived task: concurrently drains `MarketUpdate` and
    /// `StrategyUpdateCh` until cancelled. Drives `handle_symbol` on every
    /// market update and atomically swaps the active threshold on every
    /// strategy update.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut market_rx = self.market_update_rx.lock().await;
        let mut strategy_rx = self.strategy_update_rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("arbitrage detector shutting down");
                    break;
                }
                update = strategy_rx.recv() => {
                    match update {
                        Ok(update) => {
                            *self.active_threshold.write() = (update.new_threshold, update.reason.clone());
                            self.broadcast.publish("ReceiveStrategyUpdate", &update);
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                symbol = market_rx.recv() => {
                    match symbol {
                        Ok(symbol) => self.handle_symbol(&symbol).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Core per-tick detection logic, callable directly in tests without
    /// the channel machinery above.
    pub async fn handle_symbol(&self, symbol: &str) {
        let now = Utc::now();

        let mut books: HashMap<String, OrderBookSnapshot> = HashMap::new();
        for (exchange, provider) in &self.providers {
            if let Some(book) = provider.get_order_book(symbol) {
                books.insert(exchange.clone(), book);
            }
        }
        if books.len() < 2 {
            return;
        }

        for (exchange, book) in &books {
            if book.is_stale(now, STALENESS_MS) {
                warn!(symbol, exchange, "Stale order book detected");
                return;
            }
            if !book.is_consistent() {
                warn!(symbol, exchange, "inconsistent order book, skipping tick");
                return;
            }
        }

        let app_state = self.state.read();
        let fees = self.fetch_fees(&books, symbol).await;
        let safe_multiplier = if app_state.safe_balance_multiplier > 0.0 {
            Some(app_state.safe_balance_multiplier)
        } else {
            None
        };

        let threshold = app_state
            .pair_thresholds
            .get(symbol)
            .copied()
            .unwrap_or_else(|| self.active_threshold.read().0);
        let use_taker_fees = app_state.use_taker_fees;
        let is_sandbox_mode = app_state.is_sandbox_mode;
        drop(app_state);

        // spec.md §4.F.3 requires invoking the calculator for every ordered
        // (buyEx, sellEx) pair, not only the single globally-best one, so
        // that opportunities on non-best pairs still reach the heatmap and
        // (if they qualify) the trade/passive-rebalance channels.
        let exchanges: Vec<&String> = books.keys().collect();
        for &buy_exchange in &exchanges {
            for &sell_exchange in &exchanges {
                if buy_exchange == sell_exchange {
                    continue;
                }
                let buy_book = &books[buy_exchange];
                let sell_book = &books[sell_exchange];

                let Some(opp) = ArbitrageCalculator::calculate_pair(
                    symbol,
                    buy_exchange,
                    buy_book,
                    sell_exchange,
                    sell_book,
                    &fees,
                    use_taker_fees,
                    safe_multiplier,
                    &HashMap::new(),
                    is_sandbox_mode,
                    now,
                ) else {
                    continue;
                };

                self.remember(opp.clone());
                self.broadcast.publish("ReceiveOpportunity", &opp);

                let event = ArbitrageEvent::from_opportunity(&opp);
                if event.spread_percent > HEATMAP_MIN_PCT && event.spread_percent <= HEATMAP_MAX_PCT {
                    let _ = self.event_tx.send(event);
                }

                let notional_ok =
                    opp.notional_usd().to_string().parse::<f64>().unwrap_or(0.0) >= self.min_notional_usd
                        || opp.is_sandbox;
                let profit_floor_ok = if opp.is_sandbox {
                    opp.net_profit_pct > SANDBOX_PROFIT_FLOOR_PCT
                } else {
                    opp.net_profit_pct > 0.0
                };

                if opp.net_profit_pct >= threshold && notional_ok && profit_floor_ok {
                    info!(symbol, buy = %opp.buy_exchange, sell = %opp.sell_exchange, net_pct = opp.net_profit_pct, "opportunity routed to trade channel");
                    let _ = self.trade_tx.send(opp);
                } else if opp.net_profit_pct >= PASSIVE_FLOOR_PCT {
                    let _ = self.passive_tx.send(opp);
                }
            }
        }
    }

    async fn fetch_fees(&self, books: &HashMap<String, OrderBookSnapshot>, symbol: &str) -> HashMap<String, FeeSchedule> {
        let mut fees = HashMap::new();
        for exchange in books.keys() {
            if let Some(client) = self.clients.get(exchange) {
                match client.get_spot_fees(symbol).await {
                    Ok(schedule) => {
                        fees.insert(exchange.clone(), schedule);
                    }
                    Err(e) => {
                        warn!(exchange, error = %e, "fee lookup failed, treating as zero-fee for this tick");
                    }
                }
            }
        }
        fees
    }

    /// Keeps at most `RECENT_CAP` samples, one per `(symbol, buyEx, sellEx)`
    /// — a newer sample evicts the older one for the same key.
    fn remember(&self, opp: ArbitrageOpportunity) {
        let mut recent = self.recent.lock();
        recent.retain(|existing| {
            !(existing.symbol == opp.symbol
                && existing.buy_exchange == opp.buy_exchange
                && existing.sell_exchange == opp.sell_exchange)
        });
        recent.push_back(opp);
        while recent.len() > RECENT_CAP {
            recent.pop_front();
        }
    }
}
