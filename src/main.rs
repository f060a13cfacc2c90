//! Process entrypoint: wires every subsystem module together and exposes
//! the thin admin/read HTTP surface, following the teacher's `main.rs`
//! shape of "one `tokio::spawn` per long-lived subsystem, one
//! `CancellationToken` for graceful shutdown".

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use arb_engine_backend::arbitrage::ArbitrageDetector;
use arb_engine_backend::book_provider::{BookProvider, SandboxBookProvider, StreamingBookProvider};
use arb_engine_backend::broadcast::BroadcastHub;
use arb_engine_backend::bus::ChannelBus;
use arb_engine_backend::exchange_client::{
    ClientMode, DualModeClient, ExchangeClient, HttpExchangeClient, SandboxExchangeClient, SandboxState,
};
use arb_engine_backend::executor::OrderExecutor;
use arb_engine_backend::models::{ArbitrageOpportunity, ExecutionStrategy, TradingPair};
use arb_engine_backend::rebalance::{PassiveRebalancer, RebalancingService};
use arb_engine_backend::safety::SafetyMonitor;
use arb_engine_backend::stats::{EventStore, StatsBootstrap, StatsEngine};
use arb_engine_backend::strategy::{HourActivityInputs, StrategyController};
use arb_engine_backend::{Config, StatePersistence};

struct AdminState {
    persistence: Arc<StatePersistence>,
    store: Arc<EventStore>,
    stats: Arc<StatsEngine>,
    detector: Arc<ArbitrageDetector>,
    rebalancing: Arc<RebalancingService>,
    duals: Vec<Arc<DualModeClient>>,
    broadcast: Arc<BroadcastHub>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("arb_engine_backend=info".parse()?))
        .init();

    let config = Config::from_env().context("load configuration")?;
    info!(exchanges = ?config.exchanges, pairs = ?config.pairs, "starting arbitrage engine");

    let persistence = Arc::new(StatePersistence::load(&config.app_state_path));
    let store = Arc::new(EventStore::open(&config.db_path).context("open event store")?);
    let bus = Arc::new(ChannelBus::new());
    let broadcast = Arc::new(BroadcastHub::new());
    let cancel = CancellationToken::new();

    let initial_mode = if persistence.read().is_sandbox_mode {
        ClientMode::Sandbox
    } else {
        ClientMode::Real
    };

    let initial_sandbox_balances: Vec<(String, Decimal)> = config
        .initial_sandbox_balances
        .iter()
        .filter_map(|(asset, amount)| Decimal::from_str(amount).ok().map(|d| (asset.clone(), d)))
        .collect();

    let mut providers: HashMap<String, Arc<dyn BookProvider>> = HashMap::new();
    let mut clients: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
    let mut sandbox_providers: Vec<Arc<SandboxBookProvider>> = Vec::new();
    let mut duals: Vec<Arc<DualModeClient>> = Vec::new();

    for exchange in &config.exchanges {
        let sandbox_provider = SandboxBookProvider::new(exchange.clone());
        for (base, quote) in &config.pairs {
            let pair = TradingPair::new(base.clone(), quote.clone());
            let mid = default_mid(base);
            sandbox_provider.seed(
                pair.symbol(),
                mid,
                Decimal::new(1, 2),
                10,
                Decimal::new(1, 1),
                Decimal::new(1, 2),
            );
        }

        let sandbox_state = SandboxState::new(initial_sandbox_balances.clone());
        let oracle = sandbox_provider.clone();
        let sandbox_client: Arc<dyn ExchangeClient> =
            Arc::new(SandboxExchangeClient::new(exchange.clone(), sandbox_state, oracle));

        let base_url = std::env::var(format!("ARB_REST_URL_{}", exchange.to_uppercase()))
            .unwrap_or_else(|_| format!("https://api.{}.example", exchange.to_lowercase()));
        let real_client: Arc<dyn ExchangeClient> = Arc::new(HttpExchangeClient::new(exchange.clone(), base_url));

        let dual = Arc::new(DualModeClient::new(exchange.clone(), initial_mode, sandbox_client, real_client));
        duals.push(dual.clone());
        clients.insert(exchange.clone(), dual as Arc<dyn ExchangeClient>);

        // A configured websocket feed gets a live streaming BookProvider;
        // otherwise fall back to the deterministic sandbox one so the
        // engine still has order books to detect against.
        match std::env::var(format!("ARB_WS_URL_{}", exchange.to_uppercase())) {
            Ok(url) => {
                let streaming = StreamingBookProvider::spawn(exchange.clone(), url, bus.market_update_sender());
                providers.insert(exchange.clone(), streaming as Arc<dyn BookProvider>);
            }
            Err(_) => {
                providers.insert(exchange.clone(), sandbox_provider.clone() as Arc<dyn BookProvider>);
                sandbox_providers.push(sandbox_provider);
            }
        }
    }

    if config.stats_bootstrap_on_start {
        match StatsBootstrap::run(&store).await {
            Ok(report) => info!(?report, "stats bootstrap complete"),
            Err(e) => warn!(error = %e, "stats bootstrap failed, continuing with live aggregates only"),
        }
    }

    // -- StatsEngine ---------------------------------------------------
    let event_rx = bus.take_event_receiver().await.expect("event receiver taken once");
    let transaction_rx = bus.take_transaction_receiver().await.expect("transaction receiver taken once");
    let stats = Arc::new(StatsEngine::new(Some(store.clone()), broadcast.clone(), event_rx, transaction_rx));
    tokio::spawn(stats.clone().run(cancel.clone()));

    // -- ArbitrageDetector -----------------------------------------------
    let detector = Arc::new(ArbitrageDetector::new(
        providers.clone(),
        clients.clone(),
        persistence.clone(),
        broadcast.clone(),
        bus.subscribe_market_update(),
        bus.subscribe_strategy_update(),
        bus.trade_sender(),
        bus.passive_rebalance_sender(),
        bus.event_sender(),
        config.min_notional_usd,
    ));
    tokio::spawn(detector.clone().run(cancel.clone()));

    // -- OrderExecutor + trade consumer ----------------------------------
    let executor = Arc::new(OrderExecutor::new(
        clients.clone(),
        providers.clone(),
        persistence.clone(),
        broadcast.clone(),
        bus.transaction_sender(),
    ));
    {
        let executor = executor.clone();
        let detector = detector.clone();
        let cancel = cancel.clone();
        let mut trade_rx = bus.take_trade_receiver().await.expect("trade receiver taken once");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    opp = trade_rx.recv() => {
                        match opp {
                            Some(opp) => {
                                let threshold = detector.active_threshold().0;
                                let executor = executor.clone();
                                let cancel = cancel.clone();
                                tokio::spawn(async move {
                                    executor.execute(&opp, threshold, ExecutionStrategy::Sequential, &cancel).await;
                                });
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    // -- RebalancingService + PassiveRebalancer --------------------------
    let rebalancing = Arc::new(RebalancingService::new(clients.clone(), persistence.clone(), bus.rebalance_sender()));
    {
        let rebalancing = rebalancing.clone();
        let cancel = cancel.clone();
        let interval = config.rebalance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = rebalancing.poll().await {
                            warn!(error = %e, "rebalance poll failed");
                        }
                    }
                }
            }
        });
    }

    let passive_rx = bus.take_passive_rebalance_receiver().await.expect("passive receiver taken once");
    let passive_rebalancer = Arc::new(PassiveRebalancer::new(
        rebalancing.clone(),
        executor.clone(),
        persistence.clone(),
        passive_rx,
    ));
    tokio::spawn(passive_rebalancer.run(cancel.clone()));

    // -- SafetyMonitor -----------------------------------------------------
    let safety = Arc::new(SafetyMonitor::new(store.clone(), persistence.clone(), broadcast.clone()));
    tokio::spawn(safety.clone().run(config.safety_interval, cancel.clone()));

    // -- StrategyController --------------------------------------------
    {
        let strategy = StrategyController::new(persistence.clone());
        let store = store.clone();
        let bus = bus.clone();
        let cancel = cancel.clone();
        let interval = config.strategy_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now();
                        let hour_key = format!("{}-{:02}", arb_engine_backend::models::day_short(now), now.format("%H"));
                        let inputs = match store.get_heatmap_cell(&hour_key) {
                            Ok(Some(cell)) => {
                                let max_hourly_count = store
                                    .all_heatmap_cells()
                                    .map(|cells| cells.iter().map(|c| c.event_count).max().unwrap_or(1))
                                    .unwrap_or(1);
                                let sum_depth = store
                                    .get_aggregated_metric(&format!("Hour:{hour_key}"))
                                    .ok()
                                    .flatten()
                                    .map(|m| m.sum_depth)
                                    .unwrap_or(0.0);
                                HourActivityInputs::from_cell(&cell, max_hourly_count.max(1), sum_depth)
                            }
                            _ => HourActivityInputs::default(),
                        };
                        let update = strategy.evaluate(inputs, now);
                        bus.publish_strategy_update(update);
                    }
                }
            }
        });
    }

    // -- Sandbox book tick loop ------------------------------------------
    {
        let bus = bus.clone();
        let sandbox_providers = sandbox_providers.clone();
        let pairs: Vec<String> = config
            .pairs
            .iter()
            .map(|(base, quote)| TradingPair::new(base.clone(), quote.clone()).symbol())
            .collect();
        let cancel = cancel.clone();
        let interval = config.book_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for provider in &sandbox_providers {
                            provider.tick();
                        }
                        for symbol in &pairs {
                            bus.publish_market_update(symbol.clone());
                        }
                    }
                }
            }
        });
    }

    // -- Admin/read HTTP surface -----------------------------------------
    let admin_state = Arc::new(AdminState {
        persistence: persistence.clone(),
        store: store.clone(),
        stats,
        detector,
        rebalancing,
        duals,
        broadcast,
    });

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = Router::new()
        .route("/stats", get(get_stats))
        .route("/opportunities", get(get_opportunities))
        .route("/rebalance/deviations", get(get_deviations))
        .route("/rebalance/proposals", get(get_proposals))
        .route("/toggles/sandbox", post(toggle_sandbox))
        .route("/toggles/auto-trade", post(toggle_auto_trade))
        .route("/toggles/smart-strategy", post(toggle_smart_strategy))
        .route("/toggles/auto-rebalance", post(toggle_auto_rebalance))
        .route("/thresholds/pair", post(set_pair_threshold))
        .route("/safety/limits", post(set_safety_limits))
        .route("/safety/reset", post(reset_kill_switch))
        .route("/export/:day/:hour", get(export_cell_csv))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(admin_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .context("bind admin http listener")?;
    info!(port = config.http_port, "admin surface listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutdown signal received");
    cancel.cancel();
    let _ = server.await;

    Ok(())
}

/// Deterministic seed mid-price per base asset, used only to stand up a
/// plausible sandbox order book at boot; real exchanges report live prices.
fn default_mid(base: &str) -> Decimal {
    match base.to_uppercase().as_str() {
        "BTC" => Decimal::new(5_000_000, 2),
        "ETH" => Decimal::new(300_000, 2),
        "SOL" => Decimal::new(15_000, 2),
        _ => Decimal::new(10_000, 2),
    }
}

async fn get_stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.stats.get_stats() {
        Ok(summary) => Json(json!(summary)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_opportunities(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let opportunities: Vec<ArbitrageOpportunity> = state.detector.recent_opportunities();
    Json(json!({ "opportunities": opportunities, "activeThreshold": state.detector.active_threshold() }))
}

async fn get_deviations(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!(state.rebalancing.get_all_deviations()))
}

async fn get_proposals(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(json!(state.rebalancing.get_proposals()))
}

#[derive(Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn toggle_sandbox(State(state): State<Arc<AdminState>>, Json(body): Json<ToggleBody>) -> impl IntoResponse {
    let _ = state.persistence.update(|s| s.is_sandbox_mode = body.enabled);
    let mode = if body.enabled { ClientMode::Sandbox } else { ClientMode::Real };
    for dual in &state.duals {
        dual.set_mode(mode);
    }
    state.broadcast.publish("ReceiveSandboxModeUpdate", &json!({ "enabled": body.enabled }));
    StatusCode::NO_CONTENT
}

async fn toggle_auto_trade(State(state): State<Arc<AdminState>>, Json(body): Json<ToggleBody>) -> impl IntoResponse {
    let _ = state.persistence.update(|s| s.is_auto_trade_enabled = body.enabled);
    state.broadcast.publish("ReceiveAutoTradeUpdate", &json!({ "enabled": body.enabled }));
    StatusCode::NO_CONTENT
}

async fn toggle_smart_strategy(State(state): State<Arc<AdminState>>, Json(body): Json<ToggleBody>) -> impl IntoResponse {
    let _ = state.persistence.update(|s| s.is_smart_strategy_enabled = body.enabled);
    StatusCode::NO_CONTENT
}

async fn toggle_auto_rebalance(State(state): State<Arc<AdminState>>, Json(body): Json<ToggleBody>) -> impl IntoResponse {
    let _ = state.persistence.update(|s| s.is_auto_rebalance_enabled = body.enabled);
    state.broadcast.publish("ReceiveAutoRebalanceUpdate", &json!({ "enabled": body.enabled }));
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct PairThresholdBody {
    pair: String,
    threshold: f64,
}

async fn set_pair_threshold(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<PairThresholdBody>,
) -> impl IntoResponse {
    let _ = state.persistence.update(|s| {
        s.pair_thresholds.insert(body.pair.clone(), body.threshold);
    });
    state.broadcast.publish("ReceivePairUpdate", &json!({ "pair": body.pair, "threshold": body.threshold }));
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct SafetyLimitsBody {
    max_drawdown_usd: f64,
    max_consecutive_losses: u32,
}

async fn set_safety_limits(
    State(state): State<Arc<AdminState>>,
    Json(body): Json<SafetyLimitsBody>,
) -> impl IntoResponse {
    let _ = state.persistence.update(|s| {
        s.max_drawdown_usd = body.max_drawdown_usd;
        s.max_consecutive_losses = body.max_consecutive_losses;
    });
    StatusCode::NO_CONTENT
}

async fn reset_kill_switch(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let _ = state.persistence.update(|s| {
        s.is_safety_kill_switch_triggered = false;
        s.kill_switch_reason = None;
    });
    state.broadcast.publish("ReceiveSafetyUpdate", &json!({ "killSwitchTriggered": false }));
    StatusCode::NO_CONTENT
}

async fn export_cell_csv(
    State(state): State<Arc<AdminState>>,
    AxumPath((day, hour)): AxumPath<(String, u32)>,
) -> impl IntoResponse {
    let events = match state.store.events_for_cell(&day, hour) {
        Ok(events) => events,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut csv = String::from("id,pair,direction,spreadPercent,depthBuy,depthSell,timestamp\n");
    for event in events {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            event.id, event.pair, event.direction, event.spread_percent, event.depth_buy, event.depth_sell, event.timestamp.to_rfc3339()
        ));
    }

    (
        StatusCode::OK,
        [("content-type", "text/csv"), ("content-disposition", "attachment; filename=\"cell.csv\"")],
        csv,
    )
        .into_response()
}
