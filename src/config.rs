//! Process configuration, sourced from the environment once at startup.
//! Mirrors the teacher's `Config::from_env` pattern: `dotenv` first, then
//! `env::var` with sane fallbacks, never panicking on a missing var.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub app_state_path: String,
    pub http_port: u16,
    pub exchanges: Vec<String>,
    pub pairs: Vec<(String, String)>,
    pub book_poll_interval: Duration,
    pub stats_bootstrap_on_start: bool,
    pub strategy_interval: Duration,
    pub rebalance_interval: Duration,
    pub safety_interval: Duration,
    /// Hard-coded-heuristic minimum notional (USD) for live-mode trade emission,
    /// externalized per spec.md §9's open question.
    pub min_notional_usd: f64,
    /// Staleness threshold for both detection and execution preflight.
    pub staleness_ms: i64,
    pub initial_sandbox_balances: Vec<(String, String)>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let db_path =
            env::var("ARB_DB_PATH").unwrap_or_else(|_| "./arb_engine.db".to_string());
        let app_state_path =
            env::var("ARB_STATE_PATH").unwrap_or_else(|_| "./appstate.json".to_string());
        let http_port = env::var("ARB_HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8090);

        let exchanges = env::var("ARB_EXCHANGES")
            .unwrap_or_else(|_| "Binance,Coinbase".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let pairs = env::var("ARB_PAIRS")
            .unwrap_or_else(|_| "BTC/USD,ETH/USD".to_string())
            .split(',')
            .filter_map(|s| {
                let mut parts = s.trim().splitn(2, '/');
                let base = parts.next()?.trim().to_string();
                let quote = parts.next()?.trim().to_string();
                if base.is_empty() || quote.is_empty() {
                    None
                } else {
                    Some((base, quote))
                }
            })
            .collect();

        let book_poll_interval = Duration::from_millis(
            env::var("ARB_BOOK_POLL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
        );

        let stats_bootstrap_on_start = env::var("ARB_BOOTSTRAP_ON_START")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let strategy_interval = Duration::from_secs(
            env::var("ARB_STRATEGY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15 * 60),
        );
        let rebalance_interval = Duration::from_secs(
            env::var("ARB_REBALANCE_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        );
        let safety_interval = Duration::from_secs(
            env::var("ARB_SAFETY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        );

        let min_notional_usd = env::var("ARB_MIN_NOTIONAL_USD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10.0);

        let staleness_ms = env::var("ARB_STALENESS_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        let initial_sandbox_balances = env::var("ARB_SANDBOX_BALANCES")
            .unwrap_or_else(|_| "USD=100000,BTC=10,ETH=100".to_string())
            .split(',')
            .filter_map(|kv| {
                let mut parts = kv.trim().splitn(2, '=');
                let asset = parts.next()?.trim().to_string();
                let amount = parts.next()?.trim().to_string();
                if asset.is_empty() || amount.is_empty() {
                    None
                } else {
                    Some((asset, amount))
                }
            })
            .collect();

        Ok(Self {
            db_path,
            app_state_path,
            http_port,
            exchanges,
            pairs,
            book_poll_interval,
            stats_bootstrap_on_start,
            strategy_interval,
            rebalance_interval,
            safety_interval,
            min_notional_usd,
            staleness_ms,
            initial_sandbox_balances,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_parse_slash_separated() {
        std::env::set_var("ARB_PAIRS", "BTC/USD, ETH/USDT");
        let cfg = Config::from_env().unwrap();
        assert_eq!(
            cfg.pairs,
            vec![
                ("BTC".to_string(), "USD".to_string()),
                ("ETH".to_string(), "USDT".to_string())
            ]
        );
        std::env::remove_var("ARB_PAIRS");
    }
}
