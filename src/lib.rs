//! Cross-exchange spot arbitrage engine: detects, executes, tracks, and
//! rebalances around price dislocations across a configurable set of
//! exchanges. Library crate split from the `arb-engine` binary so the
//! pieces can be exercised independently in tests, mirroring the teacher's
//! `betterbot_backend`/`betterbot` split.

pub mod arbitrage;
pub mod book_provider;
pub mod broadcast;
pub mod bus;
pub mod config;
pub mod exchange_client;
pub mod executor;
pub mod models;
pub mod persistence;
pub mod rebalance;
pub mod safety;
pub mod stats;
pub mod strategy;

pub use config::Config;
pub use persistence::StatePersistence;
