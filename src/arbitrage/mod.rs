//! Order-book walk + fee-aware net-profit (`calculator`), and the
//! event-driven consumer that turns market updates into opportunities and
//! events (`detector`) — spec.md §4.E/§4.F.

pub mod calculator;
pub mod detector;

pub use calculator::{ArbitrageCalculator, BalanceCap};
pub use detector::ArbitrageDetector;
