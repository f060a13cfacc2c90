//! Adaptive strategy controller (spec.md §4.G): recomputes the live
//! min-profit threshold from the current hour's heatmap detail on a
//! recurring timer, or on explicit trigger, and pushes the decision onto
//! `StrategyUpdateCh`. Breaks the Detector/StatsEngine cycle the teacher's
//! `risk.rs` describes as "no component owns the other — only channels do".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::HeatmapCell;
use crate::persistence::StatePersistence;

const HIGH_VOLATILITY_THRESHOLD: f64 = 0.7;
const LOW_VOLATILITY_THRESHOLD: f64 = 0.2;

const HIGH_ACTIVITY_PCT: f64 = 0.05;
const QUIET_MARKET_PCT: f64 = 0.15;
const BALANCED_PCT: f64 = 0.10;

/// The stability-score component has no per-row stored direction-switch
/// count in this fast path; spec.md §9 permits retaining a constant here
/// absent raw per-event replay.
const STABILITY_SCORE_PLACEHOLDER: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyUpdate {
    pub new_threshold: f64,
    pub reason: String,
    pub volatility_score: f64,
    pub timestamp: DateTime<Utc>,
}

/// Inputs the controller needs to score "this hour's" activity, carried by
/// the caller (typically read fresh from the StatsEngine heatmap) rather
/// than owned by the controller itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct HourActivityInputs {
    pub event_count: u64,
    pub max_hourly_count: u64,
    pub avg_spread_percent: f64,
    pub sum_depth: f64,
}

impl HourActivityInputs {
    pub fn from_cell(cell: &HeatmapCell, max_hourly_count: u64, sum_depth: f64) -> Self {
        Self {
            event_count: cell.event_count,
            max_hourly_count,
            avg_spread_percent: cell.avg_spread_percent,
            sum_depth,
        }
    }
}

pub struct StrategyController {
    state: std::sync::Arc<StatePersistence>,
}

impl StrategyController {
    pub fn new(state: std::sync::Arc<StatePersistence>) -> Self {
        Self { state }
    }

    /// Computes and returns the next `StrategyUpdate`; caller is
    /// responsible for publishing it on `StrategyUpdateCh`.
    pub fn evaluate(&self, inputs: HourActivityInputs, now: DateTime<Utc>) -> StrategyUpdate {
        let app_state = self.state.read();

        if !app_state.is_smart_strategy_enabled {
            return StrategyUpdate {
                new_threshold: app_state.min_profit_threshold,
                reason: "Manual Mode".to_string(),
                volatility_score: volatility_score(inputs),
                timestamp: now,
            };
        }

        let score = volatility_score(inputs);
        let (new_threshold, reason) = if score >= HIGH_VOLATILITY_THRESHOLD {
            (HIGH_ACTIVITY_PCT, "High activity detected, tightening threshold".to_string())
        } else if score < LOW_VOLATILITY_THRESHOLD {
            (QUIET_MARKET_PCT, "Quiet market, relaxing threshold".to_string())
        } else {
            (BALANCED_PCT, "Balanced conditions, standard threshold".to_string())
        };

        info!(volatility_score = score, new_threshold, "strategy threshold recomputed");
        StrategyUpdate {
            new_threshold,
            reason,
            volatility_score: score,
            timestamp: now,
        }
    }
}

/// `0.4·countScore + 0.3·spreadScore + 0.2·depthScore + 0.1·stabilityScore`,
/// each component normalized to `[0,1]`.
fn volatility_score(inputs: HourActivityInputs) -> f64 {
    let count_score = if inputs.max_hourly_count == 0 {
        0.0
    } else {
        (inputs.event_count as f64 / inputs.max_hourly_count as f64).clamp(0.0, 1.0)
    };
    let spread_score = (inputs.avg_spread_percent / 100.0 / 0.01).clamp(0.0, 1.0);
    let depth_score = (inputs.sum_depth / inputs.event_count.max(1) as f64 / 1000.0).clamp(0.0, 1.0);

    0.4 * count_score + 0.3 * spread_score + 0.2 * depth_score + 0.1 * STABILITY_SCORE_PLACEHOLDER
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn controller() -> (StrategyController, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let state = std::sync::Arc::new(StatePersistence::load(dir.path().join("appstate.json")));
        (StrategyController::new(state), dir)
    }

    #[test]
    fn high_activity_tightens_threshold() {
        let (controller, _dir) = controller();
        let inputs = HourActivityInputs {
            event_count: 100,
            max_hourly_count: 100,
            avg_spread_percent: 2.0,
            sum_depth: 2000.0,
        };
        let update = controller.evaluate(inputs, Utc::now());
        assert_eq!(update.new_threshold, HIGH_ACTIVITY_PCT);
    }

    #[test]
    fn quiet_market_relaxes_threshold() {
        let (controller, _dir) = controller();
        let inputs = HourActivityInputs {
            event_count: 1,
            max_hourly_count: 100,
            avg_spread_percent: 0.0,
            sum_depth: 0.0,
        };
        let update = controller.evaluate(inputs, Utc::now());
        assert_eq!(update.new_threshold, QUIET_MARKET_PCT);
    }

    #[test]
    fn manual_mode_uses_user_threshold() {
        let (controller, _dir) = controller();
        controller
            .state
            .update(|s| {
                s.is_smart_strategy_enabled = false;
                s.min_profit_threshold = 0.33;
            })
            .unwrap();
        let update = controller.evaluate(HourActivityInputs::default(), Utc::now());
        assert_eq!(update.new_threshold, 0.33);
        assert_eq!(update.reason, "Manual Mode");
    }
}
