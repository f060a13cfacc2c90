//! `AppState` durability (spec.md §4.N): a single JSON document, read
//! lock-free and written atomically (write-to-temp, then rename). A load
//! failure at startup falls back to defaults rather than refusing to boot.

use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::models::AppState;

pub struct StatePersistence {
    path: PathBuf,
    state: RwLock<AppState>,
}

impl StatePersistence {
    /// Loads `path` if it exists and parses; any failure (missing file,
    /// corrupt JSON) logs and falls back to `AppState::default()`.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to parse app state, using defaults");
                    AppState::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "no existing app state, starting from defaults");
                AppState::default()
            }
        };
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub fn read(&self) -> AppState {
        self.state.read().clone()
    }

    /// Applies `mutator` to the in-memory state under the write lock, then
    /// persists the result. On write failure the in-memory state still
    /// reflects the mutation; only durability is lost, and it is logged.
    pub fn update(&self, mutator: impl FnOnce(&mut AppState)) -> Result<()> {
        let snapshot = {
            let mut guard = self.state.write();
            mutator(&mut guard);
            guard.clone()
        };
        if let Err(e) = self.persist(&snapshot) {
            error!(path = %self.path.display(), error = %e, "failed to persist app state");
        }
        Ok(())
    }

    fn persist(&self, state: &AppState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("serialize app state")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).context("write temp app state file")?;
        std::fs::rename(&tmp_path, &self.path).context("rename temp app state file into place")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::load(dir.path().join("appstate.json"));
        let state = persistence.read();
        assert!(state.is_sandbox_mode);
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appstate.json");
        let persistence = StatePersistence::load(&path);
        persistence
            .update(|s| {
                s.is_auto_trade_enabled = true;
                s.min_profit_threshold = 0.25;
            })
            .unwrap();

        let reloaded = StatePersistence::load(&path);
        let state = reloaded.read();
        assert!(state.is_auto_trade_enabled);
        assert_eq!(state.min_profit_threshold, 0.25);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appstate.json");
        std::fs::write(&path, "{ not json").unwrap();
        let persistence = StatePersistence::load(&path);
        assert!(!persistence.read().is_safety_kill_switch_triggered);
    }
}
