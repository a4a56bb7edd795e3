//! Durable strategy state for the active replication cycle.
//!
//! Single-row record: activation flag, master baseline equity, and the
//! per-child frozen ratios. Every mutation is one SQL statement against the
//! row, so a crash leaves either the old or the new state, never a mix.
//! Only the orchestrator clears it; the replicator writes the baseline and
//! the ratios but never flips `active` off.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct StrategySnapshot {
    pub active: bool,
    pub master_initial_margin: Option<f64>,
    pub frozen_ratios: HashMap<String, f64>,
    pub cycle_started_at: Option<String>,
}

pub struct StrategyStore {
    conn: Arc<Mutex<Connection>>,
}

impl StrategyStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn is_active(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let active: i64 = conn.query_row("SELECT active FROM strategy_state WHERE id = 1", [], |r| {
            r.get(0)
        })?;
        Ok(active != 0)
    }

    /// Mark the cycle active. Idempotent.
    pub fn activate(&self) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE strategy_state SET active = 1 WHERE id = 1 AND active = 0",
            [],
        )?;
        if changed > 0 {
            info!("strategy cycle activated");
        }
        Ok(())
    }

    /// Reset to the null state: inactive, no baseline, no ratios.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE strategy_state SET active = 0, master_initial_margin = NULL, \
             frozen_ratios = NULL, cycle_started_at = NULL WHERE id = 1",
            [],
        )?;
        info!("strategy state cleared");
        Ok(())
    }

    pub fn master_initial_margin(&self) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let margin: Option<f64> = conn.query_row(
            "SELECT master_initial_margin FROM strategy_state WHERE id = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(margin)
    }

    /// Record the master equity baseline for the cycle about to start and
    /// stamp the cycle start, so dry-run position derivation has a window
    /// that covers the first entry.
    pub fn set_master_initial_margin(&self, margin: f64) -> Result<()> {
        let conn = self.conn.lock();
        let now = super::now_rfc3339();
        conn.execute(
            "UPDATE strategy_state SET master_initial_margin = ?1, \
             cycle_started_at = COALESCE(cycle_started_at, ?2) WHERE id = 1",
            params![margin, now],
        )?;
        Ok(())
    }

    /// Frozen ratio for a child; 0.0 when absent.
    pub fn frozen_ratio(&self, child_id: &str) -> Result<f64> {
        Ok(self.load_ratios()?.get(child_id).copied().unwrap_or(0.0))
    }

    pub fn set_frozen_ratio(&self, child_id: &str, ratio: f64) -> Result<()> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn.query_row(
            "SELECT frozen_ratios FROM strategy_state WHERE id = 1",
            [],
            |r| r.get(0),
        )?;
        let mut ratios: HashMap<String, f64> = match raw {
            Some(raw) => serde_json::from_str(&raw).context("Corrupt frozen_ratios payload")?,
            None => HashMap::new(),
        };
        ratios.insert(child_id.to_string(), ratio);
        let encoded = serde_json::to_string(&ratios)?;
        conn.execute(
            "UPDATE strategy_state SET frozen_ratios = ?1 WHERE id = 1",
            params![encoded],
        )?;
        Ok(())
    }

    pub fn cycle_start(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let started: Option<String> = conn.query_row(
            "SELECT cycle_started_at FROM strategy_state WHERE id = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(started)
    }

    pub fn snapshot(&self) -> Result<StrategySnapshot> {
        let conn = self.conn.lock();
        let (active, margin, raw, started): (i64, Option<f64>, Option<String>, Option<String>) =
            conn.query_row(
                "SELECT active, master_initial_margin, frozen_ratios, cycle_started_at \
                 FROM strategy_state WHERE id = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )?;
        let frozen_ratios = match raw {
            Some(raw) => serde_json::from_str(&raw).context("Corrupt frozen_ratios payload")?,
            None => HashMap::new(),
        };
        Ok(StrategySnapshot {
            active: active != 0,
            master_initial_margin: margin,
            frozen_ratios,
            cycle_started_at: started,
        })
    }

    fn load_ratios(&self) -> Result<HashMap<String, f64>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn.query_row(
            "SELECT frozen_ratios FROM strategy_state WHERE id = 1",
            [],
            |r| r.get(0),
        )?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).context("Corrupt frozen_ratios payload"),
            None => Ok(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[test]
    fn test_defaults_to_null_state() {
        let db = Database::open_in_memory().unwrap();
        let strategy = db.strategy();
        assert!(!strategy.is_active().unwrap());
        assert!(strategy.master_initial_margin().unwrap().is_none());
        assert_eq!(strategy.frozen_ratio("CHILD_A").unwrap(), 0.0);
        assert!(strategy.cycle_start().unwrap().is_none());
    }

    #[test]
    fn test_activate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let strategy = db.strategy();
        strategy.activate().unwrap();
        strategy.activate().unwrap();
        assert!(strategy.is_active().unwrap());
    }

    #[test]
    fn test_frozen_ratios_expand_without_clobbering() {
        let db = Database::open_in_memory().unwrap();
        let strategy = db.strategy();
        strategy.set_frozen_ratio("CHILD_A", 0.1).unwrap();
        strategy.set_frozen_ratio("CHILD_B", 1.0).unwrap();

        assert_eq!(strategy.frozen_ratio("CHILD_A").unwrap(), 0.1);
        assert_eq!(strategy.frozen_ratio("CHILD_B").unwrap(), 1.0);
        assert_eq!(strategy.frozen_ratio("CHILD_C").unwrap(), 0.0);
    }

    #[test]
    fn test_clear_restores_null_state() {
        let db = Database::open_in_memory().unwrap();
        let strategy = db.strategy();
        strategy.set_master_initial_margin(3_700_000.0).unwrap();
        strategy.set_frozen_ratio("CHILD_A", 0.1).unwrap();
        strategy.activate().unwrap();

        strategy.clear().unwrap();

        let snapshot = strategy.snapshot().unwrap();
        assert!(!snapshot.active);
        assert!(snapshot.master_initial_margin.is_none());
        assert!(snapshot.frozen_ratios.is_empty());
        assert!(snapshot.cycle_started_at.is_none());
    }

    #[test]
    fn test_cycle_start_stamped_once_per_cycle() {
        let db = Database::open_in_memory().unwrap();
        let strategy = db.strategy();
        strategy.set_master_initial_margin(1_000_000.0).unwrap();
        let first = strategy.cycle_start().unwrap().unwrap();

        // A later baseline rewrite inside the same cycle keeps the start.
        strategy.set_master_initial_margin(2_000_000.0).unwrap();
        assert_eq!(strategy.cycle_start().unwrap().unwrap(), first);

        strategy.clear().unwrap();
        strategy.set_master_initial_margin(500_000.0).unwrap();
        assert!(strategy.cycle_start().unwrap().is_some());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::open(path).unwrap();
            let strategy = db.strategy();
            strategy.set_master_initial_margin(3_700_000.0).unwrap();
            strategy.set_frozen_ratio("CHILD_A", 0.1).unwrap();
            strategy.activate().unwrap();
        }

        let db = Database::open(path).unwrap();
        let strategy = db.strategy();
        assert!(strategy.is_active().unwrap());
        assert_eq!(strategy.master_initial_margin().unwrap(), Some(3_700_000.0));
        assert_eq!(strategy.frozen_ratio("CHILD_A").unwrap(), 0.1);
    }
}
