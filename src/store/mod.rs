//! SQLite-backed persistence.
//!
//! One database file, three tables: the account directory, the append-only
//! replicated-order log, and the single-row strategy state. All access goes
//! through one shared connection behind a process-wide mutex; every mutation
//! is a single SQL statement, flushed before the call returns.

pub mod accounts;
pub mod orders;
pub mod strategy;

pub use accounts::{Account, AccountRole, AccountStatus, AccountStore};
pub use orders::{OrderLeg, OrderLog, PlacementStatus, ReplicatedOrder};
pub use strategy::{StrategySnapshot, StrategyStore};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY,
    api_key TEXT NOT NULL,
    api_secret TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('master', 'child')),
    capital REAL NOT NULL DEFAULT 0,
    max_capital_usage REAL NOT NULL DEFAULT 0,
    access_token TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    last_updated TEXT
);

CREATE TABLE IF NOT EXISTS replicated_orders (
    id TEXT PRIMARY KEY,
    order_id TEXT,
    child_id TEXT NOT NULL,
    instrument_token INTEGER NOT NULL,
    tradingsymbol TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    leg TEXT NOT NULL CHECK (leg IN ('entry', 'exit')),
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_replicated_orders_child
    ON replicated_orders(child_id, created_at);

CREATE TABLE IF NOT EXISTS strategy_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    active INTEGER NOT NULL DEFAULT 0,
    master_initial_margin REAL,
    frozen_ratios TEXT,
    cycle_started_at TEXT
);

INSERT OR IGNORE INTO strategy_state (id, active) VALUES (1, 0);
";

/// Process-wide handle to the replication database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {path}"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn accounts(&self) -> AccountStore {
        AccountStore::new(self.conn.clone())
    }

    pub fn orders(&self) -> OrderLog {
        OrderLog::new(self.conn.clone())
    }

    pub fn strategy(&self) -> StrategyStore {
        StrategyStore::new(self.conn.clone())
    }
}

/// Canonical timestamp format for everything the database stores: UTC
/// RFC 3339 with fixed microsecond width, so string comparison orders
/// chronologically.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes_strategy_row() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.strategy().is_active().unwrap());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = now_rfc3339();
        let b = now_rfc3339();
        assert_eq!(a.len(), b.len());
        assert!(a <= b);
    }
}
