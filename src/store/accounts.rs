//! Account directory.
//!
//! Read-mostly view over the configured master and child accounts. Writers
//! are the startup config sync, the broker login callback, and the admin
//! cap-limit update; everything serializes on the shared connection mutex
//! and callers get owned snapshots.

use crate::models::AccountConfig;
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountRole {
    Master,
    Child,
}

impl AccountRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountRole::Master => "master",
            AccountRole::Child => "child",
        }
    }

    fn from_db(s: &str) -> Self {
        if s == "master" {
            AccountRole::Master
        } else {
            AccountRole::Child
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Pending,
    Connected,
    Expired,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Connected => "connected",
            AccountStatus::Expired => "expired",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "connected" => AccountStatus::Connected,
            "expired" => AccountStatus::Expired,
            _ => AccountStatus::Pending,
        }
    }
}

/// A brokerage account known to the engine.
#[derive(Debug, Clone)]
pub struct Account {
    pub account_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub role: AccountRole,
    pub capital: f64,
    pub max_capital_usage: f64,
    pub access_token: Option<String>,
    pub status: AccountStatus,
    pub last_updated: Option<String>,
}

impl Account {
    pub fn is_connected(&self) -> bool {
        self.status == AccountStatus::Connected && self.access_token.is_some()
    }
}

pub struct AccountStore {
    conn: Arc<Mutex<Connection>>,
}

impl AccountStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn map_row(row: &Row) -> rusqlite::Result<Account> {
        let role: String = row.get(3)?;
        let status: String = row.get(7)?;
        Ok(Account {
            account_id: row.get(0)?,
            api_key: row.get(1)?,
            api_secret: row.get(2)?,
            role: AccountRole::from_db(&role),
            capital: row.get(4)?,
            max_capital_usage: row.get(5)?,
            access_token: row.get(6)?,
            status: AccountStatus::from_db(&status),
            last_updated: row.get(8)?,
        })
    }

    const SELECT: &'static str = "SELECT account_id, api_key, api_secret, role, capital, \
         max_capital_usage, access_token, status, last_updated FROM accounts";

    pub fn get(&self, account_id: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE account_id = ?1", Self::SELECT))?;
        let mut rows = stmt.query_map([account_id], Self::map_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn master(&self) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE role = 'master' LIMIT 1", Self::SELECT))?;
        let mut rows = stmt.query_map([], Self::map_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn children(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE role = 'child' ORDER BY account_id",
            Self::SELECT
        ))?;
        let accounts = stmt
            .query_map([], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    pub fn all(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY account_id", Self::SELECT))?;
        let accounts = stmt
            .query_map([], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(accounts)
    }

    /// Sync the configured accounts into the directory at startup.
    ///
    /// New accounts are created as `pending` with the configured capital;
    /// existing accounts get their credentials and role refreshed without
    /// touching the session or the broker-reported capital. Accounts no
    /// longer in the configuration are removed.
    pub fn sync_from_config(&self, configs: &[AccountConfig]) -> Result<()> {
        let masters = configs.iter().filter(|c| c.is_master).count();
        if masters > 1 {
            anyhow::bail!("configuration lists {masters} master accounts; at most one is allowed");
        }

        let conn = self.conn.lock();
        let now = super::now_rfc3339();

        for cfg in configs {
            let role = if cfg.is_master { "master" } else { "child" };
            let inserted = conn.execute(
                "INSERT INTO accounts (account_id, api_key, api_secret, role, capital, \
                 max_capital_usage, status, last_updated) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7) \
                 ON CONFLICT(account_id) DO UPDATE SET \
                 api_key = excluded.api_key, api_secret = excluded.api_secret, \
                 role = excluded.role, last_updated = excluded.last_updated",
                params![
                    cfg.account_id,
                    cfg.api_key,
                    cfg.api_secret,
                    role,
                    cfg.capital,
                    cfg.max_capital_usage,
                    now
                ],
            )?;
            if inserted > 0 {
                info!(account = %cfg.account_id, role, "synced configured account");
            }
        }

        // Prune accounts dropped from the configuration.
        if configs.is_empty() {
            conn.execute("DELETE FROM accounts", [])?;
        } else {
            let placeholders = vec!["?"; configs.len()].join(", ");
            let removed = conn.execute(
                &format!("DELETE FROM accounts WHERE account_id NOT IN ({placeholders})"),
                params_from_iter(configs.iter().map(|c| c.account_id.as_str())),
            )?;
            if removed > 0 {
                info!(removed, "pruned accounts absent from configuration");
            }
        }

        Ok(())
    }

    /// Register an account linked through the admin API. Fails if the id is
    /// already known.
    pub fn link(&self, account_id: &str, api_key: &str, api_secret: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let now = super::now_rfc3339();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO accounts (account_id, api_key, api_secret, role, status, last_updated) \
             VALUES (?1, ?2, ?3, 'child', 'pending', ?4)",
            params![account_id, api_key, api_secret, now],
        )?;
        Ok(inserted > 0)
    }

    /// Record a completed broker login: store the token, mark connected, and
    /// refresh the stored capital when a live figure is available.
    pub fn set_session(
        &self,
        account_id: &str,
        access_token: &str,
        capital: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let now = super::now_rfc3339();
        conn.execute(
            "UPDATE accounts SET access_token = ?1, status = 'connected', \
             capital = COALESCE(?2, capital), last_updated = ?3 WHERE account_id = ?4",
            params![access_token, capital, now, account_id],
        )?;
        Ok(())
    }

    pub fn set_status(&self, account_id: &str, status: AccountStatus) -> Result<()> {
        let conn = self.conn.lock();
        let now = super::now_rfc3339();
        conn.execute(
            "UPDATE accounts SET status = ?1, last_updated = ?2 WHERE account_id = ?3",
            params![status.as_str(), now, account_id],
        )?;
        Ok(())
    }

    pub fn set_max_capital_usage(&self, account_id: &str, cap: f64) -> Result<()> {
        let conn = self.conn.lock();
        let now = super::now_rfc3339();
        conn.execute(
            "UPDATE accounts SET max_capital_usage = ?1, last_updated = ?2 WHERE account_id = ?3",
            params![cap, now, account_id],
        )?;
        Ok(())
    }
}
