//! Append-only log of replicated child orders.
//!
//! Audit trail for every entry/exit the engine mirrored, and in dry-run mode
//! the source of truth for simulated child positions.

use crate::broker::types::TransactionType;
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderLeg {
    Entry,
    Exit,
}

impl OrderLeg {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderLeg::Entry => "entry",
            OrderLeg::Exit => "exit",
        }
    }

    fn from_db(s: &str) -> Self {
        if s == "exit" {
            OrderLeg::Exit
        } else {
            OrderLeg::Entry
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementStatus {
    Simulated,
    Placed,
    Failed,
}

impl PlacementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PlacementStatus::Simulated => "simulated",
            PlacementStatus::Placed => "placed",
            PlacementStatus::Failed => "failed",
        }
    }

    fn from_db(s: &str) -> Self {
        match s {
            "placed" => PlacementStatus::Placed,
            "failed" => PlacementStatus::Failed,
            _ => PlacementStatus::Simulated,
        }
    }
}

/// One replicated order, as appended to the log.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicatedOrder {
    pub id: String,
    pub order_id: Option<String>,
    pub child_id: String,
    pub instrument_token: i64,
    pub tradingsymbol: String,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub leg: OrderLeg,
    pub status: PlacementStatus,
    pub created_at: String,
}

impl ReplicatedOrder {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        child_id: &str,
        instrument_token: i64,
        tradingsymbol: &str,
        transaction_type: TransactionType,
        quantity: i64,
        leg: OrderLeg,
        status: PlacementStatus,
        order_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order_id,
            child_id: child_id.to_string(),
            instrument_token,
            tradingsymbol: tradingsymbol.to_string(),
            transaction_type,
            quantity,
            leg,
            status,
            created_at: super::now_rfc3339(),
        }
    }
}

/// A child position derived from the log in dry-run mode.
#[derive(Debug, Clone)]
pub struct SimulatedPosition {
    pub quantity: i64,
    pub tradingsymbol: String,
}

pub struct OrderLog {
    conn: Arc<Mutex<Connection>>,
}

impl OrderLog {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn map_row(row: &Row) -> rusqlite::Result<ReplicatedOrder> {
        let tx: String = row.get(5)?;
        let transaction_type = TransactionType::parse(&tx).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown transaction type {tx}").into(),
            )
        })?;
        let leg: String = row.get(7)?;
        let status: String = row.get(8)?;
        Ok(ReplicatedOrder {
            id: row.get(0)?,
            order_id: row.get(1)?,
            child_id: row.get(2)?,
            instrument_token: row.get(3)?,
            tradingsymbol: row.get(4)?,
            transaction_type,
            quantity: row.get(6)?,
            leg: OrderLeg::from_db(&leg),
            status: PlacementStatus::from_db(&status),
            created_at: row.get(9)?,
        })
    }

    pub fn append(&self, order: &ReplicatedOrder) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO replicated_orders (id, order_id, child_id, instrument_token, \
             tradingsymbol, transaction_type, quantity, leg, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                order.id,
                order.order_id,
                order.child_id,
                order.instrument_token,
                order.tradingsymbol,
                order.transaction_type.as_str(),
                order.quantity,
                order.leg.as_str(),
                order.status.as_str(),
                order.created_at
            ],
        )?;
        Ok(())
    }

    /// Most recent orders for a child, newest first.
    pub fn for_child(&self, child_id: &str, limit: usize) -> Result<Vec<ReplicatedOrder>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, order_id, child_id, instrument_token, tradingsymbol, \
             transaction_type, quantity, leg, status, created_at \
             FROM replicated_orders WHERE child_id = ?1 \
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let orders = stmt
            .query_map(params![child_id, limit as i64], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(orders)
    }

    /// Net signed quantity per instrument for a child, derived from the log.
    ///
    /// BUY adds, SELL subtracts; failed placements never moved a position and
    /// are excluded. `since` restricts the window to the current cycle.
    pub fn net_positions_since(
        &self,
        child_id: &str,
        since: Option<&str>,
    ) -> Result<HashMap<i64, SimulatedPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT instrument_token, MIN(tradingsymbol), \
             SUM(CASE WHEN transaction_type = 'BUY' THEN quantity ELSE -quantity END) \
             FROM replicated_orders \
             WHERE child_id = ?1 AND status != 'failed' \
             AND (?2 IS NULL OR created_at >= ?2) \
             GROUP BY instrument_token",
        )?;
        let mut positions = HashMap::new();
        let rows = stmt.query_map(params![child_id, since], |row| {
            let token: i64 = row.get(0)?;
            let tradingsymbol: String = row.get(1)?;
            let quantity: i64 = row.get(2)?;
            Ok((token, tradingsymbol, quantity))
        })?;
        for row in rows {
            let (token, tradingsymbol, quantity) = row?;
            if quantity != 0 {
                positions.insert(
                    token,
                    SimulatedPosition {
                        quantity,
                        tradingsymbol,
                    },
                );
            }
        }
        Ok(positions)
    }
}
