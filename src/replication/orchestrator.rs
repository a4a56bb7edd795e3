//! Stateful entry/exit detector for the master account.
//!
//! Each tick compares fresh master margins and positions against the
//! previous snapshot and classifies the tick: noop, entry (new completed
//! orders plus a real margin drop), exit (per-token absolute quantity
//! decrease), or emergency sync (durable state says active but the master is
//! flat, i.e. a missed exit across a restart).
//!
//! Exits are detected from position deltas, not order events: brokers report
//! exits with inconsistent order timing and split fills, while the net
//! position is authoritative. Orders only drive entries.

use super::replicator::{ChildReplicator, ExitOrder};
use super::{ReplicationSettings, DEFAULT_EXCHANGE, DEFAULT_PRODUCT};
use crate::broker::types::{Order, Position, TransactionType};
use crate::broker::{BrokerApi, SessionFactory};
use crate::store::{AccountStore, Database, StrategyStore};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Last known master position for one instrument. Symbol and order fields
/// ride along so synthesized exits do not have to guess them.
#[derive(Debug, Clone)]
struct TrackedPosition {
    quantity: i64,
    tradingsymbol: String,
    exchange: Option<String>,
    product: Option<String>,
}

pub struct MasterOrchestrator {
    settings: ReplicationSettings,
    accounts: AccountStore,
    strategy: StrategyStore,
    sessions: Arc<dyn SessionFactory>,
    replicator: ChildReplicator,
    last_margin: f64,
    positions: HashMap<i64, TrackedPosition>,
    last_entry_at: Option<Instant>,
    initialized: bool,
}

impl MasterOrchestrator {
    pub fn new(
        settings: ReplicationSettings,
        db: &Database,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        let replicator = ChildReplicator::new(settings.clone(), db, sessions.clone());
        Self {
            settings,
            accounts: db.accounts(),
            strategy: db.strategy(),
            sessions,
            replicator,
            last_margin: 0.0,
            positions: HashMap::new(),
            last_entry_at: None,
            initialized: false,
        }
    }

    /// Drop the in-memory snapshot; the next tick re-hydrates from the
    /// broker. Used by the admin force-reset.
    pub fn reset(&mut self) {
        self.initialized = false;
        self.positions.clear();
        self.last_entry_at = None;
        info!("orchestrator memory reset; re-hydrating on next tick");
    }

    fn master_session(&self) -> Result<Arc<dyn BrokerApi>> {
        let master = self
            .accounts
            .get(&self.settings.master_id)?
            .with_context(|| format!("master account {} not found", self.settings.master_id))?;
        if !master.is_connected() {
            bail!("master account {} not connected", self.settings.master_id);
        }
        Ok(self.sessions.session(&master)?)
    }

    async fn initialize(&mut self) -> Result<()> {
        let session = self.master_session()?;
        let equity = session.margins().await?.total_equity();

        // Position hydration is best-effort at boot; the emergency-sync
        // check still needs a tick with a successful fetch before it acts.
        let positions = match session.positions().await {
            Ok(net) => snapshot_positions(net),
            Err(e) => {
                warn!("failed to hydrate master positions: {e}");
                HashMap::new()
            }
        };

        self.last_margin = equity;
        self.positions = positions;
        self.initialized = true;
        info!(
            equity,
            positions = self.positions.len(),
            "orchestrator ready"
        );
        Ok(())
    }

    fn within_entry_grace(&self) -> bool {
        self.last_entry_at
            .map(|t| t.elapsed() < self.settings.entry_grace)
            .unwrap_or(false)
    }

    /// One tick of the replication state machine. `new_orders` are the newly
    /// completed master orders since the previous tick, possibly empty.
    ///
    /// Broker failures propagate without mutating local state; the poller
    /// logs them and the next tick retries.
    pub async fn process_tick(&mut self, new_orders: &[Order]) -> Result<()> {
        if !self.initialized {
            return self.initialize().await;
        }

        let session = self.master_session()?;
        let equity = session.margins().await?.total_equity();
        let current = snapshot_positions(session.positions().await?);

        // The positions endpoint lags the orders endpoint right after an
        // entry and may transiently report empty. Inside the grace window an
        // empty snapshot is not trusted: no emergency sync, no exit
        // detection, no snapshot commit.
        let unreliable_flat = current.is_empty() && self.within_entry_grace();

        if unreliable_flat {
            info!("master observed flat within entry grace window; deferring position checks");
        } else {
            // Emergency sync: durable state says a cycle is live but the
            // master holds nothing. The exit event was missed (typically a
            // crash between detection and dispatch); close everything once.
            if self.strategy.is_active()? && current.is_empty() {
                warn!("strategy active but master is flat; dispatching emergency close-all");
                self.replicator.execute_exit(1.0, &[]).await?;
                self.positions.clear();
                self.strategy.clear()?;
                self.last_margin = equity;
                info!("emergency sync complete");
                return Ok(());
            }

            // Exit detection: any instrument whose absolute quantity shrank.
            for (token, prev) in self.positions.clone() {
                let curr_qty = current.get(&token).map(|p| p.quantity).unwrap_or(0);
                if curr_qty.abs() >= prev.quantity.abs() {
                    continue;
                }

                let closed = prev.quantity.abs() - curr_qty.abs();
                let ratio = (closed as f64 / prev.quantity.abs() as f64).clamp(0.0, 1.0);
                info!(
                    token,
                    symbol = %prev.tradingsymbol,
                    prev_qty = prev.quantity,
                    curr_qty,
                    ratio,
                    "exit detected"
                );

                let synthetic = ExitOrder {
                    instrument_token: token,
                    transaction_type: if prev.quantity > 0 {
                        TransactionType::Sell
                    } else {
                        TransactionType::Buy
                    },
                    quantity: closed,
                    tradingsymbol: prev.tradingsymbol.clone(),
                    exchange: prev
                        .exchange
                        .clone()
                        .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
                    product: prev
                        .product
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PRODUCT.to_string()),
                };
                self.replicator.execute_exit(ratio, &[synthetic]).await?;
            }

            // Commit the position snapshot; a fully flat master ends the
            // cycle.
            self.positions = current;
            if self.positions.is_empty() && self.strategy.is_active()? {
                info!("master fully flat; ending strategy cycle");
                self.strategy.clear()?;
            }
        }

        // Entry detection: only order events open positions, and only when
        // the margin actually dropped (mark-to-market noise stays below the
        // threshold).
        if !new_orders.is_empty() {
            let margin_delta = self.last_margin - equity;
            info!(
                old = self.last_margin,
                new = equity,
                delta = margin_delta,
                "master order event"
            );

            if margin_delta < self.settings.entry_margin_threshold {
                info!(
                    delta = margin_delta,
                    threshold = self.settings.entry_margin_threshold,
                    "margin delta below entry threshold; ignoring"
                );
            } else {
                let baseline = self
                    .strategy
                    .master_initial_margin()?
                    .unwrap_or(self.last_margin);
                let allocation_pct = if baseline > 0.0 {
                    margin_delta / baseline
                } else {
                    0.0
                };
                info!(allocation_pct, "entry detected");

                self.replicator
                    .execute_entry(new_orders, Some(self.last_margin))
                    .await?;
                self.last_entry_at = Some(Instant::now());
            }
        } else {
            debug!(equity, "no order events; absorbing mark-to-market drift");
        }

        // Commit the margin baseline so MTM drift between ticks never looks
        // like an entry.
        self.last_margin = equity;
        Ok(())
    }
}

fn snapshot_positions(net: Vec<Position>) -> HashMap<i64, TrackedPosition> {
    net.into_iter()
        .filter(|p| p.quantity != 0)
        .map(|p| {
            (
                p.instrument_token,
                TrackedPosition {
                    quantity: p.quantity,
                    tradingsymbol: p.tradingsymbol,
                    exchange: p.exchange,
                    product: p.product,
                },
            )
        })
        .collect()
}
