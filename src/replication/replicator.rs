//! Per-child replication of master entries and exits.
//!
//! Entries scale the master quantity by each child's frozen ratio, quantized
//! to whole lots. Exits reduce each child's open position by the master's
//! exit ratio; at ratio >= 0.99 the full position is swept without lot
//! rounding. Failures on one child never abort the others, and nothing here
//! flips the strategy's active flag off.

use super::instruments::{aggregate_orders, lot_size};
use super::{ReplicationSettings, DEFAULT_EXCHANGE, DEFAULT_PRODUCT, FULL_EXIT_RATIO};
use crate::broker::types::{Order, OrderParams, TransactionType};
use crate::broker::{BrokerApi, SessionFactory};
use crate::store::accounts::Account;
use crate::store::{
    AccountStore, Database, OrderLeg, OrderLog, PlacementStatus, ReplicatedOrder, StrategyStore,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Exit instruction targeting one instrument.
#[derive(Debug, Clone)]
pub struct ExitOrder {
    pub instrument_token: i64,
    pub transaction_type: TransactionType,
    pub quantity: i64,
    pub tradingsymbol: String,
    pub exchange: String,
    pub product: String,
}

/// A child's open position while an exit is being applied.
struct OpenPosition {
    quantity: i64,
    tradingsymbol: String,
    exchange: Option<String>,
    product: Option<String>,
}

pub struct ChildReplicator {
    accounts: AccountStore,
    order_log: OrderLog,
    strategy: StrategyStore,
    sessions: Arc<dyn SessionFactory>,
    settings: ReplicationSettings,
}

impl ChildReplicator {
    pub fn new(
        settings: ReplicationSettings,
        db: &Database,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            accounts: db.accounts(),
            order_log: db.orders(),
            strategy: db.strategy(),
            sessions,
            settings,
        }
    }

    /// Replicate a batch of newly completed master entry orders.
    ///
    /// `master_pre_trade_equity` is the master's equity sampled before the
    /// margin drop; on the first entry of a cycle it becomes the frozen-ratio
    /// denominator. When the caller could not supply it, a fresh (post-trade)
    /// fetch is the fallback.
    pub async fn execute_entry(
        &self,
        orders: &[Order],
        master_pre_trade_equity: Option<f64>,
    ) -> Result<()> {
        let orders = aggregate_orders(orders);
        if orders.is_empty() {
            return Ok(());
        }
        info!(orders = orders.len(), "replicating entry");

        let cycle_active = self.strategy.is_active()?;
        if !cycle_active {
            let baseline = match master_pre_trade_equity.filter(|m| *m > 0.0) {
                Some(equity) => equity,
                None => match self.fetch_master_equity().await {
                    Ok(equity) => {
                        warn!(equity, "pre-trade equity unavailable; using post-trade fetch");
                        equity
                    }
                    Err(e) => {
                        warn!("failed to fetch master equity for baseline: {e:#}");
                        0.0
                    }
                },
            };
            self.strategy.set_master_initial_margin(baseline)?;
            info!(baseline, "cycle baseline recorded");
        }

        let children = self.accounts.children()?;
        if children.is_empty() {
            warn!("no child accounts configured; nothing to replicate");
            return Ok(());
        }

        for child in &children {
            if let Err(e) = self.entry_for_child(child, &orders, cycle_active).await {
                error!(child = %child.account_id, "entry replication failed: {e:#}");
            }
        }

        if !cycle_active {
            self.strategy.activate()?;
        }
        Ok(())
    }

    async fn entry_for_child(
        &self,
        child: &Account,
        orders: &[Order],
        cycle_active: bool,
    ) -> Result<()> {
        let ratio = if cycle_active {
            let ratio = self.strategy.frozen_ratio(&child.account_id)?;
            debug!(child = %child.account_id, ratio, "using frozen ratio");
            ratio
        } else {
            let mut equity = self.child_equity(child).await;
            if child.max_capital_usage > 0.0 && equity > child.max_capital_usage {
                info!(
                    child = %child.account_id,
                    equity,
                    cap = child.max_capital_usage,
                    "capping child capital"
                );
                equity = child.max_capital_usage;
            }

            let baseline = self.strategy.master_initial_margin()?.unwrap_or(0.0);
            let mut ratio = if baseline > 0.0 { equity / baseline } else { 0.0 };
            if ratio > 1.0 {
                warn!(child = %child.account_id, ratio, "ratio clamped to 1.0");
                ratio = 1.0;
            }
            self.strategy.set_frozen_ratio(&child.account_id, ratio)?;
            info!(child = %child.account_id, equity, baseline, ratio, "frozen ratio recorded");
            ratio
        };

        for order in orders {
            if order.quantity == 0 {
                continue;
            }
            let lot = lot_size(&order.tradingsymbol, self.settings.index_lot_size);
            let master_lots = order.quantity as f64 / lot as f64;
            let child_lots = (master_lots * ratio).floor() as i64;
            let child_qty = child_lots * lot;

            info!(
                child = %child.account_id,
                symbol = %order.tradingsymbol,
                master_lots,
                ratio,
                child_qty,
                "entry sizing"
            );

            if child_qty == 0 {
                debug!(child = %child.account_id, symbol = %order.tradingsymbol, "scaled to zero lots, skipping");
                continue;
            }

            self.place_for_child(
                child,
                order.instrument_token,
                &order.tradingsymbol,
                &order.exchange,
                &order.product,
                order.transaction_type,
                child_qty,
                OrderLeg::Entry,
            )
            .await?;
        }
        Ok(())
    }

    /// Apply a master exit to every child.
    ///
    /// An empty `orders` list with a full exit ratio means close-all: one
    /// synthesized target per open child position.
    pub async fn execute_exit(&self, exit_ratio: f64, orders: &[ExitOrder]) -> Result<()> {
        let exit_ratio = exit_ratio.clamp(0.0, 1.0);
        info!(ratio = exit_ratio, targets = orders.len(), "replicating exit");

        let children = self.accounts.children()?;
        for child in &children {
            if let Err(e) = self.exit_for_child(child, exit_ratio, orders).await {
                error!(child = %child.account_id, "exit replication failed: {e:#}");
            }
        }
        Ok(())
    }

    async fn exit_for_child(
        &self,
        child: &Account,
        exit_ratio: f64,
        orders: &[ExitOrder],
    ) -> Result<()> {
        let mut open = self.open_positions(child).await?;

        let close_all = orders.is_empty() && exit_ratio >= FULL_EXIT_RATIO;
        let targets: Vec<ExitOrder> = if close_all {
            info!(child = %child.account_id, positions = open.len(), "close-all sweep");
            open.iter()
                .filter(|(_, p)| p.quantity != 0)
                .map(|(&token, p)| ExitOrder {
                    instrument_token: token,
                    transaction_type: if p.quantity > 0 {
                        TransactionType::Sell
                    } else {
                        TransactionType::Buy
                    },
                    quantity: p.quantity.abs(),
                    tradingsymbol: p.tradingsymbol.clone(),
                    exchange: p
                        .exchange
                        .clone()
                        .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
                    product: p
                        .product
                        .clone()
                        .unwrap_or_else(|| DEFAULT_PRODUCT.to_string()),
                })
                .collect()
        } else {
            orders.to_vec()
        };

        for target in &targets {
            let open_qty = open
                .get(&target.instrument_token)
                .map(|p| p.quantity)
                .unwrap_or(0);
            if open_qty == 0 {
                debug!(
                    child = %child.account_id,
                    symbol = %target.tradingsymbol,
                    "no open position, skipping exit"
                );
                continue;
            }

            let lot = lot_size(&target.tradingsymbol, self.settings.index_lot_size);
            let mut exit_qty = if exit_ratio >= FULL_EXIT_RATIO {
                // Full sweep: exact open quantity, no lot rounding.
                open_qty.abs()
            } else {
                let raw = open_qty.abs() as f64 * exit_ratio;
                ((raw / lot as f64).floor() as i64) * lot
            };
            if exit_qty == 0 {
                debug!(
                    child = %child.account_id,
                    open_qty,
                    ratio = exit_ratio,
                    "exit rounds to zero lots, skipping"
                );
                continue;
            }
            if exit_qty > open_qty.abs() {
                exit_qty = open_qty.abs();
            }

            info!(
                child = %child.account_id,
                symbol = %target.tradingsymbol,
                open_qty,
                ratio = exit_ratio,
                exit_qty,
                "exit sizing"
            );

            // Decrement toward zero so a second target on the same token
            // cannot double-count what this one already closed.
            let remaining = open_qty.abs() - exit_qty;
            if let Some(position) = open.get_mut(&target.instrument_token) {
                position.quantity = if open_qty > 0 { remaining } else { -remaining };
            }

            self.place_for_child(
                child,
                target.instrument_token,
                &target.tradingsymbol,
                &target.exchange,
                &target.product,
                target.transaction_type,
                exit_qty,
                OrderLeg::Exit,
            )
            .await?;
        }
        Ok(())
    }

    /// The child's open positions: derived from the order log within the
    /// current cycle in dry-run mode, fetched live otherwise.
    async fn open_positions(&self, child: &Account) -> Result<HashMap<i64, OpenPosition>> {
        if self.settings.dry_run {
            let since = self.strategy.cycle_start()?;
            let simulated = self
                .order_log
                .net_positions_since(&child.account_id, since.as_deref())?;
            return Ok(simulated
                .into_iter()
                .map(|(token, p)| {
                    (
                        token,
                        OpenPosition {
                            quantity: p.quantity,
                            tradingsymbol: p.tradingsymbol,
                            exchange: None,
                            product: None,
                        },
                    )
                })
                .collect());
        }

        if !child.is_connected() {
            warn!(child = %child.account_id, "not connected, treating as flat");
            return Ok(HashMap::new());
        }
        let session = self.sessions.session(child)?;
        let net = session.positions().await?;
        Ok(net
            .into_iter()
            .filter(|p| p.quantity != 0)
            .map(|p| {
                (
                    p.instrument_token,
                    OpenPosition {
                        quantity: p.quantity,
                        tradingsymbol: p.tradingsymbol,
                        exchange: p.exchange,
                        product: p.product,
                    },
                )
            })
            .collect())
    }

    /// Child equity used for the frozen-ratio numerator: the stored capital
    /// in dry-run mode, live total equity otherwise (stored capital as the
    /// fallback when the fetch fails).
    async fn child_equity(&self, child: &Account) -> f64 {
        if self.settings.dry_run {
            return child.capital;
        }
        match self.sessions.session(child) {
            Ok(session) => match session.margins().await {
                Ok(margins) => {
                    let equity = margins.total_equity();
                    if equity > 0.0 {
                        equity
                    } else {
                        child.capital
                    }
                }
                Err(e) => {
                    warn!(
                        child = %child.account_id,
                        "live equity fetch failed ({e}); using stored capital"
                    );
                    child.capital
                }
            },
            Err(e) => {
                warn!(
                    child = %child.account_id,
                    "no broker session ({e}); using stored capital"
                );
                child.capital
            }
        }
    }

    async fn fetch_master_equity(&self) -> Result<f64> {
        let master = self
            .accounts
            .get(&self.settings.master_id)?
            .with_context(|| format!("master account {} not found", self.settings.master_id))?;
        let session = self.sessions.session(&master)?;
        Ok(session.margins().await?.total_equity())
    }

    /// Place one child order, or record it as simulated in dry-run mode.
    /// Placement rejections are logged and recorded; they never propagate.
    #[allow(clippy::too_many_arguments)]
    async fn place_for_child(
        &self,
        child: &Account,
        instrument_token: i64,
        tradingsymbol: &str,
        exchange: &str,
        product: &str,
        transaction_type: TransactionType,
        quantity: i64,
        leg: OrderLeg,
    ) -> Result<()> {
        if self.settings.dry_run {
            info!(
                child = %child.account_id,
                "[dry run] {} {} x{}",
                transaction_type,
                tradingsymbol,
                quantity
            );
            self.order_log.append(&ReplicatedOrder::record(
                &child.account_id,
                instrument_token,
                tradingsymbol,
                transaction_type,
                quantity,
                leg,
                PlacementStatus::Simulated,
                None,
            ))?;
            return Ok(());
        }

        let session = match self.sessions.session(child) {
            Ok(session) => session,
            Err(e) => {
                error!(child = %child.account_id, "no broker session for placement: {e}");
                self.order_log.append(&ReplicatedOrder::record(
                    &child.account_id,
                    instrument_token,
                    tradingsymbol,
                    transaction_type,
                    quantity,
                    leg,
                    PlacementStatus::Failed,
                    None,
                ))?;
                return Ok(());
            }
        };

        let params = OrderParams::market(
            tradingsymbol,
            if exchange.is_empty() {
                DEFAULT_EXCHANGE
            } else {
                exchange
            },
            transaction_type,
            quantity,
            if product.is_empty() {
                DEFAULT_PRODUCT
            } else {
                product
            },
        );

        match session.place_order(&params).await {
            Ok(order_id) => {
                info!(
                    child = %child.account_id,
                    order_id = %order_id,
                    "{} {} x{} placed",
                    transaction_type,
                    tradingsymbol,
                    quantity
                );
                self.order_log.append(&ReplicatedOrder::record(
                    &child.account_id,
                    instrument_token,
                    tradingsymbol,
                    transaction_type,
                    quantity,
                    leg,
                    PlacementStatus::Placed,
                    Some(order_id),
                ))?;
            }
            Err(e) => {
                error!(
                    child = %child.account_id,
                    "{} {} x{} failed: {e}",
                    transaction_type,
                    tradingsymbol,
                    quantity
                );
                self.order_log.append(&ReplicatedOrder::record(
                    &child.account_id,
                    instrument_token,
                    tradingsymbol,
                    transaction_type,
                    quantity,
                    leg,
                    PlacementStatus::Failed,
                    None,
                ))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::{complete_order, MockSessions};
    use crate::models::AccountConfig;
    use std::time::Duration;

    const NIFTY: i64 = 256265;

    fn settings(dry_run: bool) -> ReplicationSettings {
        ReplicationSettings {
            master_id: "MASTER1".to_string(),
            dry_run,
            index_lot_size: 65,
            entry_margin_threshold: 500.0,
            entry_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
        }
    }

    fn account(account_id: &str, is_master: bool, capital: f64, cap: f64) -> AccountConfig {
        AccountConfig {
            account_id: account_id.to_string(),
            api_key: format!("{account_id}_key"),
            api_secret: format!("{account_id}_secret"),
            is_master,
            capital,
            max_capital_usage: cap,
        }
    }

    fn harness(children: &[AccountConfig], dry_run: bool) -> (Database, Arc<MockSessions>, ChildReplicator) {
        let db = Database::open_in_memory().unwrap();
        let mut configs = vec![account("MASTER1", true, 3_700_000.0, 0.0)];
        configs.extend_from_slice(children);
        db.accounts().sync_from_config(&configs).unwrap();

        let sessions = Arc::new(MockSessions::new());
        let replicator = ChildReplicator::new(settings(dry_run), &db, sessions.clone());
        (db, sessions, replicator)
    }

    fn simulated(db: &Database, child: &str) -> Vec<ReplicatedOrder> {
        let mut orders = db.orders().for_child(child, 100).unwrap();
        orders.reverse(); // oldest first
        orders
    }

    #[tokio::test]
    async fn test_cold_start_entry_freezes_ratio() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 370_000.0, 0.0)], true);

        let orders = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator.execute_entry(&orders, Some(3_700_000.0)).await.unwrap();

        let strategy = db.strategy();
        assert!(strategy.is_active().unwrap());
        assert_eq!(strategy.master_initial_margin().unwrap(), Some(3_700_000.0));
        assert_eq!(strategy.frozen_ratio("CHILD_A").unwrap(), 0.1);

        let orders = simulated(&db, "CHILD_A");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].quantity, 65);
        assert_eq!(orders[0].transaction_type, TransactionType::Buy);
        assert_eq!(orders[0].leg, OrderLeg::Entry);
        assert_eq!(orders[0].status, PlacementStatus::Simulated);
    }

    #[tokio::test]
    async fn test_ratio_clamped_at_one() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 5_000_000.0, 0.0)], true);

        let orders = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator.execute_entry(&orders, Some(3_700_000.0)).await.unwrap();

        assert_eq!(db.strategy().frozen_ratio("CHILD_A").unwrap(), 1.0);
        let orders = simulated(&db, "CHILD_A");
        assert_eq!(orders[0].quantity, 650);
    }

    #[tokio::test]
    async fn test_capital_cap_applies_before_ratio() {
        let (db, _, replicator) =
            harness(&[account("CHILD_A", false, 1_000_000.0, 200_000.0)], true);

        let orders = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 1300)];
        replicator.execute_entry(&orders, Some(2_000_000.0)).await.unwrap();

        assert_eq!(db.strategy().frozen_ratio("CHILD_A").unwrap(), 0.1);
        let orders = simulated(&db, "CHILD_A");
        assert_eq!(orders[0].quantity, 130);
    }

    #[tokio::test]
    async fn test_split_fills_size_like_one_fill() {
        let (db_split, _, replicator_split) =
            harness(&[account("CHILD_A", false, 370_000.0, 0.0)], true);
        let split = [
            complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 130),
            complete_order("2", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 130),
            complete_order("3", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 390),
        ];
        replicator_split.execute_entry(&split, Some(3_700_000.0)).await.unwrap();

        let (db_single, _, replicator_single) =
            harness(&[account("CHILD_A", false, 370_000.0, 0.0)], true);
        let single = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator_single.execute_entry(&single, Some(3_700_000.0)).await.unwrap();

        let split_orders = simulated(&db_split, "CHILD_A");
        let single_orders = simulated(&db_single, "CHILD_A");
        assert_eq!(split_orders.len(), 1);
        assert_eq!(split_orders[0].quantity, single_orders[0].quantity);
        assert_eq!(split_orders[0].quantity, 65);
    }

    #[tokio::test]
    async fn test_second_entry_reuses_frozen_ratio() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 370_000.0, 0.0)], true);

        let first = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator.execute_entry(&first, Some(3_700_000.0)).await.unwrap();

        // Child capital changes mid-cycle; the frozen ratio must not.
        db.accounts().set_session("CHILD_A", "tok", Some(5_000_000.0)).unwrap();

        let second = [complete_order("2", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 1300)];
        replicator.execute_entry(&second, Some(3_500_000.0)).await.unwrap();

        assert_eq!(db.strategy().frozen_ratio("CHILD_A").unwrap(), 0.1);
        let orders = simulated(&db, "CHILD_A");
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].quantity, 130); // floor(20 lots * 0.1) = 2 lots
    }

    #[tokio::test]
    async fn test_zero_baseline_replicates_nothing() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 370_000.0, 0.0)], true);

        let orders = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        // No pre-trade equity and the master mock reports zero margins.
        db.accounts().set_session("MASTER1", "tok", None).unwrap();
        replicator.execute_entry(&orders, None).await.unwrap();

        assert_eq!(db.strategy().frozen_ratio("CHILD_A").unwrap(), 0.0);
        assert!(simulated(&db, "CHILD_A").is_empty());
    }

    #[tokio::test]
    async fn test_partial_exit_rounds_to_lots() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 1_110_000.0, 0.0)], true);

        let entry = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator.execute_entry(&entry, Some(3_700_000.0)).await.unwrap();
        assert_eq!(simulated(&db, "CHILD_A")[0].quantity, 195);

        let target = ExitOrder {
            instrument_token: NIFTY,
            transaction_type: TransactionType::Sell,
            quantity: 325,
            tradingsymbol: "NIFTY25JANFUT".to_string(),
            exchange: "NFO".to_string(),
            product: "NRML".to_string(),
        };
        replicator.execute_exit(0.5, &[target]).await.unwrap();

        let orders = simulated(&db, "CHILD_A");
        assert_eq!(orders.len(), 2);
        let exit = &orders[1];
        assert_eq!(exit.leg, OrderLeg::Exit);
        assert_eq!(exit.transaction_type, TransactionType::Sell);
        assert_eq!(exit.quantity, 65); // floor(195 * 0.5 / 65) = 1 lot
    }

    #[tokio::test]
    async fn test_full_sweep_ignores_lot_rounding() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 740_000.0, 0.0)], true);

        let entry = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator.execute_entry(&entry, Some(3_700_000.0)).await.unwrap();
        assert_eq!(simulated(&db, "CHILD_A")[0].quantity, 130);

        replicator.execute_exit(1.0, &[]).await.unwrap();

        let orders = simulated(&db, "CHILD_A");
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].quantity, 130);
        assert_eq!(orders[1].transaction_type, TransactionType::Sell);
        // Exit never deactivates the cycle; that is the orchestrator's call.
        assert!(db.strategy().is_active().unwrap());
    }

    #[tokio::test]
    async fn test_close_all_covers_short_positions() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 370_000.0, 0.0)], true);

        let entry = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Sell, 650)];
        replicator.execute_entry(&entry, Some(3_700_000.0)).await.unwrap();

        replicator.execute_exit(1.0, &[]).await.unwrap();

        let orders = simulated(&db, "CHILD_A");
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].transaction_type, TransactionType::Buy);
        assert_eq!(orders[1].quantity, 65);
    }

    #[tokio::test]
    async fn test_repeated_exit_targets_do_not_double_count() {
        let (db, _, replicator) = harness(&[account("CHILD_A", false, 370_000.0, 0.0)], true);

        let entry = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator.execute_entry(&entry, Some(3_700_000.0)).await.unwrap();

        let target = ExitOrder {
            instrument_token: NIFTY,
            transaction_type: TransactionType::Sell,
            quantity: 650,
            tradingsymbol: "NIFTY25JANFUT".to_string(),
            exchange: "NFO".to_string(),
            product: "NRML".to_string(),
        };
        replicator
            .execute_exit(1.0, &[target.clone(), target])
            .await
            .unwrap();

        let exits: Vec<_> = simulated(&db, "CHILD_A")
            .into_iter()
            .filter(|o| o.leg == OrderLeg::Exit)
            .collect();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].quantity, 65);
    }

    #[tokio::test]
    async fn test_live_placement_failure_isolated_per_child() {
        let (db, sessions, replicator) = harness(
            &[
                account("CHILD_A", false, 370_000.0, 0.0),
                account("CHILD_B", false, 370_000.0, 0.0),
            ],
            false,
        );
        for id in ["MASTER1", "CHILD_A", "CHILD_B"] {
            db.accounts().set_session(id, "tok", None).unwrap();
        }
        sessions.broker_for("CHILD_A").reject_placements(true);

        let orders = [complete_order("1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
        replicator.execute_entry(&orders, Some(3_700_000.0)).await.unwrap();

        let a = simulated(&db, "CHILD_A");
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].status, PlacementStatus::Failed);

        let b = simulated(&db, "CHILD_B");
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].status, PlacementStatus::Placed);
        assert!(b[0].order_id.is_some());

        assert_eq!(sessions.broker_for("CHILD_B").placed().len(), 1);
        assert_eq!(sessions.broker_for("CHILD_B").placed()[0].quantity, 65);
    }

    #[tokio::test]
    async fn test_live_exit_uses_broker_positions() {
        let (db, sessions, replicator) = harness(&[account("CHILD_A", false, 370_000.0, 0.0)], false);
        db.accounts().set_session("CHILD_A", "tok", None).unwrap();
        sessions
            .broker_for("CHILD_A")
            .set_positions(vec![crate::broker::mock::position(NIFTY, 130, "NIFTY25JANFUT")]);

        replicator.execute_exit(1.0, &[]).await.unwrap();

        let placed = sessions.broker_for("CHILD_A").placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].quantity, 130);
        assert_eq!(placed[0].transaction_type, TransactionType::Sell);
        assert_eq!(placed[0].exchange, "NFO");
        assert_eq!(placed[0].product, "NRML");
    }
}
