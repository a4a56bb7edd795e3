//! End-to-end replication cycle through the deterministic mock broker.
//!
//! Drives the orchestrator tick by tick across a full cycle (cold start,
//! entry, partial exit, full exit) and across a simulated process restart
//! with a missed exit.

use std::sync::Arc;
use std::time::Duration;

use mirrorbot_backend::broker::mock::{complete_order, position, MockSessions};
use mirrorbot_backend::broker::types::TransactionType;
use mirrorbot_backend::models::AccountConfig;
use mirrorbot_backend::replication::{MasterOrchestrator, ReplicationSettings};
use mirrorbot_backend::store::{Database, OrderLeg, PlacementStatus, ReplicatedOrder};

const NIFTY: i64 = 256265;
const MASTER: &str = "MASTER1";
const CHILD: &str = "CHILD_A";

fn settings() -> ReplicationSettings {
    ReplicationSettings {
        master_id: MASTER.to_string(),
        dry_run: true,
        index_lot_size: 65,
        entry_margin_threshold: 500.0,
        // Grace suppression has its own focused coverage; keep the
        // integration timeline free of wall-clock waits.
        entry_grace: Duration::from_secs(0),
        poll_interval: Duration::from_secs(5),
    }
}

fn account(account_id: &str, is_master: bool, capital: f64) -> AccountConfig {
    AccountConfig {
        account_id: account_id.to_string(),
        api_key: format!("{account_id}_key"),
        api_secret: format!("{account_id}_secret"),
        is_master,
        capital,
        max_capital_usage: 0.0,
    }
}

fn harness(child_capital: f64) -> (Database, Arc<MockSessions>, MasterOrchestrator) {
    let db = Database::open_in_memory().unwrap();
    db.accounts()
        .sync_from_config(&[account(MASTER, true, 3_700_000.0), account(CHILD, false, child_capital)])
        .unwrap();
    db.accounts().set_session(MASTER, "master_token", None).unwrap();

    let sessions = Arc::new(MockSessions::new());
    sessions.broker_for(MASTER).set_margins(3_700_000.0, 0.0, 0.0);

    let orchestrator = MasterOrchestrator::new(settings(), &db, sessions.clone());
    (db, sessions, orchestrator)
}

fn child_log(db: &Database) -> Vec<ReplicatedOrder> {
    let mut orders = db.orders().for_child(CHILD, 100).unwrap();
    orders.reverse(); // oldest first
    orders
}

#[tokio::test]
async fn test_full_cycle_entry_partial_exit_flat() {
    let (db, sessions, mut orchestrator) = harness(1_110_000.0);
    let master = sessions.broker_for(MASTER);

    // Tick 1: cold start hydrates the baseline, nothing replicates.
    orchestrator.process_tick(&[]).await.unwrap();
    assert!(child_log(&db).is_empty());
    assert!(!db.strategy().is_active().unwrap());

    // Tick 2: master buys 10 lots, blocking 100k margin.
    master.set_margins(3_700_000.0, 0.0, 100_000.0);
    master.set_positions(vec![position(NIFTY, 650, "NIFTY25JANFUT")]);
    let entry = [complete_order("ORD-1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
    orchestrator.process_tick(&entry).await.unwrap();

    let strategy = db.strategy().snapshot().unwrap();
    assert!(strategy.active);
    assert_eq!(strategy.master_initial_margin, Some(3_700_000.0));
    assert_eq!(strategy.frozen_ratios[CHILD], 0.3);
    assert!(strategy.cycle_started_at.is_some());

    let log = child_log(&db);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].leg, OrderLeg::Entry);
    assert_eq!(log[0].transaction_type, TransactionType::Buy);
    assert_eq!(log[0].quantity, 195); // 10 lots * 0.3 = 3 lots

    // Tick 3: master halves the position; margin partially released.
    master.set_margins(3_700_000.0, 0.0, 50_000.0);
    master.set_positions(vec![position(NIFTY, 325, "NIFTY25JANFUT")]);
    orchestrator.process_tick(&[]).await.unwrap();

    let log = child_log(&db);
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].leg, OrderLeg::Exit);
    assert_eq!(log[1].transaction_type, TransactionType::Sell);
    assert_eq!(log[1].quantity, 65); // floor(195 * 0.5 / 65) lots
    assert!(db.strategy().is_active().unwrap());

    // Tick 4: master goes flat; the cycle ends with an exact sweep.
    master.set_margins(3_700_000.0, 0.0, 0.0);
    master.set_positions(vec![]);
    orchestrator.process_tick(&[]).await.unwrap();

    let log = child_log(&db);
    assert_eq!(log.len(), 3);
    assert_eq!(log[2].leg, OrderLeg::Exit);
    assert_eq!(log[2].quantity, 130); // exact remainder, no lot rounding

    let strategy = db.strategy().snapshot().unwrap();
    assert!(!strategy.active);
    assert!(strategy.master_initial_margin.is_none());
    assert!(strategy.frozen_ratios.is_empty());

    // Tick 5: quiet market, nothing more happens.
    orchestrator.process_tick(&[]).await.unwrap();
    assert_eq!(child_log(&db).len(), 3);
}

#[tokio::test]
async fn test_second_cycle_freezes_fresh_ratios() {
    let (db, sessions, mut orchestrator) = harness(1_110_000.0);
    let master = sessions.broker_for(MASTER);
    orchestrator.process_tick(&[]).await.unwrap();

    // Cycle one.
    master.set_margins(3_700_000.0, 0.0, 100_000.0);
    master.set_positions(vec![position(NIFTY, 650, "NIFTY25JANFUT")]);
    let entry = [complete_order("ORD-1", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
    orchestrator.process_tick(&entry).await.unwrap();
    assert_eq!(db.strategy().frozen_ratio(CHILD).unwrap(), 0.3);

    master.set_margins(3_700_000.0, 0.0, 0.0);
    master.set_positions(vec![]);
    orchestrator.process_tick(&[]).await.unwrap();
    assert!(!db.strategy().is_active().unwrap());

    // The child's capital doubled between cycles; the new cycle re-freezes.
    db.accounts().set_session(CHILD, "child_token", Some(2_220_000.0)).unwrap();

    master.set_margins(3_700_000.0, 0.0, 100_000.0);
    master.set_positions(vec![position(NIFTY, 650, "NIFTY25JANFUT")]);
    let entry = [complete_order("ORD-2", "NIFTY25JANFUT", NIFTY, TransactionType::Buy, 650)];
    orchestrator.process_tick(&entry).await.unwrap();

    assert_eq!(db.strategy().frozen_ratio(CHILD).unwrap(), 0.6);
    let log = child_log(&db);
    let last = log.last().unwrap();
    assert_eq!(last.leg, OrderLeg::Entry);
    assert_eq!(last.quantity, 390); // 10 lots * 0.6
}

#[tokio::test]
async fn test_restart_with_missed_exit_triggers_emergency_sync() {
    let db = Database::open_in_memory().unwrap();
    db.accounts()
        .sync_from_config(&[account(MASTER, true, 3_700_000.0), account(CHILD, false, 1_110_000.0)])
        .unwrap();
    db.accounts().set_session(MASTER, "master_token", None).unwrap();

    // Durable state left behind by the crashed process: an active cycle
    // with a filled child.
    let strategy = db.strategy();
    strategy.set_master_initial_margin(3_700_000.0).unwrap();
    strategy.set_frozen_ratio(CHILD, 0.3).unwrap();
    strategy.activate().unwrap();
    db.orders()
        .append(&ReplicatedOrder::record(
            CHILD,
            NIFTY,
            "NIFTY25JANFUT",
            TransactionType::Buy,
            195,
            OrderLeg::Entry,
            PlacementStatus::Simulated,
            None,
        ))
        .unwrap();

    // The master exited while the engine was down.
    let sessions = Arc::new(MockSessions::new());
    let master = sessions.broker_for(MASTER);
    master.set_margins(3_700_000.0, 0.0, 0.0);
    master.set_positions(vec![]);

    let mut orchestrator = MasterOrchestrator::new(settings(), &db, sessions.clone());

    // First tick hydrates; the next one observes active + flat and closes
    // the children exactly once.
    orchestrator.process_tick(&[]).await.unwrap();
    orchestrator.process_tick(&[]).await.unwrap();

    let log = child_log(&db);
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].leg, OrderLeg::Exit);
    assert_eq!(log[1].transaction_type, TransactionType::Sell);
    assert_eq!(log[1].quantity, 195);
    assert!(!db.strategy().is_active().unwrap());

    orchestrator.process_tick(&[]).await.unwrap();
    orchestrator.process_tick(&[]).await.unwrap();
    assert_eq!(child_log(&db).len(), 2);
}
