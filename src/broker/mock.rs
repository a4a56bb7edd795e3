//! Deterministic in-memory broker used by the test suite.
//!
//! No randomness, no clock: responses are whatever the test scripted, and
//! placed orders are recorded for assertion. Broker order ids are a simple
//! sequence.

use super::types::{Margins, Order, OrderParams, Position};
use super::{BrokerApi, BrokerError, BrokerResult, SessionFactory};
use crate::store::accounts::Account;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    margins: Margins,
    positions: Vec<Position>,
    orders: Vec<Order>,
    placed: Vec<OrderParams>,
    fail_next: Option<BrokerError>,
    reject_placements: bool,
    next_order_seq: u64,
}

#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_margins(&self, opening_balance: f64, collateral: f64, debits: f64) {
        let mut state = self.state.lock();
        state.margins = margins(opening_balance, collateral, debits);
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        self.state.lock().positions = positions;
    }

    pub fn set_orders(&self, orders: Vec<Order>) {
        self.state.lock().orders = orders;
    }

    pub fn push_order(&self, order: Order) {
        self.state.lock().orders.push(order);
    }

    /// Fail the next fetch (margins/orders/positions) with the given error.
    pub fn fail_next(&self, err: BrokerError) {
        self.state.lock().fail_next = Some(err);
    }

    pub fn reject_placements(&self, reject: bool) {
        self.state.lock().reject_placements = reject;
    }

    /// Orders placed so far, in placement order.
    pub fn placed(&self) -> Vec<OrderParams> {
        self.state.lock().placed.clone()
    }

    fn take_failure(&self) -> Option<BrokerError> {
        self.state.lock().fail_next.take()
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn margins(&self) -> BrokerResult<Margins> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().margins.clone())
    }

    async fn orders(&self) -> BrokerResult<Vec<Order>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().orders.clone())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().positions.clone())
    }

    async fn place_order(&self, params: &OrderParams) -> BrokerResult<String> {
        let mut state = self.state.lock();
        if state.reject_placements {
            return Err(BrokerError::Placement("rejected by mock broker".to_string()));
        }
        state.next_order_seq += 1;
        let order_id = format!("MOCK-{}", state.next_order_seq);
        state.placed.push(params.clone());
        Ok(order_id)
    }
}

/// Session factory handing out one [`MockBroker`] per account id.
#[derive(Default)]
pub struct MockSessions {
    brokers: Mutex<HashMap<String, MockBroker>>,
}

impl MockSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker behind an account id, created on first use. Tests keep the
    /// returned handle to script responses and inspect placements.
    pub fn broker_for(&self, account_id: &str) -> MockBroker {
        self.brokers
            .lock()
            .entry(account_id.to_string())
            .or_default()
            .clone()
    }
}

impl SessionFactory for MockSessions {
    fn session(&self, account: &Account) -> BrokerResult<Arc<dyn BrokerApi>> {
        Ok(Arc::new(self.broker_for(&account.account_id)))
    }
}

/// Margins literal for scripting.
pub fn margins(opening_balance: f64, collateral: f64, debits: f64) -> Margins {
    let mut m = Margins::default();
    m.equity.available.opening_balance = opening_balance;
    m.equity.available.collateral = collateral;
    m.equity.utilised.debits = debits;
    m
}

/// Position literal for scripting.
pub fn position(instrument_token: i64, quantity: i64, tradingsymbol: &str) -> Position {
    Position {
        instrument_token,
        quantity,
        tradingsymbol: tradingsymbol.to_string(),
        exchange: Some("NFO".to_string()),
        product: Some("NRML".to_string()),
        pnl: 0.0,
    }
}

/// Completed master order literal for scripting.
pub fn complete_order(
    order_id: &str,
    tradingsymbol: &str,
    instrument_token: i64,
    transaction_type: super::TransactionType,
    quantity: i64,
) -> Order {
    Order {
        order_id: order_id.to_string(),
        status: super::types::ORDER_STATUS_COMPLETE.to_string(),
        tradingsymbol: tradingsymbol.to_string(),
        instrument_token,
        exchange: "NFO".to_string(),
        product: "NRML".to_string(),
        transaction_type,
        quantity,
        average_price: 0.0,
    }
}
