//! Broker access layer.
//!
//! The replication loop consumes the broker through the narrow [`BrokerApi`]
//! trait; [`kite`] implements it over the real HTTP API and [`mock`] provides
//! the deterministic in-memory broker the test suite drives.

pub mod kite;
pub mod mock;
pub mod types;

pub use kite::{KiteClient, KiteSessions};
pub use types::{Margins, Order, OrderParams, Position, SessionData, TransactionType};

use crate::store::accounts::Account;
use async_trait::async_trait;
use std::sync::Arc;

/// Broker call failure, classified so callers can react to the kind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Network trouble, rate limit, or a broker-side 5xx. The tick is
    /// skipped and the session rebuilt on the next interval.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// The access token was rejected; the account needs a fresh login.
    #[error("broker authentication rejected: {0}")]
    Auth(String),

    /// The broker rejected an order placement. Logged per child, never
    /// retried automatically.
    #[error("order placement rejected: {0}")]
    Placement(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Operations the replication loop needs from an authenticated session.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn margins(&self) -> BrokerResult<Margins>;
    async fn orders(&self) -> BrokerResult<Vec<Order>>;
    async fn positions(&self) -> BrokerResult<Vec<Position>>;
    async fn place_order(&self, params: &OrderParams) -> BrokerResult<String>;
}

/// Builds an authenticated broker session for an account.
pub trait SessionFactory: Send + Sync {
    fn session(&self, account: &Account) -> BrokerResult<Arc<dyn BrokerApi>>;
}
