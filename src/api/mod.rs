//! Admin HTTP surface.
//!
//! Peripheral glue around the core loop: broker login handshake, account
//! listing and cap-limit updates, the replicated-order log, and the
//! strategy force-reset. Handlers are thin wrappers over the stores and the
//! broker client.

pub mod routes;

pub use routes::router;

use crate::broker::KiteSessions;
use crate::models::Config;
use crate::store::Database;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Application state shared across admin handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub sessions: Arc<KiteSessions>,
    /// Set by the force-reset endpoint; the poller drops the orchestrator's
    /// in-memory snapshot at the next tick boundary.
    pub reset_requested: Arc<AtomicBool>,
}
