//! The replication control loop.
//!
//! [`poller`] drives the loop on a fixed interval, [`orchestrator`] turns
//! each tick into a noop / entry / exit / emergency-sync decision, and
//! [`replicator`] fans the decision out to the child accounts.

pub mod instruments;
pub mod orchestrator;
pub mod poller;
pub mod replicator;

pub use orchestrator::MasterOrchestrator;
pub use poller::{ReplicationPoller, SeenOrders};
pub use replicator::{ChildReplicator, ExitOrder};

use crate::models::Config;
use std::time::Duration;

/// Exchange/product assumed for synthesized exits when the position the
/// broker reported carried neither.
pub(crate) const DEFAULT_EXCHANGE: &str = "NFO";
pub(crate) const DEFAULT_PRODUCT: &str = "NRML";

/// Exit ratios at or above this sweep the full child position without lot
/// rounding.
pub(crate) const FULL_EXIT_RATIO: f64 = 0.99;

/// Settings shared by the replication components.
#[derive(Debug, Clone)]
pub struct ReplicationSettings {
    pub master_id: String,
    pub dry_run: bool,
    pub index_lot_size: i64,
    pub entry_margin_threshold: f64,
    pub entry_grace: Duration,
    pub poll_interval: Duration,
}

impl ReplicationSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            master_id: config.master_user_id.clone(),
            dry_run: config.dry_run,
            index_lot_size: config.index_lot_size,
            entry_margin_threshold: config.entry_margin_threshold,
            entry_grace: Duration::from_secs(config.entry_grace_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }
}
