//! Fixed-interval driver for the replication loop.
//!
//! Each tick authenticates (or reuses) a master broker session, fetches the
//! order list, filters it to newly completed orders, and hands them to the
//! orchestrator. The orchestrator runs even on empty ticks so flat-detection
//! and emergency sync keep working. Ticks never overlap and shutdown is only
//! honoured between ticks.

use super::{MasterOrchestrator, ReplicationSettings};
use crate::broker::{BrokerApi, BrokerError, SessionFactory};
use crate::store::{AccountStatus, AccountStore, Database};
use anyhow::{Context, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Bound on the remembered master order ids.
pub const SEEN_ORDER_CAP: usize = 2000;

/// Insertion-ordered set of order ids already handed to the orchestrator.
/// When the cap is exceeded the oldest half is evicted.
#[derive(Debug, Default)]
pub struct SeenOrders {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenOrders {
    pub fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(2),
        }
    }

    /// Record an id; returns true when it was not seen before.
    pub fn insert(&mut self, order_id: &str) -> bool {
        if !self.seen.insert(order_id.to_string()) {
            return false;
        }
        self.order.push_back(order_id.to_string());

        if self.order.len() > self.cap {
            let keep = self.cap / 2;
            while self.order.len() > keep {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
        true
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.seen.contains(order_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct ReplicationPoller {
    settings: ReplicationSettings,
    accounts: AccountStore,
    sessions: Arc<dyn SessionFactory>,
    orchestrator: MasterOrchestrator,
    seen: SeenOrders,
    master_session: Option<Arc<dyn BrokerApi>>,
    reset_requested: Arc<AtomicBool>,
}

impl ReplicationPoller {
    pub fn new(
        settings: ReplicationSettings,
        db: &Database,
        sessions: Arc<dyn SessionFactory>,
        reset_requested: Arc<AtomicBool>,
    ) -> Self {
        let orchestrator = MasterOrchestrator::new(settings.clone(), db, sessions.clone());
        Self {
            settings,
            accounts: db.accounts(),
            sessions,
            orchestrator,
            seen: SeenOrders::new(SEEN_ORDER_CAP),
            master_session: None,
            reset_requested,
        }
    }

    /// Drive the loop until the shutdown channel fires. A tick in flight
    /// runs to completion; the signal is only observed at tick boundaries.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            master = %self.settings.master_id,
            interval_secs = self.settings.poll_interval.as_secs(),
            dry_run = self.settings.dry_run,
            "starting replication poller"
        );

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.reset_requested.swap(false, Ordering::SeqCst) {
                        self.orchestrator.reset();
                        self.master_session = None;
                    }
                    if let Err(e) = self.tick().await {
                        warn!("tick failed: {e:#}");
                        self.handle_auth_failure(&e);
                        // Rebuild the session from scratch next interval.
                        self.master_session = None;
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown signal received; stopping replication poller");
                    break;
                }
            }
        }
    }

    async fn tick(&mut self) -> Result<()> {
        let master = self
            .accounts
            .get(&self.settings.master_id)?
            .with_context(|| format!("master account {} not configured", self.settings.master_id))?;
        if !master.is_connected() {
            info!(master = %master.account_id, "master not connected; waiting for broker login");
            return Ok(());
        }

        let session = match &self.master_session {
            Some(session) => session.clone(),
            None => {
                let session = self.sessions.session(&master)?;
                self.master_session = Some(session.clone());
                session
            }
        };

        let orders = session.orders().await?;
        let mut new_orders = Vec::new();
        for order in orders {
            if order.is_complete() && self.seen.insert(&order.order_id) {
                new_orders.push(order);
            }
        }
        if !new_orders.is_empty() {
            info!(count = new_orders.len(), "new completed master orders");
        }

        self.orchestrator.process_tick(&new_orders).await
    }

    /// An auth rejection means the master token expired: flag the account so
    /// the admin surface shows it, and keep retrying until a fresh login.
    fn handle_auth_failure(&self, err: &anyhow::Error) {
        let is_auth = err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<BrokerError>(), Some(BrokerError::Auth(_))));
        if !is_auth {
            return;
        }
        warn!(master = %self.settings.master_id, "master session rejected; marking account expired");
        if let Err(e) = self
            .accounts
            .set_status(&self.settings.master_id, AccountStatus::Expired)
        {
            warn!("failed to mark master expired: {e:#}");
        }
    }
}
