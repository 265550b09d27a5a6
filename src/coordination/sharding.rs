//! Shard coordination.
//!
//! When connecting to Discord, the gateway accepts sharding information to
//! split guilds between servers: the shard id of the current process and the
//! total number of shards. Instead of a central allocator, every relay
//! process claims an integer slot key under a shared namespace in the
//! coordination store, bound to a short-lived lease. Slots are densely
//! packed from 0: a process whose id falls out of range after the fleet
//! shrinks relinquishes it and claims a lower one. Peers learn about churn
//! from watch events and reconcile against a fresh listing, never against
//! the events themselves.
//!
//! All state lives in one coordination task. Watch events, lease loss, the
//! debounced resync timer and stop requests are funneled into a single
//! `select!` loop, so no locking is needed around the local assignment.

use crate::coordination::store::{CoordinationStore, EventKind, LeaseId, StoreEvent};
use crate::error::SyncError;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Store prefix under which shard slot keys live.
pub const SHARD_PREFIX: &str = "shards/";

/// The locally held shard assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assignment {
    #[default]
    Unassigned,
    Assigned {
        id: u64,
        total: u64,
    },
}

impl Assignment {
    pub fn shard_id(&self) -> Option<u64> {
        match self {
            Assignment::Unassigned => None,
            Assignment::Assigned { id, .. } => Some(*id),
        }
    }

    pub fn shard_count(&self) -> Option<u64> {
        match self {
            Assignment::Unassigned => None,
            Assignment::Assigned { total, .. } => Some(*total),
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, Assignment::Assigned { .. })
    }
}

/// Tunables for the shard coordinator.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// TTL of the membership lease. A crashed process frees its slot within
    /// this window.
    pub lease_ttl: Duration,
    /// How long to sit on a slot-delete event before resynchronizing.
    /// Voluntary slot switches delete their own old key, so reacting
    /// instantly would resync on every reshuffle. Must comfortably exceed
    /// the delete-to-put gap of a slot switch (one store round trip).
    pub resync_delay: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            resync_delay: Duration::from_secs(15),
        }
    }
}

/// Consumer-facing side of the coordinator.
#[derive(Debug, Clone)]
pub struct ShardingHandle {
    assignments: watch::Receiver<Assignment>,
    stop_tx: mpsc::Sender<()>,
}

impl ShardingHandle {
    /// Subscribe to assignment changes. The channel starts at `Unassigned`
    /// and only ever reports actual changes.
    pub fn assignments(&self) -> watch::Receiver<Assignment> {
        self.assignments.clone()
    }

    /// Current assignment snapshot.
    pub fn assignment(&self) -> Assignment {
        *self.assignments.borrow()
    }

    /// Request shutdown: the coordinator revokes its lease, which deletes
    /// the slot key, and its `run` future returns.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

/// The shard coordinator task.
pub struct Sharding<S> {
    store: Arc<S>,
    config: ShardingConfig,
    assignment: Assignment,
    lease_id: Option<LeaseId>,
    lease_lost: Option<oneshot::Receiver<()>>,
    delayed_sync: Option<Instant>,
    assign_tx: watch::Sender<Assignment>,
    events: mpsc::UnboundedReceiver<StoreEvent>,
    stop_rx: mpsc::Receiver<()>,
}

impl<S: CoordinationStore> Sharding<S> {
    /// Establish the namespace watch and build the coordinator. A watch
    /// failure here is fatal; the returned task has not claimed anything
    /// yet, so there is nothing to roll back.
    pub async fn start(
        store: Arc<S>,
        config: ShardingConfig,
    ) -> Result<(Self, ShardingHandle), SyncError> {
        let events = store.watch_prefix(SHARD_PREFIX).await?;
        let (assign_tx, assignments) = watch::channel(Assignment::Unassigned);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let sharding = Self {
            store,
            config,
            assignment: Assignment::Unassigned,
            lease_id: None,
            lease_lost: None,
            delayed_sync: None,
            assign_tx,
            events,
            stop_rx,
        };
        let handle = ShardingHandle {
            assignments,
            stop_tx,
        };
        Ok((sharding, handle))
    }

    /// Drive the coordinator until stopped.
    ///
    /// Grants the initial lease, claims a slot, then reacts to membership
    /// churn. Lease loss and claim races are retried indefinitely; any other
    /// store failure ends the loop with an error.
    pub async fn run(mut self) -> Result<(), SyncError> {
        self.create_lease().await?;

        loop {
            let resync_at = self.delayed_sync;

            tokio::select! {
                _ = self.stop_rx.recv() => {
                    return self.shutdown().await;
                }

                _ = wait_lost(&mut self.lease_lost) => {
                    warn!("Membership lease lost, re-establishing");
                    self.lease_id = None;
                    self.lease_lost = None;
                    self.publish(Assignment::Unassigned);
                    self.create_lease().await?;
                }

                event = self.events.recv() => {
                    match event {
                        Some(StoreEvent { kind: EventKind::Put, .. }) => {
                            // A process joined or reclaimed a slot; new
                            // capacity may let us move down, and totals must
                            // propagate promptly.
                            self.sync_shards().await?;
                        }
                        Some(StoreEvent { kind: EventKind::Delete, .. }) => {
                            // Slot deletes also happen when a peer switches
                            // to a lower id; debounce so the put that
                            // follows is absorbed into one resync.
                            self.delayed_sync =
                                Some(Instant::now() + self.config.resync_delay);
                        }
                        None => return Err(SyncError::WatchClosed),
                    }
                }

                _ = sleep_until_opt(resync_at), if resync_at.is_some() => {
                    self.sync_shards().await?;
                }
            }
        }
    }

    /// Grant a fresh membership lease and reconcile.
    async fn create_lease(&mut self) -> Result<(), SyncError> {
        let grant = self.store.grant_lease(self.config.lease_ttl).await?;
        debug!(lease_id = grant.id, "Membership lease granted, synchronizing shards");
        self.lease_id = Some(grant.id);
        self.lease_lost = Some(grant.lost);
        self.sync_shards().await
    }

    /// Reconcile the local assignment against the slot keys that currently
    /// exist. Idempotent; claim races loop back to a fresh listing rather
    /// than recursing.
    async fn sync_shards(&mut self) -> Result<(), SyncError> {
        self.delayed_sync = None;

        loop {
            let shards = self.list_shard_ids().await?;

            let mut total = shards.len() as u64;
            if !self.assignment.is_assigned() {
                total += 1;
            }

            if let Some(id) = self.assignment.shard_id() {
                if id < total {
                    // Holding a valid low id; only the total may have moved.
                    self.publish(Assignment::Assigned { id, total });
                    return Ok(());
                }
            }

            let Some(free) = (0..total).find(|id| !shards.contains(id)) else {
                // The +1 accounting above always leaves a gap when the
                // listing is consistent; if not, skip this cycle and let the
                // next event or debounce tick retry.
                warn!(total, "No free shard slot found, skipping claim cycle");
                return Ok(());
            };

            if self.set_shard(free, total).await? {
                return Ok(());
            }
            debug!(id = free, "Shard slot claim lost, resynchronizing");
        }
    }

    /// Claim a slot key and release the previously held one. Returns false
    /// when another process won the claim.
    async fn set_shard(&mut self, id: u64, total: u64) -> Result<bool, SyncError> {
        let Some(lease) = self.lease_id else {
            // Lease vanished between the lost notification and this claim;
            // the lost arm will re-grant and resync.
            return Ok(true);
        };

        if !self.store.put_if_absent(&slot_key(id), lease).await? {
            return Ok(false);
        }

        if let Assignment::Assigned { id: prev, .. } = self.assignment {
            // Best-effort: delete the old slot only while it is still bound
            // to our lease, so a slot someone else reclaimed is left alone.
            match self.store.delete_if_leased(&slot_key(prev), lease).await {
                Ok(released) => debug!(prev, released, "Previous shard slot handled"),
                Err(e) => debug!(prev, error = %e, "Releasing previous shard slot failed"),
            }
        }

        self.publish(Assignment::Assigned { id, total });
        Ok(true)
    }

    async fn list_shard_ids(&self) -> Result<BTreeSet<u64>, SyncError> {
        let keys = self.store.list(SHARD_PREFIX).await?;
        let mut ids = BTreeSet::new();
        for key in keys {
            let raw = key.strip_prefix(SHARD_PREFIX).unwrap_or(&key);
            match raw.parse::<u64>() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(_) => warn!(key, "Ignoring malformed shard slot key"),
            }
        }
        Ok(ids)
    }

    /// Record and report an assignment, skipping no-op changes so consumers
    /// never reconnect on a redundant sync.
    fn publish(&mut self, next: Assignment) {
        if self.assignment == next {
            return;
        }
        debug!(?next, "Sharding info changed");
        self.assignment = next;
        let _ = self.assign_tx.send(next);
    }

    async fn shutdown(&mut self) -> Result<(), SyncError> {
        // Revoking the lease deletes our slot key; peers pick up the delete
        // through their watches. This is also what makes hard crashes safe:
        // an unrevoked lease expires after its TTL with the same effect.
        if let Some(lease) = self.lease_id.take() {
            if let Err(e) = self.store.revoke_lease(lease).await {
                warn!(error = %e, "Failed to revoke membership lease");
            }
        }
        info!("Shard coordinator stopped");
        Ok(())
    }
}

fn slot_key(id: u64) -> String {
    format!("{SHARD_PREFIX}{id}")
}

/// Resolves when the active lease is lost; pends forever without one.
async fn wait_lost(lost: &mut Option<oneshot::Receiver<()>>) {
    match lost {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryStore;
    use crate::coordination::store::CoordinationStore;

    async fn external_claim(store: &MemoryStore, id: u64) -> LeaseId {
        let grant = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        assert!(store.put_if_absent(&slot_key(id), grant.id).await.unwrap());
        grant.id
    }

    async fn started(store: &Arc<MemoryStore>) -> (Sharding<MemoryStore>, ShardingHandle) {
        Sharding::start(Arc::clone(store), ShardingConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn assigns_first_shard_on_empty_namespace() {
        let store = Arc::new(MemoryStore::new());
        let (mut sharding, handle) = started(&store).await;

        sharding.create_lease().await.unwrap();

        assert_eq!(handle.assignment(), Assignment::Assigned { id: 0, total: 1 });
        assert!(store.contains_key("shards/0"));
    }

    #[tokio::test]
    async fn updates_total_when_new_server_joins() {
        let store = Arc::new(MemoryStore::new());
        let (mut sharding, handle) = started(&store).await;
        sharding.create_lease().await.unwrap();

        external_claim(&store, 1).await;
        sharding.sync_shards().await.unwrap();

        assert_eq!(handle.assignment(), Assignment::Assigned { id: 0, total: 2 });
    }

    #[tokio::test]
    async fn redundant_sync_does_not_report() {
        let store = Arc::new(MemoryStore::new());
        let (mut sharding, handle) = started(&store).await;
        sharding.create_lease().await.unwrap();

        let mut rx = handle.assignments();
        rx.borrow_and_update();

        sharding.sync_shards().await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn claims_next_free_slot_behind_existing_server() {
        let store = Arc::new(MemoryStore::new());
        external_claim(&store, 0).await;

        let (mut sharding, handle) = started(&store).await;
        sharding.create_lease().await.unwrap();

        assert_eq!(handle.assignment(), Assignment::Assigned { id: 1, total: 2 });
    }

    #[tokio::test]
    async fn releases_old_slot_when_switching_down() {
        let store = Arc::new(MemoryStore::new());
        let peer = external_claim(&store, 0).await;

        let (mut sharding, handle) = started(&store).await;
        sharding.create_lease().await.unwrap();
        assert_eq!(handle.assignment(), Assignment::Assigned { id: 1, total: 2 });

        // Peer leaves; our id 1 is now out of range and we move down.
        store.expire_lease(peer);
        sharding.sync_shards().await.unwrap();

        assert_eq!(handle.assignment(), Assignment::Assigned { id: 0, total: 1 });
        assert!(store.contains_key("shards/0"));
        assert!(!store.contains_key("shards/1"));
    }

    #[tokio::test]
    async fn claims_gap_left_in_the_middle() {
        let store = Arc::new(MemoryStore::new());
        external_claim(&store, 0).await;
        let middle = external_claim(&store, 1).await;
        external_claim(&store, 2).await;

        let (mut sharding, handle) = started(&store).await;
        sharding.create_lease().await.unwrap();
        assert_eq!(handle.assignment(), Assignment::Assigned { id: 3, total: 4 });

        store.expire_lease(middle);
        sharding.sync_shards().await.unwrap();
        assert_eq!(handle.assignment(), Assignment::Assigned { id: 1, total: 3 });
    }

    #[tokio::test]
    async fn malformed_slot_keys_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let grant = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store
            .put_if_absent("shards/not-a-number", grant.id)
            .await
            .unwrap();

        let (mut sharding, handle) = started(&store).await;
        sharding.create_lease().await.unwrap();

        assert_eq!(handle.assignment(), Assignment::Assigned { id: 0, total: 1 });
    }
}
