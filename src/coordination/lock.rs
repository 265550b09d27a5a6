//! Exclusive connection lock.
//!
//! Discord rate-limits how often a bot identity may open a new gateway
//! connection, platform-wide. Every relay process funnels its connection
//! attempts through one lease-bound lock key in the coordination store: the
//! holder connects, then keeps renewing while the rate-limit window is
//! still in effect. Auto-release is the only release path; the consumer
//! signals continued need through [`ConnectionLock::renew`] and otherwise
//! lets the hold lapse.

use crate::coordination::store::{CoordinationStore, EventKind, LeaseId, StoreEvent};
use crate::error::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// The single well-known lock key.
pub const LOCK_KEY: &str = "locks/connection";

/// Tunables for the connection lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lock TTL: the hold lapses this long after acquire or the last renew.
    /// Matches Discord's identify rate-limit window.
    pub ttl: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(6),
        }
    }
}

/// Fleet-wide mutual exclusion around gateway connection attempts.
pub struct ConnectionLock<S> {
    store: Arc<S>,
    ttl: Duration,
    events: mpsc::UnboundedReceiver<StoreEvent>,
    renew_tx: Option<mpsc::Sender<()>>,
}

impl<S: CoordinationStore> ConnectionLock<S> {
    /// Open the lock-key watch, kept for the process lifetime. It is only
    /// used to cut backoff waits short when the holder releases early.
    pub async fn start(store: Arc<S>, config: LockConfig) -> Result<Self, SyncError> {
        let events = store.watch_prefix(LOCK_KEY).await?;
        Ok(Self {
            store,
            ttl: config.ttl,
            events,
            renew_tx: None,
        })
    }

    /// Suspend until this process holds the fleet-wide connection lock.
    ///
    /// Contention is never surfaced: the loop backs off and retries until
    /// the claim wins. Any other store failure is fatal and propagates.
    pub async fn acquire(&mut self) -> Result<(), SyncError> {
        loop {
            let grant = self.store.grant_lease(self.ttl).await?;
            match self.store.put_if_absent(LOCK_KEY, grant.id).await {
                Ok(true) => {
                    debug!(lease_id = grant.id, "Connection lock acquired");
                    self.arm_release(grant.id);
                    return Ok(());
                }
                Ok(false) => {
                    // Another process holds it; our lease never bound
                    // anything, so drop it and wait.
                    let _ = self.store.revoke_lease(grant.id).await;
                    debug!("Connection lock contended, backing off");
                    self.backoff().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Signal continued need for exclusivity: pushes auto-release a full
    /// TTL from now. Without further renewals the hold lapses on its own.
    pub fn renew(&self) {
        if let Some(tx) = &self.renew_tx {
            let _ = tx.try_send(());
        }
    }

    /// Wait out the current holder: resolves on the lock key's delete
    /// event, or after twice the TTL when watch delivery is delayed or the
    /// event was missed entirely.
    pub async fn backoff(&mut self) -> Result<(), SyncError> {
        let timeout = tokio::time::sleep(self.ttl * 2);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                _ = &mut timeout => return Ok(()),
                event = self.events.recv() => match event {
                    Some(StoreEvent { kind: EventKind::Delete, .. }) => return Ok(()),
                    Some(_) => continue,
                    None => return Err(SyncError::WatchClosed),
                },
            }
        }
    }

    /// Spawn the holder task: revokes the lease (deleting the lock key)
    /// once the renewable deadline passes.
    fn arm_release(&mut self, lease: LeaseId) {
        let (renew_tx, mut renew_rx) = mpsc::channel(1);
        self.renew_tx = Some(renew_tx);

        let store = Arc::clone(&self.store);
        let ttl = self.ttl;

        tokio::spawn(async move {
            let mut deadline = Instant::now() + ttl;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    renewed = renew_rx.recv() => match renewed {
                        Some(()) => deadline = Instant::now() + ttl,
                        None => break, // lock handle dropped, release now
                    },
                }
            }

            // Waiters observe the key's delete event and retry immediately.
            if let Err(e) = store.revoke_lease(lease).await {
                debug!(error = %e, "Connection lock release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryStore;

    const TTL: Duration = Duration::from_secs(6);

    async fn lock(store: &Arc<MemoryStore>) -> ConnectionLock<MemoryStore> {
        ConnectionLock::start(Arc::clone(store), LockConfig { ttl: TTL })
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_creates_the_lock_key() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store).await;

        lock.acquire().await.unwrap();
        assert!(store.contains_key(LOCK_KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn hold_lapses_after_ttl_without_renew() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store).await;
        lock.acquire().await.unwrap();

        tokio::time::sleep(TTL + Duration::from_millis(100)).await;
        assert!(!store.contains_key(LOCK_KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_postpones_release_by_a_full_ttl() {
        let store = Arc::new(MemoryStore::new());
        let mut lock = lock(&store).await;
        lock.acquire().await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        lock.renew();

        // Past the first deadline, still held thanks to the renewal.
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.contains_key(LOCK_KEY));

        // A full TTL after the renewal it lapses.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!store.contains_key(LOCK_KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_times_out_at_twice_the_ttl() {
        let store = Arc::new(MemoryStore::new());
        let mut holder = lock(&store).await;
        holder.acquire().await.unwrap();
        // Keep the key alive for the whole window so only the timeout can
        // resolve the backoff.
        let mut waiter = lock(&store).await;

        let started = Instant::now();
        tokio::select! {
            res = waiter.backoff() => res.unwrap(),
            _ = async { loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                holder.renew();
            }} => unreachable!(),
        }
        assert!(started.elapsed() >= TTL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_resolves_on_delete_event() {
        let store = Arc::new(MemoryStore::new());
        let mut holder = lock(&store).await;
        holder.acquire().await.unwrap();

        let mut waiter = lock(&store).await;
        let started = Instant::now();
        waiter.backoff().await.unwrap();

        // The holder never renews, so its hold lapsed after one TTL and the
        // delete event ended the backoff ahead of the 2×TTL timeout.
        assert!(started.elapsed() < TTL * 2);
    }
}
