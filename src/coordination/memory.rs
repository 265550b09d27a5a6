//! In-process coordination store.
//!
//! Backs the coordination tests and single-node development runs. Semantics
//! mirror the etcd backend: ordered keys, claim and conditional-delete
//! transactions, leases whose keys vanish with them, and watch events fanned
//! out to subscribers. Leases never expire on their own (a healthy
//! keep-alive is assumed); tests simulate keep-alive failure with
//! [`MemoryStore::expire_lease`].

use crate::coordination::store::{
    CoordinationStore, EventKind, LeaseGrant, LeaseId, StoreEvent,
};
use crate::error::SyncError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct Inner {
    /// key -> owning lease. BTreeMap keeps listings in key order.
    keys: BTreeMap<String, LeaseId>,
    leases: HashMap<LeaseId, LeaseEntry>,
    watchers: Vec<Watcher>,
    next_lease: LeaseId,
}

struct LeaseEntry {
    lost_tx: Option<oneshot::Sender<()>>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

/// Coordination store held entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing a lease: its keys are deleted, watchers observe the
    /// deletes, and the lease's lost notification fires.
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let Some(mut entry) = inner.leases.remove(&lease) else {
            return;
        };
        Self::drop_lease_keys(&mut inner, lease);
        if let Some(lost_tx) = entry.lost_tx.take() {
            let _ = lost_tx.send(());
        }
    }

    /// Whether `key` currently exists. Test observability hook.
    pub fn contains_key(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.keys.contains_key(key)
    }

    /// Lease a key is bound to, if the key exists. Test observability hook.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.keys.get(key).copied()
    }

    fn drop_lease_keys(inner: &mut Inner, lease: LeaseId) {
        let owned: Vec<String> = inner
            .keys
            .iter()
            .filter(|(_, l)| **l == lease)
            .map(|(k, _)| k.clone())
            .collect();
        for key in owned {
            inner.keys.remove(&key);
            Self::emit(inner, EventKind::Delete, &key);
        }
    }

    fn emit(inner: &mut Inner, kind: EventKind, key: &str) {
        inner.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }
            w.tx
                .send(StoreEvent {
                    kind,
                    key: key.to_string(),
                })
                .is_ok()
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn grant_lease(&self, _ttl: Duration) -> Result<LeaseGrant, SyncError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.next_lease += 1;
        let id = inner.next_lease;

        let (lost_tx, lost_rx) = oneshot::channel();
        inner.leases.insert(
            id,
            LeaseEntry {
                lost_tx: Some(lost_tx),
            },
        );

        Ok(LeaseGrant { id, lost: lost_rx })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.leases.remove(&lease);
        Self::drop_lease_keys(&mut inner, lease);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, lease: LeaseId) -> Result<bool, SyncError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if !inner.leases.contains_key(&lease) {
            return Err(SyncError::Store(
                format!("lease {lease} not found").into(),
            ));
        }
        if inner.keys.contains_key(key) {
            return Ok(false);
        }
        inner.keys.insert(key.to_string(), lease);
        Self::emit(&mut inner, EventKind::Put, key);
        Ok(true)
    }

    async fn delete_if_leased(&self, key: &str, lease: LeaseId) -> Result<bool, SyncError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner.keys.get(key) != Some(&lease) {
            return Ok(false);
        }
        inner.keys.remove(key);
        Self::emit(&mut inner, EventKind::Delete, key);
        Ok(true)
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryStore::new();
        let a = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        let b = store.grant_lease(Duration::from_secs(5)).await.unwrap();

        assert!(store.put_if_absent("shards/0", a.id).await.unwrap());
        assert!(!store.put_if_absent("shards/0", b.id).await.unwrap());
    }

    #[tokio::test]
    async fn conditional_delete_requires_ownership() {
        let store = MemoryStore::new();
        let a = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        let b = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store.put_if_absent("shards/1", a.id).await.unwrap();

        assert!(!store.delete_if_leased("shards/1", b.id).await.unwrap());
        assert!(store.contains_key("shards/1"));
        assert!(store.delete_if_leased("shards/1", a.id).await.unwrap());
        assert!(!store.contains_key("shards/1"));
    }

    #[tokio::test]
    async fn put_with_unknown_lease_is_an_error() {
        let store = MemoryStore::new();
        assert!(store.put_if_absent("shards/0", 42).await.is_err());
    }

    #[tokio::test]
    async fn expire_lease_deletes_keys_and_fires_lost() {
        let store = MemoryStore::new();
        let grant = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store.put_if_absent("shards/0", grant.id).await.unwrap();

        let mut events = store.watch_prefix("shards/").await.unwrap();
        store.expire_lease(grant.id);

        assert!(!store.contains_key("shards/0"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.key, "shards/0");
        assert!(grant.lost.await.is_ok());
    }

    #[tokio::test]
    async fn watch_only_sees_matching_prefix() {
        let store = MemoryStore::new();
        let grant = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        let mut events = store.watch_prefix("locks/").await.unwrap();

        store.put_if_absent("shards/0", grant.id).await.unwrap();
        store.put_if_absent("locks/connection", grant.id).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, "locks/connection");
        assert_eq!(event.kind, EventKind::Put);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn listing_is_ordered() {
        let store = MemoryStore::new();
        let grant = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        for key in ["shards/2", "shards/0", "shards/1"] {
            store.put_if_absent(key, grant.id).await.unwrap();
        }

        let keys = store.list("shards/").await.unwrap();
        assert_eq!(keys, vec!["shards/0", "shards/1", "shards/2"]);
    }
}
