//! Coordination store contract.
//!
//! The shard coordinator and the connection lock are written against this
//! trait rather than against etcd directly. The contract is deliberately
//! narrow: ordered key listing, TTL leases with a one-shot loss
//! notification, two conditional transactions, and best-effort prefix
//! watches. Cross-process ordering comes entirely from the conditional
//! transactions; watch events are a liveness hint and may be delayed,
//! coalesced or dropped.

use crate::error::SyncError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Lease identity issued by the store.
pub type LeaseId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single watch event. `key` is relative to the watched namespace.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub key: String,
}

/// A granted lease.
///
/// The backing implementation keeps the lease alive until it is revoked.
/// `lost` fires at most once, when keep-alive fails and the lease can no
/// longer be assumed to exist; keys bound to it are gone or about to be.
#[derive(Debug)]
pub struct LeaseGrant {
    pub id: LeaseId,
    pub lost: oneshot::Receiver<()>,
}

/// Strongly consistent key-value store with leases, conditional
/// transactions and watches.
///
/// Contention (a key that already exists, a lease binding that no longer
/// holds) is reported through the `bool` returns. `Err` is reserved for
/// transport, quota and permission failures, which callers treat as fatal.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// List existing keys under `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError>;

    /// Grant a lease with the given TTL and keep it alive until revoked.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant, SyncError>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), SyncError>;

    /// Create `key` bound to `lease` only if it does not already exist.
    /// Returns whether the claim won.
    async fn put_if_absent(&self, key: &str, lease: LeaseId) -> Result<bool, SyncError>;

    /// Delete `key` only if it is still bound to `lease`. Returns whether
    /// the delete applied.
    async fn delete_if_leased(&self, key: &str, lease: LeaseId) -> Result<bool, SyncError>;

    /// Open a long-lived watch over `prefix`. The channel closing signals
    /// that the watch is gone for good.
    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>, SyncError>;
}
