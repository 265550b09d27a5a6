//! etcd-backed coordination store.
//!
//! Keys are namespaced under a configurable root so several deployments can
//! share one etcd cluster. Claim and conditional-delete go through
//! transactions with explicit preconditions, never bare writes. Granted
//! leases are kept alive by a background task until revoked; a keep-alive
//! failure fires the lease's one-shot lost notification.

use crate::coordination::store::{
    CoordinationStore, EventKind, LeaseGrant, LeaseId, StoreEvent,
};
use crate::error::SyncError;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Coordination store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    namespace: String,
}

impl EtcdStore {
    /// Connect to etcd. `namespace` is prepended to every key; a trailing
    /// slash is added if missing.
    pub async fn connect(endpoints: &[String], namespace: &str) -> Result<Self, SyncError> {
        let client = Client::connect(endpoints, None).await?;
        debug!(?endpoints, namespace, "Connected to etcd");

        let namespace = if namespace.ends_with('/') {
            namespace.to_string()
        } else {
            format!("{namespace}/")
        };

        Ok(Self { client, namespace })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let mut client = self.client.clone();
        let full_prefix = self.full_key(prefix);
        let resp = client
            .get(
                full_prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;

        let mut keys = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str()?;
            // etcd returns keys in order; strip our namespace back off
            let relative = key.strip_prefix(self.namespace.as_str()).unwrap_or(key);
            keys.push(relative.to_string());
        }
        Ok(keys)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant, SyncError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl.as_secs() as i64, None).await?;
        let lease_id = resp.id();

        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let (lost_tx, lost_rx) = oneshot::channel();

        // Renew at a third of the TTL so a single dropped round trip does
        // not expire the lease.
        let interval = Duration::from_secs((ttl.as_secs() / 3).max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick

            loop {
                ticker.tick().await;

                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease_id, error = %e, "Lease keep-alive send failed");
                    break;
                }

                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        trace!(lease_id, ttl = resp.ttl(), "Lease keep-alive OK");
                    }
                    Ok(Some(_)) => {
                        warn!(lease_id, "Lease expired or revoked upstream");
                        break;
                    }
                    Ok(None) => {
                        warn!(lease_id, "Lease keep-alive stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(lease_id, error = %e, "Lease keep-alive failed");
                        break;
                    }
                }
            }

            let _ = lost_tx.send(());
        });

        debug!(lease_id, ttl_secs = ttl.as_secs(), "Lease granted");
        Ok(LeaseGrant {
            id: lease_id,
            lost: lost_rx,
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), SyncError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        debug!(lease_id = lease, "Lease revoked");
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, lease: LeaseId) -> Result<bool, SyncError> {
        let mut client = self.client.clone();
        let full_key = self.full_key(key);

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                full_key.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                full_key.as_str(),
                "",
                Some(PutOptions::new().with_lease(lease)),
            )]);

        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn delete_if_leased(&self, key: &str, lease: LeaseId) -> Result<bool, SyncError> {
        let mut client = self.client.clone();
        let full_key = self.full_key(key);

        let txn = Txn::new()
            .when(vec![Compare::lease(
                full_key.as_str(),
                CompareOp::Equal,
                lease,
            )])
            .and_then(vec![TxnOp::delete(full_key.as_str(), None)]);

        let resp = client.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> Result<mpsc::UnboundedReceiver<StoreEvent>, SyncError> {
        let mut client = self.client.clone();
        let full_prefix = self.full_key(prefix);

        let (watcher, mut stream) = client
            .watch(full_prefix.as_str(), Some(WatchOptions::new().with_prefix()))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let namespace = self.namespace.clone();

        tokio::spawn(async move {
            // The watcher handle must stay alive for the stream to keep
            // delivering events.
            let _watcher = watcher;

            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            warn!("Watch stream canceled by server");
                            return;
                        }
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else { continue };
                            let relative =
                                key.strip_prefix(namespace.as_str()).unwrap_or(key);
                            let kind = match event.event_type() {
                                EventType::Put => EventKind::Put,
                                EventType::Delete => EventKind::Delete,
                            };
                            let forwarded = tx.send(StoreEvent {
                                kind,
                                key: relative.to_string(),
                            });
                            if forwarded.is_err() {
                                return; // receiver gone, stop watching
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("Watch stream ended");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Watch stream failed");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
