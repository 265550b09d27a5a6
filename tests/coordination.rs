//! Fleet coordination behavior, end to end over the in-process store.
//!
//! Every test drives the real coordinator and lock tasks under paused time,
//! so lease TTLs, the delete debounce and lock backoff windows elapse
//! deterministically.

use chat_sync::coordination::memory::MemoryStore;
use chat_sync::coordination::{
    Assignment, ConnectionLock, CoordinationStore, LockConfig, Sharding, ShardingConfig,
    ShardingHandle,
};
use chat_sync::error::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const LEASE_TTL: Duration = Duration::from_secs(5);
const RESYNC_DELAY: Duration = Duration::from_secs(15);
const LOCK_TTL: Duration = Duration::from_secs(6);

fn sharding_config() -> ShardingConfig {
    ShardingConfig {
        lease_ttl: LEASE_TTL,
        resync_delay: RESYNC_DELAY,
    }
}

async fn spawn_coordinator(
    store: &Arc<MemoryStore>,
) -> (ShardingHandle, JoinHandle<Result<(), SyncError>>) {
    let (sharding, handle) = Sharding::start(Arc::clone(store), sharding_config())
        .await
        .expect("watch establishment");
    let task = tokio::spawn(sharding.run());
    (handle, task)
}

/// Wait (in virtual time) until the assignment satisfies the predicate.
async fn wait_for(
    rx: &mut watch::Receiver<Assignment>,
    pred: impl Fn(Assignment) -> bool,
) -> Assignment {
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            let current = *rx.borrow_and_update();
            if pred(current) {
                return current;
            }
            rx.changed().await.expect("coordinator went away");
        }
    })
    .await
    .expect("assignment did not converge")
}

fn assigned(id: u64, total: u64) -> impl Fn(Assignment) -> bool {
    move |a| a == Assignment::Assigned { id, total }
}

#[tokio::test(start_paused = true)]
async fn single_coordinator_claims_shard_zero() {
    let store = Arc::new(MemoryStore::new());
    let (handle, _task) = spawn_coordinator(&store).await;

    let mut rx = handle.assignments();
    wait_for(&mut rx, assigned(0, 1)).await;
    assert!(store.contains_key("shards/0"));
}

#[tokio::test(start_paused = true)]
async fn joining_coordinator_updates_the_fleet() {
    let store = Arc::new(MemoryStore::new());

    let (first, _task_a) = spawn_coordinator(&store).await;
    let mut rx_a = first.assignments();
    wait_for(&mut rx_a, assigned(0, 1)).await;

    let (second, _task_b) = spawn_coordinator(&store).await;
    let mut rx_b = second.assignments();

    // The new slot's put event pushes the total out to the first process.
    wait_for(&mut rx_b, assigned(1, 2)).await;
    wait_for(&mut rx_a, assigned(0, 2)).await;
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_shrinks_the_survivors() {
    let store = Arc::new(MemoryStore::new());

    let (first, _task_a) = spawn_coordinator(&store).await;
    let mut rx_a = first.assignments();
    wait_for(&mut rx_a, assigned(0, 1)).await;

    let (second, task_b) = spawn_coordinator(&store).await;
    wait_for(&mut first.assignments(), assigned(0, 2)).await;

    second.stop().await;
    task_b.await.expect("join").expect("clean stop");
    assert!(!store.contains_key("shards/1"));

    // The survivor reacts after the delete debounce.
    wait_for(&mut rx_a, assigned(0, 1)).await;
}

#[tokio::test(start_paused = true)]
async fn lease_loss_is_recovered_without_duplicates() {
    let store = Arc::new(MemoryStore::new());

    let (first, _task_a) = spawn_coordinator(&store).await;
    wait_for(&mut first.assignments(), assigned(0, 1)).await;
    let (second, _task_b) = spawn_coordinator(&store).await;
    let mut rx_b = second.assignments();
    wait_for(&mut rx_b, assigned(1, 2)).await;

    // Simulate a missed keep-alive on the second process.
    let lease = store.lease_of("shards/1").expect("slot key exists");
    store.expire_lease(lease);

    // It drops to Unassigned, re-grants and reclaims its slot under a
    // fresh lease.
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            match store.lease_of("shards/1") {
                Some(current) if current != lease => break,
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    })
    .await
    .expect("slot was not reclaimed");

    wait_for(&mut rx_b, assigned(1, 2)).await;
    assert!(store.contains_key("shards/0"));
    assert!(store.contains_key("shards/1"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_assign_dense_unique_ids() {
    let store = Arc::new(MemoryStore::new());
    const FLEET: u64 = 4;

    let mut handles = Vec::new();
    for _ in 0..FLEET {
        let (handle, _task) = spawn_coordinator(&store).await;
        handles.push((handle, _task));
    }

    let mut ids = Vec::new();
    for (handle, _) in &handles {
        let mut rx = handle.assignments();
        let assignment =
            wait_for(&mut rx, |a| a.shard_count() == Some(FLEET)).await;
        ids.push(assignment.shard_id().expect("assigned"));
    }

    ids.sort_unstable();
    assert_eq!(ids, (0..FLEET).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn preseeded_slot_is_respected() {
    let store = Arc::new(MemoryStore::new());

    // Another live process already holds slot 0.
    let external = store.grant_lease(LEASE_TTL).await.unwrap();
    assert!(store.put_if_absent("shards/0", external.id).await.unwrap());

    let (handle, _task) = spawn_coordinator(&store).await;
    wait_for(&mut handle.assignments(), assigned(1, 2)).await;
}

#[tokio::test(start_paused = true)]
async fn vacated_low_id_is_reclaimed_after_the_debounce() {
    let store = Arc::new(MemoryStore::new());

    let (first, task_a) = spawn_coordinator(&store).await;
    wait_for(&mut first.assignments(), assigned(0, 1)).await;
    let (second, _task_b) = spawn_coordinator(&store).await;
    wait_for(&mut second.assignments(), assigned(1, 2)).await;
    let (third, _task_c) = spawn_coordinator(&store).await;
    let mut rx_c = third.assignments();
    wait_for(&mut rx_c, assigned(2, 3)).await;

    // Shard 0 leaves; the out-of-range holder (id 2) takes the vacancy, and
    // only after the debounce window has absorbed the churn.
    let left = Instant::now();
    first.stop().await;
    task_a.await.expect("join").expect("clean stop");

    wait_for(&mut rx_c, assigned(0, 2)).await;
    assert!(left.elapsed() >= RESYNC_DELAY, "resync must be debounced");

    wait_for(&mut second.assignments(), assigned(1, 2)).await;
    assert!(store.contains_key("shards/0"));
    assert!(store.contains_key("shards/1"));
    assert!(!store.contains_key("shards/2"));
}

#[tokio::test(start_paused = true)]
async fn lock_grants_exactly_one_holder_until_expiry() {
    let store = Arc::new(MemoryStore::new());
    let config = LockConfig { ttl: LOCK_TTL };

    let mut holder = ConnectionLock::start(Arc::clone(&store), config.clone())
        .await
        .unwrap();
    let mut waiter = ConnectionLock::start(Arc::clone(&store), config)
        .await
        .unwrap();

    let started = Instant::now();
    holder.acquire().await.unwrap();

    // The holder never renews: the waiter gets in only once the hold
    // lapses, one TTL after acquisition.
    waiter.acquire().await.unwrap();
    assert!(started.elapsed() >= LOCK_TTL);
    assert!(store.contains_key("locks/connection"));
}

#[tokio::test(start_paused = true)]
async fn renewing_holder_keeps_the_waiter_out() {
    let store = Arc::new(MemoryStore::new());
    let config = LockConfig { ttl: LOCK_TTL };

    let mut holder = ConnectionLock::start(Arc::clone(&store), config.clone())
        .await
        .unwrap();
    let mut waiter = ConnectionLock::start(Arc::clone(&store), config)
        .await
        .unwrap();

    holder.acquire().await.unwrap();

    // Renew once shortly before expiry, extending the hold to ~10s.
    let renewer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        holder.renew();
        holder
    });

    let started = Instant::now();
    waiter.acquire().await.unwrap();
    assert!(
        started.elapsed() >= Duration::from_secs(10) - Duration::from_millis(100),
        "waiter got in before the renewed hold lapsed"
    );

    renewer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn early_release_cuts_the_backoff_short() {
    let store = Arc::new(MemoryStore::new());
    let config = LockConfig { ttl: LOCK_TTL };

    let mut holder = ConnectionLock::start(Arc::clone(&store), config.clone())
        .await
        .unwrap();
    let mut waiter = ConnectionLock::start(Arc::clone(&store), config)
        .await
        .unwrap();

    holder.acquire().await.unwrap();

    // Drop the holder's key out from under it, as an explicit early
    // release would.
    let lease = store.lease_of("locks/connection").expect("lock key held");

    let waited = tokio::spawn(async move {
        let started = Instant::now();
        waiter.backoff().await.unwrap();
        started.elapsed()
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    store.expire_lease(lease);

    let elapsed = waited.await.unwrap();
    assert!(
        elapsed < LOCK_TTL,
        "backoff should resolve on the delete event, not the 2x TTL timeout"
    );
}
