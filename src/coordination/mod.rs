//! Fleet coordination through the shared coordination store.
//!
//! Two cooperating primitives keep a fleet of identical relay processes
//! from stepping on each other: [`sharding::Sharding`] assigns each process
//! a densely-packed shard id, and [`lock::ConnectionLock`] serializes
//! gateway connection attempts against Discord's identify rate limit.
//! Both are written against the [`store::CoordinationStore`] contract;
//! [`etcd::EtcdStore`] backs production and [`memory::MemoryStore`] backs
//! tests and single-node runs.

pub mod etcd;
pub mod lock;
pub mod memory;
pub mod sharding;
pub mod store;

pub use lock::{ConnectionLock, LockConfig};
pub use sharding::{Assignment, Sharding, ShardingConfig, ShardingHandle};
pub use store::{CoordinationStore, EventKind, LeaseGrant, LeaseId, StoreEvent};
