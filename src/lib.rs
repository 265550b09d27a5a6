//! chat-sync - sharded Discord chat relay coordinated through etcd
//!
//! A fleet of identical relay processes mirrors chat between a streaming
//! platform's pub/sub bus and Discord. Two primitives in [`coordination`]
//! keep the fleet honest: every process claims a densely-packed shard id
//! (partitioning the Discord gateway connection) and serializes gateway
//! connection attempts through a lease-bound exclusive lock. The [`relay`]
//! consumes both and does the actual message plumbing.

pub mod bus;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod relay;

pub use config::SyncConfig;
pub use error::SyncError;
