//! WolfSync - Full Synchronization Engine for Document-Store Followers
//!
//! Brings a follower node's databases, collections and indexes into parity
//! with a designated leader, for newly provisioned nodes, nodes that fell
//! behind the leader's retained change log, or explicit re-seeding.
//!
//! # Architecture
//!
//! A run is driven by the `GlobalSyncer`, which diffs each database's schema
//! against the leader's inventory and hands the resulting plan to a
//! `DatabaseSyncer`. Collections are transferred by `CollectionSyncer`s on a
//! bounded worker pool, either as an ordered chunk dump or by comparing
//! range checksums and repairing only the ranges that differ.
//!
//! # Features
//!
//! - Chunked, resumable transfers with durable per-collection checkpoints
//! - Incremental sync via hierarchical range checksums
//! - Schema reconciliation with an explicit drop/recreate policy
//! - Retry with exponential backoff for transient leader errors
//! - Cooperative cancellation observed at every chunk boundary
//! - A leader service so any node can seed others over TCP

pub mod config;
pub mod error;
pub mod inventory;
pub mod network;
pub mod state;
pub mod storage;
pub mod sync;
pub mod tuning;

#[cfg(test)]
mod testing;

pub use config::WolfSyncConfig;
pub use error::{Error, ErrorClass, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfSyncConfig;
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::inventory::{reconcile, DropPolicy, ReconciliationPlan, SyncMode};
    pub use crate::state::CheckpointStore;
    pub use crate::storage::{LocalStorage, MemoryStore, SharedStorage, SqliteStore};
    pub use crate::sync::{
        CancellationToken, GlobalSyncer, RemoteInventoryClient, RetryPolicy, SyncContext,
        SyncOutcome, SyncSummary,
    };
}
