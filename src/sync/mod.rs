//! Sync Module
//!
//! The follower side of a full synchronization: run orchestration, per
//! database fan-out, per collection transfer, and the retry, cancellation
//! and worker pool plumbing they share.

pub mod cancel;
mod collection;
mod database;
mod global;
pub mod pool;
pub mod progress;
pub mod remote;
pub mod retry;

pub use cancel::CancellationToken;
pub use collection::{CollectionOutcome, CollectionStats, CollectionSyncer};
pub use database::{DatabaseOutcome, DatabaseSyncer, FailedCollection};
pub use global::{GlobalSyncer, SyncOutcome, SyncSummary};
pub use pool::{JobHandle, WorkerPool};
pub use progress::{CollectionSyncState, ProgressTracker, RunStatus, SyncRun};
pub use remote::{LeaderTransport, LocalTransport, RemoteInventoryClient};
pub use retry::RetryPolicy;

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::state::CheckpointStore;
use crate::storage::SharedStorage;

/// Everything a syncer at any level needs, cheap to clone into workers
#[derive(Clone)]
pub struct SyncContext {
    pub client: RemoteInventoryClient,
    pub storage: SharedStorage,
    pub checkpoints: Arc<CheckpointStore>,
    pub progress: Arc<ProgressTracker>,
    pub settings: Arc<SyncConfig>,
}

impl SyncContext {
    /// Build a context, resolving auto-detected concurrency and chunk size
    pub fn new(
        client: RemoteInventoryClient,
        storage: SharedStorage,
        checkpoints: Arc<CheckpointStore>,
        mut settings: SyncConfig,
    ) -> Self {
        crate::tuning::resolve_sync_settings(&mut settings);
        settings.database_concurrency = settings.database_concurrency.max(1);
        Self {
            client,
            storage,
            checkpoints,
            progress: Arc::new(ProgressTracker::new()),
            settings: Arc::new(settings),
        }
    }
}
