//! Run progress
//!
//! Live counters and per-collection phases of the current run, readable at
//! any time through `GlobalSyncer::progress`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inventory::ChunkMarker;
use crate::state::CollectionPhase;

/// Terminal and non-terminal states of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Progress of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSyncState {
    pub phase: CollectionPhase,
    pub last_marker: Option<ChunkMarker>,
    pub records_applied: u64,
}

impl Default for CollectionSyncState {
    fn default() -> Self {
        Self {
            phase: CollectionPhase::NotStarted,
            last_marker: None,
            records_applied: 0,
        }
    }
}

/// Point-in-time view of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub incremental: bool,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_applied: u64,
    pub records_deleted: u64,
    pub bytes_transferred: u64,
    pub chunks_applied: u64,
    /// Keyed by `database/collection`
    pub collections: BTreeMap<String, CollectionSyncState>,
}

#[derive(Debug)]
struct RunMeta {
    run_id: Uuid,
    incremental: bool,
    status: RunStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Shared progress of the current run
#[derive(Debug)]
pub struct ProgressTracker {
    meta: RwLock<RunMeta>,
    collections: RwLock<BTreeMap<String, CollectionSyncState>>,
    records_applied: AtomicU64,
    records_deleted: AtomicU64,
    bytes_transferred: AtomicU64,
    chunks_applied: AtomicU64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress key of a collection
pub fn collection_key(database: &str, collection: &str) -> String {
    format!("{}/{}", database, collection)
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            meta: RwLock::new(RunMeta {
                run_id: Uuid::nil(),
                incremental: false,
                status: RunStatus::Pending,
                started_at: None,
                finished_at: None,
            }),
            collections: RwLock::new(BTreeMap::new()),
            records_applied: AtomicU64::new(0),
            records_deleted: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            chunks_applied: AtomicU64::new(0),
        }
    }

    fn meta(&self) -> RwLockReadGuard<'_, RunMeta> {
        self.meta.read().unwrap_or_else(|e| e.into_inner())
    }

    fn meta_mut(&self) -> RwLockWriteGuard<'_, RunMeta> {
        self.meta.write().unwrap_or_else(|e| e.into_inner())
    }

    fn collections_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, CollectionSyncState>> {
        self.collections.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Reset for a new run
    pub fn begin(&self, run_id: Uuid, incremental: bool) {
        {
            let mut meta = self.meta_mut();
            meta.run_id = run_id;
            meta.incremental = incremental;
            meta.status = RunStatus::Running;
            meta.started_at = Some(Utc::now());
            meta.finished_at = None;
        }
        self.collections_mut().clear();
        self.records_applied.store(0, Ordering::SeqCst);
        self.records_deleted.store(0, Ordering::SeqCst);
        self.bytes_transferred.store(0, Ordering::SeqCst);
        self.chunks_applied.store(0, Ordering::SeqCst);
    }

    pub fn finish(&self, status: RunStatus) {
        let mut meta = self.meta_mut();
        meta.status = status;
        meta.finished_at = Some(Utc::now());
    }

    pub fn status(&self) -> RunStatus {
        self.meta().status
    }

    pub fn set_phase(&self, database: &str, collection: &str, phase: CollectionPhase) {
        self.collections_mut()
            .entry(collection_key(database, collection))
            .or_default()
            .phase = phase;
    }

    /// Account for one applied chunk
    pub fn record_chunk(
        &self,
        database: &str,
        collection: &str,
        marker: Option<&ChunkMarker>,
        records: u64,
        bytes: u64,
    ) {
        {
            let mut collections = self.collections_mut();
            let state = collections
                .entry(collection_key(database, collection))
                .or_default();
            if marker.is_some() {
                state.last_marker = marker.cloned();
            }
            state.records_applied += records;
        }
        self.records_applied.fetch_add(records, Ordering::SeqCst);
        self.bytes_transferred.fetch_add(bytes, Ordering::SeqCst);
        self.chunks_applied.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_deleted(&self, count: u64) {
        self.records_deleted.fetch_add(count, Ordering::SeqCst);
    }

    /// Collections registered in this run that have not reached `Done`
    pub fn incomplete(&self) -> Vec<String> {
        self.collections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, state)| state.phase != CollectionPhase::Done)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn snapshot(&self) -> SyncRun {
        let meta = self.meta();
        SyncRun {
            run_id: meta.run_id,
            incremental: meta.incremental,
            status: meta.status,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
            records_applied: self.records_applied.load(Ordering::SeqCst),
            records_deleted: self.records_deleted.load(Ordering::SeqCst),
            bytes_transferred: self.bytes_transferred.load(Ordering::SeqCst),
            chunks_applied: self.chunks_applied.load(Ordering::SeqCst),
            collections: self
                .collections
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
