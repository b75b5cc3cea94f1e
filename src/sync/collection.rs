//! Collection Syncer
//!
//! Moves one collection's data from the leader into local storage, either
//! as an ordered dump of resumable chunks or by comparing range checksums
//! and repairing only the ranges that differ.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::cancel::{ensure_active, CancellationToken};
use super::SyncContext;
use crate::error::{Error, Result};
use crate::inventory::{
    range_checksum, ChunkMarker, CollectionDescriptor, Document, KeyRange, KeyRevision, Revision,
    SyncMode, TransferChunk,
};
use crate::state::{Checkpoint, CollectionPhase};
use crate::storage::run_blocking;

/// Counters for one collection sync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    pub database: String,
    pub collection: String,
    pub mode: Option<SyncMode>,
    pub chunks_fetched: u64,
    pub chunks_applied: u64,
    pub records_applied: u64,
    pub records_deleted: u64,
    pub bytes_transferred: u64,
    /// Marker a resumed full transfer continued after
    pub resumed_from: Option<ChunkMarker>,
    pub ranges_compared: u64,
    pub ranges_repaired: u64,
    pub elapsed: Duration,
}

/// How a collection sync ended
#[derive(Debug)]
pub enum CollectionOutcome {
    Done(CollectionStats),
    /// Stopped by cancellation; the checkpoint is kept for a later run
    Aborted(CollectionStats),
    Failed { stats: CollectionStats, error: Error },
}

impl CollectionOutcome {
    pub fn stats(&self) -> &CollectionStats {
        match self {
            CollectionOutcome::Done(stats) | CollectionOutcome::Aborted(stats) => stats,
            CollectionOutcome::Failed { stats, .. } => stats,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, CollectionOutcome::Done(_))
    }
}

/// Pending work of a range comparison
enum Probe {
    /// Ask the leader for sub-range checksums of this range
    Compare(KeyRange),
    /// Diff this range key by key
    Repair(KeyRange),
}

/// Syncs the data of a single collection
pub struct CollectionSyncer {
    ctx: SyncContext,
    database: String,
    collection: String,
}

impl CollectionSyncer {
    pub fn new(ctx: SyncContext, database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            ctx,
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Bring the collection in line with `descriptor`. Never returns an error:
    /// failures and cancellation are part of the outcome.
    pub async fn sync(
        &self,
        descriptor: &CollectionDescriptor,
        mode: SyncMode,
        token: &CancellationToken,
    ) -> CollectionOutcome {
        let started = Instant::now();
        let mut stats = CollectionStats {
            database: self.database.clone(),
            collection: self.collection.clone(),
            mode: Some(mode),
            ..CollectionStats::default()
        };

        let result = self.run(descriptor, mode, token, &mut stats).await;
        stats.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                tracing::info!(
                    database = %self.database,
                    collection = %self.collection,
                    records = stats.records_applied,
                    deleted = stats.records_deleted,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "Collection synced"
                );
                CollectionOutcome::Done(stats)
            }
            Err(Error::Cancelled) => {
                tracing::info!(
                    "Sync of {}/{} aborted after {} records",
                    self.database,
                    self.collection,
                    stats.records_applied
                );
                self.mark(CollectionPhase::Aborted).await;
                CollectionOutcome::Aborted(stats)
            }
            Err(error) => {
                tracing::warn!(
                    "Sync of {}/{} failed ({}): {}",
                    self.database,
                    self.collection,
                    error.class(),
                    error
                );
                self.mark(CollectionPhase::Failed).await;
                CollectionOutcome::Failed { stats, error }
            }
        }
    }

    async fn run(
        &self,
        descriptor: &CollectionDescriptor,
        mode: SyncMode,
        token: &CancellationToken,
        stats: &mut CollectionStats,
    ) -> Result<()> {
        let target = descriptor.revision;
        let resumable = self
            .ctx
            .checkpoints
            .load(&self.database, &self.collection)
            .await?
            .filter(|cp| cp.resumable_at(target));

        let records = match (resumable, mode) {
            (Some(cp), _) if cp.marker.is_some() => {
                tracing::info!(
                    "Resuming {}/{} after {}",
                    self.database,
                    self.collection,
                    cp.marker.as_ref().map(ToString::to_string).unwrap_or_default()
                );
                stats.resumed_from = cp.marker.clone();
                stats.mode = Some(SyncMode::Full);
                self.full_transfer(target, cp.marker, cp.records_applied, token, stats)
                    .await?
            }
            (_, SyncMode::Full) => {
                stats.mode = Some(SyncMode::Full);
                self.full_transfer(target, None, 0, token, stats).await?
            }
            (_, SyncMode::Incremental) => self.incremental(target, token, stats).await?,
        };

        let mut done = Checkpoint::new(&self.database, &self.collection, stats.mode.unwrap_or(mode));
        done.phase = CollectionPhase::Done;
        done.target_revision = target;
        done.records_applied = records;
        self.ctx.checkpoints.save(&done).await?;
        self.ctx
            .progress
            .set_phase(&self.database, &self.collection, CollectionPhase::Done);
        Ok(())
    }

    /// Ordered chunk dump. Starts after `resume` when given, otherwise
    /// truncates the local collection first. Returns the records applied
    /// to the collection across all attempts of this transfer.
    async fn full_transfer(
        &self,
        target: Option<Revision>,
        resume: Option<ChunkMarker>,
        records_before: u64,
        token: &CancellationToken,
        stats: &mut CollectionStats,
    ) -> Result<u64> {
        let mut checkpoint = Checkpoint::new(&self.database, &self.collection, SyncMode::Full);
        checkpoint.phase = CollectionPhase::Transferring;
        checkpoint.target_revision = target;
        checkpoint.marker = resume.clone();
        checkpoint.records_applied = records_before;

        ensure_active(token)?;
        if resume.is_none() {
            let (db, coll) = (self.database.clone(), self.collection.clone());
            run_blocking(&self.ctx.storage, move |s| s.truncate_collection(&db, &coll)).await?;
        }
        self.ctx.checkpoints.save(&checkpoint).await?;
        self.ctx
            .progress
            .set_phase(&self.database, &self.collection, CollectionPhase::Transferring);

        let chunk_size = self.ctx.settings.chunk_size;
        let mut after = resume.map(|m| m.key);

        loop {
            ensure_active(token)?;
            let chunk = self
                .ctx
                .client
                .fetch_chunk(token, &self.database, &self.collection, after.as_deref(), chunk_size)
                .await?;
            stats.chunks_fetched += 1;
            self.check_order(&chunk, after.as_deref())?;

            let Some(last) = chunk.records.last() else {
                if chunk.end_of_collection {
                    break;
                }
                return Err(Error::Remote(format!(
                    "empty chunk for {}/{} before end of collection",
                    self.database, self.collection
                )));
            };
            let marker = ChunkMarker {
                key: last.key.clone(),
                revision: last.revision,
            };
            let end_of_collection = chunk.end_of_collection;
            let bytes = chunk.size() as u64;
            let count = chunk.records.len() as u64;

            ensure_active(token)?;
            self.apply(chunk.records).await?;
            stats.chunks_applied += 1;
            stats.records_applied += count;
            stats.bytes_transferred += bytes;

            checkpoint.marker = Some(marker.clone());
            checkpoint.records_applied += count;
            checkpoint.updated_at = Utc::now();
            self.ctx.checkpoints.save(&checkpoint).await?;
            self.ctx.progress.record_chunk(
                &self.database,
                &self.collection,
                Some(&marker),
                count,
                bytes,
            );
            tracing::debug!(
                "Applied {} records to {}/{} up to {}",
                count,
                self.database,
                self.collection,
                marker
            );

            after = Some(marker.key);
            if end_of_collection {
                break;
            }
        }

        Ok(checkpoint.records_applied)
    }

    /// Records must come in strictly increasing key order after `after`
    fn check_order(&self, chunk: &TransferChunk, after: Option<&str>) -> Result<()> {
        let mut previous = after;
        for record in &chunk.records {
            if previous.map_or(false, |p| record.key.as_str() <= p) {
                return Err(Error::Remote(format!(
                    "out-of-order record {} in chunk for {}/{}",
                    record.key, self.database, self.collection
                )));
            }
            previous = Some(record.key.as_str());
        }
        Ok(())
    }

    /// Hierarchical range comparison, coarsest ranges first, repairing
    /// differing leaf ranges in key order. Returns records applied.
    async fn incremental(
        &self,
        target: Option<Revision>,
        token: &CancellationToken,
        stats: &mut CollectionStats,
    ) -> Result<u64> {
        let mut checkpoint = Checkpoint::new(&self.database, &self.collection, SyncMode::Incremental);
        checkpoint.phase = CollectionPhase::Verifying;
        checkpoint.target_revision = target;
        self.ctx.checkpoints.save(&checkpoint).await?;
        self.ctx
            .progress
            .set_phase(&self.database, &self.collection, CollectionPhase::Verifying);

        let granularity = self.ctx.settings.checksum_granularity.max(2);
        let leaf_size = self.ctx.settings.checksum_leaf_size.max(1) as u64;
        let mut stack = vec![Probe::Compare(KeyRange::full())];

        while let Some(probe) = stack.pop() {
            ensure_active(token)?;
            match probe {
                Probe::Compare(range) => {
                    let summaries = self
                        .ctx
                        .client
                        .range_checksums(token, &self.database, &self.collection, &range, granularity)
                        .await?;
                    stats.ranges_compared += 1;

                    let mut differing = Vec::new();
                    for summary in summaries {
                        let local = self.local_keys(&summary.range).await?;
                        if local.len() as u64 == summary.count
                            && range_checksum(&local) == summary.checksum
                        {
                            continue;
                        }
                        let splittable = summary.count > leaf_size && summary.range != range;
                        differing.push(if splittable {
                            Probe::Compare(summary.range)
                        } else {
                            Probe::Repair(summary.range)
                        });
                    }
                    // Stack order keeps repairs ascending by key
                    stack.extend(differing.into_iter().rev());
                }
                Probe::Repair(range) => {
                    stats.ranges_repaired += 1;
                    self.repair(&range, token, stats).await?;
                }
            }
        }

        Ok(stats.records_applied)
    }

    /// Make one range identical to the leader's
    async fn repair(&self, range: &KeyRange, token: &CancellationToken, stats: &mut CollectionStats) -> Result<()> {
        let remote = self
            .ctx
            .client
            .range_keys(token, &self.database, &self.collection, range)
            .await?;
        let local = self.local_keys(range).await?;

        let local_revisions: HashMap<&str, Revision> =
            local.iter().map(|kr| (kr.key.as_str(), kr.revision)).collect();
        let remote_keys: HashSet<&str> = remote.iter().map(|kr| kr.key.as_str()).collect();

        let stale: Vec<String> = remote
            .iter()
            .filter(|kr| local_revisions.get(kr.key.as_str()) != Some(&kr.revision))
            .map(|kr| kr.key.clone())
            .collect();
        let extraneous: Vec<String> = local
            .iter()
            .filter(|kr| !remote_keys.contains(kr.key.as_str()))
            .map(|kr| kr.key.clone())
            .collect();

        tracing::debug!(
            "Range {} of {}/{}: {} to fetch, {} to delete",
            range,
            self.database,
            self.collection,
            stale.len(),
            extraneous.len()
        );

        let chunk_size = self.ctx.settings.chunk_size.max(1);
        for keys in stale.chunks(chunk_size) {
            ensure_active(token)?;
            let docs = self
                .ctx
                .client
                .fetch_documents(token, &self.database, &self.collection, keys.to_vec())
                .await?;
            stats.chunks_fetched += 1;

            let count = docs.len() as u64;
            let bytes = docs.iter().map(Document::size).sum::<usize>() as u64;
            ensure_active(token)?;
            self.apply(docs).await?;
            stats.chunks_applied += 1;
            stats.records_applied += count;
            stats.bytes_transferred += bytes;
            self.ctx
                .progress
                .record_chunk(&self.database, &self.collection, None, count, bytes);
        }

        for keys in extraneous.chunks(chunk_size) {
            ensure_active(token)?;
            let (db, coll, batch) = (self.database.clone(), self.collection.clone(), keys.to_vec());
            run_blocking(&self.ctx.storage, move |s| s.delete_keys(&db, &coll, &batch)).await?;
            stats.records_deleted += keys.len() as u64;
            self.ctx.progress.record_deleted(keys.len() as u64);
        }

        Ok(())
    }

    async fn apply(&self, records: Vec<Document>) -> Result<()> {
        let (db, coll) = (self.database.clone(), self.collection.clone());
        run_blocking(&self.ctx.storage, move |s| s.apply_records(&db, &coll, &records)).await
    }

    async fn local_keys(&self, range: &KeyRange) -> Result<Vec<KeyRevision>> {
        let (db, coll, range) = (self.database.clone(), self.collection.clone(), range.clone());
        run_blocking(&self.ctx.storage, move |s| s.key_revisions(&db, &coll, &range)).await
    }

    /// Record a terminal phase, keeping the checkpoint's marker
    async fn mark(&self, phase: CollectionPhase) {
        self.ctx
            .progress
            .set_phase(&self.database, &self.collection, phase);

        let result = async {
            if let Some(mut checkpoint) = self
                .ctx
                .checkpoints
                .load(&self.database, &self.collection)
                .await?
            {
                checkpoint.phase = phase;
                checkpoint.updated_at = Utc::now();
                self.ctx.checkpoints.save(&checkpoint).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                "Failed to record {} for {}/{}: {}",
                phase,
                self.database,
                self.collection,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, MemoryStore};
    use crate::testing::{self, InstrumentedTransport};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        leader: Arc<MemoryStore>,
        follower: Arc<MemoryStore>,
        transport: Arc<InstrumentedTransport>,
        ctx: SyncContext,
    }

    fn fixture(dir: &std::path::Path, records: usize, chunk_size: usize) -> Fixture {
        let leader = testing::leader_with(&[("shop", "items", records)]);
        let follower = Arc::new(MemoryStore::new());
        testing::mirror_schema(&leader, &follower, "shop");
        let transport = Arc::new(InstrumentedTransport::new(leader.clone()));
        let ctx = testing::context(dir, transport.clone(), follower.clone(), testing::settings(chunk_size));
        Fixture {
            leader,
            follower,
            transport,
            ctx,
        }
    }

    fn descriptor(leader: &MemoryStore) -> CollectionDescriptor {
        leader.list_collections("shop").unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_full_sync_chunks_and_markers() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), 10_000, 1000);
        let desc = descriptor(&fx.leader);

        let syncer = CollectionSyncer::new(fx.ctx.clone(), "shop", "items");
        let outcome = syncer.sync(&desc, SyncMode::Full, &CancellationToken::new()).await;

        assert!(outcome.is_done(), "{:?}", outcome);
        assert_eq!(outcome.stats().records_applied, 10_000);
        assert_eq!(fx.transport.count("ChunkRequest"), 10);
        assert_eq!(fx.follower.apply_calls(), 10);

        // Each request starts after the previous chunk's last key
        let afters = fx.transport.chunk_afters("items");
        assert_eq!(afters[0], None);
        for (i, after) in afters.iter().enumerate().skip(1) {
            assert_eq!(after.as_deref(), Some(testing::key(i * 1000 - 1).as_str()));
        }

        assert_eq!(
            fx.follower.documents("shop", "items").unwrap(),
            fx.leader.documents("shop", "items").unwrap()
        );

        let cp = fx.ctx.checkpoints.load("shop", "items").await.unwrap().unwrap();
        assert_eq!(cp.phase, CollectionPhase::Done);
        assert_eq!(cp.target_revision, desc.revision);
    }

    #[tokio::test]
    async fn test_full_sync_removes_stale_local_records() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), 30, 10);
        fx.follower.insert("shop", "items", "zzz-local-only", b"{}").unwrap();

        let syncer = CollectionSyncer::new(fx.ctx.clone(), "shop", "items");
        let outcome = syncer
            .sync(&descriptor(&fx.leader), SyncMode::Full, &CancellationToken::new())
            .await;

        assert!(outcome.is_done());
        assert!(fx.follower.get("shop", "items", "zzz-local-only").unwrap().is_none());
        assert_eq!(fx.follower.count("shop", "items").unwrap(), 30);
    }

    #[tokio::test]
    async fn test_transient_failure_resumes_from_marker() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), 50, 10);
        // Attempt 3 is the fourth chunk request
        fx.transport.fail_chunk_attempt(3);

        let syncer = CollectionSyncer::new(fx.ctx.clone(), "shop", "items");
        let outcome = syncer
            .sync(&descriptor(&fx.leader), SyncMode::Full, &CancellationToken::new())
            .await;
        assert!(outcome.is_done());

        let afters = fx.transport.chunk_afters("items");
        assert_eq!(afters.len(), 6);
        // The retried request repeats the failed one, not the first
        assert_eq!(afters[3], afters[4]);
        assert_eq!(afters[4].as_deref(), Some(testing::key(29).as_str()));
        assert_eq!(fx.follower.apply_calls(), 5);
    }

    #[tokio::test]
    async fn test_cancel_then_resume() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), 100, 10);
        let desc = descriptor(&fx.leader);

        let token = CancellationToken::new();
        fx.transport.cancel_after_chunks(3, token.clone());
        let syncer = CollectionSyncer::new(fx.ctx.clone(), "shop", "items");
        let outcome = syncer.sync(&desc, SyncMode::Full, &token).await;

        // Third chunk was fetched but not applied
        assert!(matches!(outcome, CollectionOutcome::Aborted(_)));
        assert_eq!(fx.follower.apply_calls(), 2);
        let cp = fx.ctx.checkpoints.load("shop", "items").await.unwrap().unwrap();
        assert_eq!(cp.phase, CollectionPhase::Aborted);
        assert_eq!(cp.marker.as_ref().unwrap().key, testing::key(19));

        // Fresh transport: nothing already applied is requested again
        let transport = Arc::new(InstrumentedTransport::new(fx.leader.clone()));
        let ctx = testing::context(dir.path(), transport.clone(), fx.follower.clone(), testing::settings(10));
        let outcome = CollectionSyncer::new(ctx, "shop", "items")
            .sync(&desc, SyncMode::Incremental, &CancellationToken::new())
            .await;

        assert!(outcome.is_done());
        assert_eq!(outcome.stats().resumed_from.as_ref().unwrap().key, testing::key(19));
        assert_eq!(transport.chunk_afters("items")[0].as_deref(), Some(testing::key(19).as_str()));
        assert_eq!(transport.count("ChunkRequest"), 8);
        assert_eq!(fx.follower.apply_calls(), 10);
        assert_eq!(fx.follower.count("shop", "items").unwrap(), 100);
    }

    #[tokio::test]
    async fn test_incremental_repairs_only_differences() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), 200, 50);

        // Start from an identical copy, then diverge a little
        for doc in fx.leader.documents("shop", "items").unwrap() {
            fx.follower.apply_records("shop", "items", &[doc]).unwrap();
        }
        fx.leader.insert("shop", "items", &testing::key(17), b"{\"n\":-1}").unwrap();
        fx.leader.insert("shop", "items", "k99999", b"{}").unwrap();
        fx.leader.remove("shop", "items", &testing::key(150)).unwrap();
        fx.follower.insert("shop", "items", "a-local-only", b"{}").unwrap();
        let applies_before = fx.follower.apply_calls();

        let syncer = CollectionSyncer::new(fx.ctx.clone(), "shop", "items");
        let outcome = syncer
            .sync(&descriptor(&fx.leader), SyncMode::Incremental, &CancellationToken::new())
            .await;

        assert!(outcome.is_done(), "{:?}", outcome);
        assert_eq!(fx.transport.count("ChunkRequest"), 0);
        assert_eq!(outcome.stats().records_applied, 2);
        assert_eq!(outcome.stats().records_deleted, 2);
        assert!(fx.follower.apply_calls() - applies_before <= 2);
        assert_eq!(
            fx.follower.documents("shop", "items").unwrap(),
            fx.leader.documents("shop", "items").unwrap()
        );
    }

    #[tokio::test]
    async fn test_incremental_on_empty_follower_converges() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), 75, 20);

        let outcome = CollectionSyncer::new(fx.ctx.clone(), "shop", "items")
            .sync(&descriptor(&fx.leader), SyncMode::Incremental, &CancellationToken::new())
            .await;

        assert!(outcome.is_done());
        assert_eq!(
            fx.follower.documents("shop", "items").unwrap(),
            fx.leader.documents("shop", "items").unwrap()
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_collection() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path(), 20, 10);
        fx.transport.fail_next(10);

        let outcome = CollectionSyncer::new(fx.ctx.clone(), "shop", "items")
            .sync(&descriptor(&fx.leader), SyncMode::Full, &CancellationToken::new())
            .await;

        match outcome {
            CollectionOutcome::Failed { error, .. } => {
                assert!(matches!(error, Error::RetriesExhausted { .. }));
                assert!(!error.is_fatal());
            }
            other => panic!("expected failure, got {:?}", other),
        }
        let cp = fx.ctx.checkpoints.load("shop", "items").await.unwrap().unwrap();
        assert_eq!(cp.phase, CollectionPhase::Failed);
    }
}
