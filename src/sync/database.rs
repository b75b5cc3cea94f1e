//! Database Syncer
//!
//! Executes one database's reconciliation plan: schema creates first, then
//! index changes and data transfers on a bounded worker pool, drops last.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};

use super::cancel::CancellationToken;
use super::collection::{CollectionOutcome, CollectionStats, CollectionSyncer};
use super::pool::WorkerPool;
use super::SyncContext;
use crate::error::{Error, ErrorClass, Result};
use crate::inventory::{CollectionDescriptor, CreateAction, ReconciliationPlan, SyncAction, SyncMode};
use crate::state::{Checkpoint, CollectionPhase};
use crate::storage::run_blocking;

/// A collection that did not reach `Done`, with its cause
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCollection {
    pub database: String,
    pub collection: String,
    pub class: ErrorClass,
    pub error: String,
}

impl FailedCollection {
    pub(super) fn new(database: &str, collection: &str, error: &Error) -> Self {
        Self {
            database: database.to_string(),
            collection: collection.to_string(),
            class: error.class(),
            error: error.to_string(),
        }
    }
}

/// Aggregated result of one database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseOutcome {
    pub database: String,
    pub created: Vec<String>,
    pub dropped: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedCollection>,
    pub aborted: Vec<String>,
    pub untouched: Vec<String>,
    pub records_applied: u64,
    pub records_deleted: u64,
    pub bytes_transferred: u64,
    pub collections: Vec<CollectionStats>,
}

impl DatabaseOutcome {
    fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..Self::default()
        }
    }

    fn absorb(&mut self, stats: &CollectionStats) {
        self.records_applied += stats.records_applied;
        self.records_deleted += stats.records_deleted;
        self.bytes_transferred += stats.bytes_transferred;
        self.collections.push(stats.clone());
    }

    fn fail(&mut self, collection: &str, error: &Error) {
        self.failed
            .push(FailedCollection::new(&self.database, collection, error));
    }

    /// No failures and nothing left behind by cancellation
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_empty()
    }
}

/// Runs the plan of one database
pub struct DatabaseSyncer {
    ctx: SyncContext,
    database: String,
}

impl DatabaseSyncer {
    pub fn new(ctx: SyncContext, database: impl Into<String>) -> Self {
        Self {
            ctx,
            database: database.into(),
        }
    }

    /// Execute `plan` with at most `concurrency` collections transferring at
    /// once. Only fatal errors are returned as `Err`; every other failure is
    /// itemized in the outcome.
    pub async fn sync(
        &self,
        plan: &ReconciliationPlan,
        concurrency: usize,
        token: &CancellationToken,
    ) -> Result<DatabaseOutcome> {
        let db = self.database.as_str();
        let mut outcome = DatabaseOutcome::new(db);
        outcome.untouched = plan.untouched.clone();

        tracing::info!(
            database = db,
            create = plan.to_create.len(),
            sync = plan.transfer_count(),
            drop = plan.to_drop.len(),
            conflicts = plan.conflicts.len(),
            "Executing reconciliation plan"
        );

        for conflict in &plan.conflicts {
            let error = Error::SchemaConflict {
                collection: conflict.collection.clone(),
                reason: conflict.reason.clone(),
            };
            tracing::warn!("{}: {}", db, error);
            self.ctx
                .progress
                .set_phase(db, &conflict.collection, CollectionPhase::Failed);
            outcome.fail(&conflict.collection, &error);
        }

        // Schema first: every transfer assumes its collection exists
        let mut transfers: Vec<(CollectionDescriptor, SyncMode)> = Vec::new();
        for action in &plan.to_create {
            let name = action.descriptor.name.as_str();
            if token.is_cancelled() {
                outcome.aborted.push(name.to_string());
                continue;
            }
            match self.materialize(action).await {
                Ok(()) => {
                    outcome.created.push(name.to_string());
                    transfers.push((action.descriptor.clone(), SyncMode::Full));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!("Failed to create {}/{}: {}", db, name, e);
                    self.ctx.progress.set_phase(db, name, CollectionPhase::Failed);
                    outcome.fail(name, &e);
                }
            }
        }

        for action in &plan.to_sync {
            let name = action.descriptor.name.as_str();
            if !action.indexes.is_empty() {
                if let Err(e) = self.alter_indexes(action).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::warn!("Failed to update indexes of {}/{}: {}", db, name, e);
                    self.ctx.progress.set_phase(db, name, CollectionPhase::Failed);
                    outcome.fail(name, &e);
                    continue;
                }
            }
            if let Some(mode) = action.transfer {
                self.ctx.progress.set_phase(db, name, CollectionPhase::NotStarted);
                transfers.push((action.descriptor.clone(), mode));
            }
        }

        if let Some(fatal) = self.transfer(transfers, concurrency, token, &mut outcome).await {
            return Err(fatal);
        }

        // Drops only after every transfer reached a terminal state
        if token.is_cancelled() {
            if !plan.to_drop.is_empty() {
                tracing::info!("{}: skipping {} drops after abort", db, plan.to_drop.len());
            }
        } else {
            for name in &plan.to_drop {
                match self.drop_collection(name).await {
                    Ok(()) => outcome.dropped.push(name.clone()),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!("Failed to drop {}/{}: {}", db, name, e);
                        outcome.fail(name, &e);
                    }
                }
            }
        }

        tracing::info!(
            database = db,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            aborted = outcome.aborted.len(),
            records = outcome.records_applied,
            "Database sync finished"
        );
        Ok(outcome)
    }

    /// Run transfers on the worker pool, returning the first fatal error
    async fn transfer(
        &self,
        transfers: Vec<(CollectionDescriptor, SyncMode)>,
        concurrency: usize,
        token: &CancellationToken,
        outcome: &mut DatabaseOutcome,
    ) -> Option<Error> {
        let pool = WorkerPool::new(format!("sync-{}", self.database), concurrency, token);
        let mut joins = FuturesUnordered::new();

        for (descriptor, mode) in transfers {
            let syncer = CollectionSyncer::new(self.ctx.clone(), &self.database, &descriptor.name);
            let handle = pool.submit(descriptor.name.clone(), move |job_token| async move {
                syncer.sync(&descriptor, mode, &job_token).await
            });
            joins.push(async move {
                let name = handle.name().to_string();
                (name, handle.join().await)
            });
        }

        let mut fatal = None;
        while let Some((name, joined)) = joins.next().await {
            match joined {
                Ok(CollectionOutcome::Done(stats)) => {
                    outcome.absorb(&stats);
                    outcome.succeeded.push(name);
                }
                Ok(CollectionOutcome::Aborted(stats)) => {
                    outcome.absorb(&stats);
                    outcome.aborted.push(name);
                }
                Ok(CollectionOutcome::Failed { stats, error }) => {
                    outcome.absorb(&stats);
                    outcome.fail(&name, &error);
                    if error.is_fatal() && fatal.is_none() {
                        tracing::error!(
                            "Fatal error in {}/{}, stopping remaining collections: {}",
                            self.database,
                            name,
                            error
                        );
                        pool.cancel_all();
                        fatal = Some(error);
                    }
                }
                Err(Error::Cancelled) => {
                    self.ctx
                        .progress
                        .set_phase(&self.database, &name, CollectionPhase::Aborted);
                    outcome.aborted.push(name);
                }
                Err(e) => {
                    self.ctx
                        .progress
                        .set_phase(&self.database, &name, CollectionPhase::Failed);
                    outcome.fail(&name, &e);
                }
            }
        }

        outcome.succeeded.sort();
        outcome.aborted.sort();
        fatal
    }

    /// Create a collection with its indexes, replacing a mismatched one
    async fn materialize(&self, action: &CreateAction) -> Result<()> {
        let db = self.database.clone();
        let mut descriptor = action.descriptor.clone();
        descriptor.revision = None;
        let name = descriptor.name.clone();

        if action.replace_existing {
            tracing::info!("Recreating {}/{} with type {}", db, name, descriptor.collection_type);
            self.ctx.checkpoints.remove(&db, &name).await?;
        } else {
            tracing::info!("Creating {}/{}", db, name);
        }

        let replace = action.replace_existing;
        run_blocking(&self.ctx.storage, move |s| {
            if replace {
                s.drop_collection(&db, &descriptor.name)?;
            }
            s.create_database(&db)?;
            s.create_collection(&db, &descriptor)
        })
        .await?;

        let mut checkpoint = Checkpoint::new(&self.database, &name, SyncMode::Full);
        checkpoint.phase = CollectionPhase::SchemaReady;
        checkpoint.target_revision = action.descriptor.revision;
        self.ctx.checkpoints.save(&checkpoint).await?;
        self.ctx
            .progress
            .set_phase(&self.database, &name, CollectionPhase::SchemaReady);
        Ok(())
    }

    async fn alter_indexes(&self, action: &SyncAction) -> Result<()> {
        let db = self.database.clone();
        let collection = action.descriptor.name.clone();
        let diff = action.indexes.clone();
        tracing::info!(
            "Updating indexes of {}/{}: {} to create, {} to drop",
            db,
            collection,
            diff.to_create.len(),
            diff.to_drop.len()
        );
        run_blocking(&self.ctx.storage, move |s| {
            for name in &diff.to_drop {
                s.drop_index(&db, &collection, name)?;
            }
            for index in &diff.to_create {
                s.create_index(&db, &collection, index)?;
            }
            Ok(())
        })
        .await
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        tracing::info!("Dropping extraneous collection {}/{}", self.database, name);
        let (db, coll) = (self.database.clone(), name.to_string());
        run_blocking(&self.ctx.storage, move |s| s.drop_collection(&db, &coll)).await?;
        self.ctx.checkpoints.remove(&self.database, name).await
    }
}
