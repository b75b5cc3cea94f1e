//! Global Syncer
//!
//! Entry point of a full synchronization run. Handshakes with the leader,
//! aligns the set of databases, then runs one `DatabaseSyncer` per database
//! and folds their outcomes into a `SyncSummary`.

use std::collections::BTreeSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cancel::CancellationToken;
use super::database::{DatabaseOutcome, DatabaseSyncer, FailedCollection};
use super::pool::WorkerPool;
use super::progress::{RunStatus, SyncRun};
use super::SyncContext;
use crate::error::{Error, Result};
use crate::inventory::{reconcile, DatabaseInventory};
use crate::storage::run_blocking;

/// Placeholder collection name for failures that hit a whole database
const WHOLE_DATABASE: &str = "*";

/// Result of a run that was not stopped by a fatal error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub incremental: bool,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Server id reported by the leader
    pub leader: Option<String>,
    pub databases_created: Vec<String>,
    pub databases_dropped: Vec<String>,
    pub databases: Vec<DatabaseOutcome>,
    pub failed: Vec<FailedCollection>,
    /// `database/collection` keys that did not reach `Done`
    pub incomplete: Vec<String>,
    pub records_applied: u64,
    pub records_deleted: u64,
    pub bytes_transferred: u64,
}

/// Caller-facing classification of a finished run
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    FullySucceeded,
    PartiallySucceeded { failed: Vec<FailedCollection> },
    Aborted,
}

impl SyncSummary {
    fn new(run_id: Uuid, incremental: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            incremental,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            leader: None,
            databases_created: Vec::new(),
            databases_dropped: Vec::new(),
            databases: Vec::new(),
            failed: Vec::new(),
            incomplete: Vec::new(),
            records_applied: 0,
            records_deleted: 0,
            bytes_transferred: 0,
        }
    }

    fn absorb(&mut self, outcome: DatabaseOutcome) {
        self.records_applied += outcome.records_applied;
        self.records_deleted += outcome.records_deleted;
        self.bytes_transferred += outcome.bytes_transferred;
        self.failed.extend(outcome.failed.iter().cloned());
        self.databases.push(outcome);
    }

    pub fn outcome(&self) -> SyncOutcome {
        match self.status {
            RunStatus::Aborted => SyncOutcome::Aborted,
            _ if self.failed.is_empty() => SyncOutcome::FullySucceeded,
            _ => SyncOutcome::PartiallySucceeded {
                failed: self.failed.clone(),
            },
        }
    }

    /// Every collection reached `Done`
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded && self.failed.is_empty()
    }
}

/// Token of the run in progress, or an abort waiting for the next run
#[derive(Default)]
struct RunControl {
    token: Option<CancellationToken>,
    abort_pending: bool,
}

/// Orchestrates full synchronization runs against one leader
pub struct GlobalSyncer {
    ctx: SyncContext,
    shutdown: CancellationToken,
    control: Mutex<RunControl>,
}

impl GlobalSyncer {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            shutdown: CancellationToken::new(),
            control: Mutex::new(RunControl::default()),
        }
    }

    /// Derive every run's token from `shutdown`, so cancelling it aborts
    /// the current run and any later one
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Abort the run in progress. Lower layers stop at their next chunk or
    /// range boundary and keep their checkpoints. With no run in progress
    /// the next run starts already aborted.
    pub fn abort(&self) {
        let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
        match control.token.clone() {
            Some(token) => {
                tracing::info!("Abort requested");
                token.cancel();
            }
            None => {
                tracing::info!("Abort requested before the run started");
                control.abort_pending = true;
            }
        }
    }

    /// Point-in-time view of the current (or last) run
    pub fn progress(&self) -> SyncRun {
        self.ctx.progress.snapshot()
    }

    /// Bring every database in line with the leader. With `incremental`
    /// false every collection is dumped in full; otherwise collections whose
    /// recorded revision matches the leader are skipped and the rest are
    /// compared range by range. An aborted run returns `Ok` with status
    /// `Aborted`; a fatal error returns `RunFailed`.
    pub async fn run(&self, incremental: bool) -> Result<SyncSummary> {
        let token = self.shutdown.child_token();
        {
            let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
            if std::mem::take(&mut control.abort_pending) {
                token.cancel();
            }
            control.token = Some(token.clone());
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.ctx.progress.begin(run_id, incremental);
        tracing::info!(
            run_id = %run_id,
            incremental = incremental,
            "Starting {} sync run",
            if incremental { "incremental" } else { "full" }
        );

        let mut summary = SyncSummary::new(run_id, incremental, started_at);
        let result = self.execute(&token, incremental, &mut summary).await;
        self.control.lock().unwrap_or_else(|e| e.into_inner()).token = None;

        summary.finished_at = Some(Utc::now());
        summary.incomplete = self.ctx.progress.incomplete();
        let result = match result {
            Ok(()) if token.is_cancelled() => {
                summary.status = RunStatus::Aborted;
                Ok(())
            }
            Ok(()) => {
                summary.status = RunStatus::Succeeded;
                Ok(())
            }
            Err(Error::Cancelled) => {
                summary.status = RunStatus::Aborted;
                Ok(())
            }
            Err(e) => {
                summary.status = RunStatus::Failed;
                Err(e)
            }
        };
        self.ctx.progress.finish(summary.status);

        let recorded = self
            .ctx
            .checkpoints
            .record_run(
                run_id,
                &summary.status.to_string(),
                started_at,
                summary.finished_at,
                &summary,
            )
            .await;

        match (result, recorded) {
            (Err(cause), _) => {
                tracing::error!(
                    run_id = %run_id,
                    incomplete = summary.incomplete.len(),
                    "Sync run failed: {}",
                    cause
                );
                Err(Error::RunFailed {
                    cause: Box::new(cause),
                    incomplete: summary.incomplete,
                })
            }
            (Ok(()), Err(e)) => {
                tracing::error!("Failed to record run {}: {}", run_id, e);
                Err(Error::RunFailed {
                    cause: Box::new(e),
                    incomplete: summary.incomplete,
                })
            }
            (Ok(()), Ok(())) => {
                tracing::info!(
                    run_id = %run_id,
                    status = %summary.status,
                    databases = summary.databases.len(),
                    failed = summary.failed.len(),
                    records = summary.records_applied,
                    deleted = summary.records_deleted,
                    bytes = summary.bytes_transferred,
                    "Sync run finished"
                );
                Ok(summary)
            }
        }
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        incremental: bool,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let leader = self.ctx.client.server_info(token).await?;
        tracing::info!(
            "Connected to leader {} (protocol {})",
            leader.server_id,
            leader.protocol_version
        );
        summary.leader = Some(leader.server_id);

        let databases: Vec<String> = self
            .ctx
            .client
            .list_databases(token)
            .await?
            .into_iter()
            .filter(|db| self.ctx.settings.includes_database(db))
            .collect();

        self.align_databases(&databases, summary).await?;

        let pool = WorkerPool::new("databases", self.ctx.settings.database_concurrency, token);
        let mut joins = FuturesUnordered::new();
        for database in databases {
            let ctx = self.ctx.clone();
            let handle = pool.submit(database.clone(), move |job_token| async move {
                sync_database(ctx, database, incremental, job_token).await
            });
            joins.push(async move {
                let name = handle.name().to_string();
                (name, handle.join().await.and_then(|r| r))
            });
        }

        let mut fatal = None;
        while let Some((database, joined)) = joins.next().await {
            match joined {
                Ok(outcome) => summary.absorb(outcome),
                Err(Error::Cancelled) => {
                    tracing::info!("Database {} not completed, run aborted", database);
                }
                Err(e) if e.is_fatal() => {
                    if fatal.is_none() {
                        tracing::error!("Fatal error in database {}: {}", database, e);
                        pool.cancel_all();
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    tracing::warn!("Database {} failed: {}", database, e);
                    summary
                        .failed
                        .push(FailedCollection::new(&database, WHOLE_DATABASE, &e));
                }
            }
        }
        summary.databases.sort_by(|a, b| a.database.cmp(&b.database));

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Create databases the follower lacks; drop extraneous ones if allowed
    async fn align_databases(&self, remote: &[String], summary: &mut SyncSummary) -> Result<()> {
        let local: BTreeSet<String> = run_blocking(&self.ctx.storage, |s| s.list_databases())
            .await?
            .into_iter()
            .collect();
        let remote_set: BTreeSet<&str> = remote.iter().map(String::as_str).collect();

        for database in remote.iter().filter(|db| !local.contains(db.as_str())) {
            tracing::info!("Creating database {}", database);
            let name = database.clone();
            run_blocking(&self.ctx.storage, move |s| s.create_database(&name)).await?;
            summary.databases_created.push(database.clone());
        }

        let settings = &self.ctx.settings;
        if !settings.drop_policy.drop_extraneous_databases || !settings.databases.is_empty() {
            return Ok(());
        }
        for database in local.iter().filter(|db| !remote_set.contains(db.as_str())) {
            tracing::info!("Dropping extraneous database {}", database);
            let name = database.clone();
            run_blocking(&self.ctx.storage, move |s| s.drop_database(&name)).await?;
            self.ctx.checkpoints.remove_database(database).await?;
            summary.databases_dropped.push(database.clone());
        }
        Ok(())
    }
}

/// Diff one database against the leader and execute the plan
async fn sync_database(
    ctx: SyncContext,
    database: String,
    incremental: bool,
    token: CancellationToken,
) -> Result<DatabaseOutcome> {
    let mut remote = ctx.client.inventory(&token, &database).await?;

    let db = database.clone();
    let local_collections = run_blocking(&ctx.storage, move |s| s.list_collections(&db)).await?;
    // Only revisions this follower has fully synced count as local state
    let done = ctx.checkpoints.done_revisions(&database).await?;
    let mut local = DatabaseInventory::from_collections(
        &database,
        local_collections.into_iter().map(|mut c| {
            c.revision = done.get(&c.name).copied();
            c
        }),
    );

    if ctx.settings.skip_system_collections {
        remote.collections.retain(|_, c| !c.is_system());
        local.collections.retain(|_, c| !c.is_system());
    }

    let plan = reconcile(&local, &remote, &ctx.settings.drop_policy, incremental);
    let concurrency = ctx.settings.collection_concurrency;
    DatabaseSyncer::new(ctx, &database)
        .sync(&plan, concurrency, &token)
        .await
}
