//! Checkpoint Store
//!
//! Persistent per-collection sync progress, so an interrupted run can pick up
//! after the last applied chunk instead of starting over. Also keeps a short
//! history of finished runs.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::inventory::{ChunkMarker, Revision, SyncMode};

/// Lifecycle of one collection inside a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionPhase {
    NotStarted,
    /// Collection and indexes exist locally, no data yet
    SchemaReady,
    Transferring,
    /// Comparing ranges against the leader
    Verifying,
    Done,
    Failed,
    Aborted,
}

impl CollectionPhase {
    /// Phases that end a collection's participation in a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CollectionPhase::Done | CollectionPhase::Failed | CollectionPhase::Aborted
        )
    }
}

impl std::fmt::Display for CollectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectionPhase::NotStarted => "not_started",
            CollectionPhase::SchemaReady => "schema_ready",
            CollectionPhase::Transferring => "transferring",
            CollectionPhase::Verifying => "verifying",
            CollectionPhase::Done => "done",
            CollectionPhase::Failed => "failed",
            CollectionPhase::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CollectionPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(CollectionPhase::NotStarted),
            "schema_ready" => Ok(CollectionPhase::SchemaReady),
            "transferring" => Ok(CollectionPhase::Transferring),
            "verifying" => Ok(CollectionPhase::Verifying),
            "done" => Ok(CollectionPhase::Done),
            "failed" => Ok(CollectionPhase::Failed),
            "aborted" => Ok(CollectionPhase::Aborted),
            other => Err(Error::State(format!("unknown collection phase: {}", other))),
        }
    }
}

/// Durable progress of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub database: String,
    pub collection: String,
    pub phase: CollectionPhase,
    pub mode: SyncMode,
    /// Last record applied by a full transfer
    pub marker: Option<ChunkMarker>,
    /// Leader revision the transfer is converging to
    pub target_revision: Option<Revision>,
    pub records_applied: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(database: impl Into<String>, collection: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            phase: CollectionPhase::NotStarted,
            mode,
            marker: None,
            target_revision: None,
            records_applied: 0,
            updated_at: Utc::now(),
        }
    }

    /// A full transfer that was cut short while converging to `revision`
    /// can continue after its marker.
    pub fn resumable_at(&self, revision: Option<Revision>) -> bool {
        self.phase != CollectionPhase::Done
            && self.mode == SyncMode::Full
            && self.target_revision.is_some()
            && self.target_revision == revision
    }
}

/// Summary row of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: serde_json::Value,
}

/// Checkpoint store backed by SQLite
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Create or open `checkpoints.db` inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("checkpoints.db"))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                database TEXT NOT NULL,
                collection TEXT NOT NULL,
                phase TEXT NOT NULL,
                mode TEXT NOT NULL,
                marker_key TEXT,
                marker_revision INTEGER,
                target_revision INTEGER,
                records_applied INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (database, collection)
            );

            CREATE TABLE IF NOT EXISTS sync_runs (
                run_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                summary TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sync_runs_started
                ON sync_runs(started_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the checkpoint of a collection
    pub async fn load(&self, database: &str, collection: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("{} WHERE database = ?1 AND collection = ?2", SELECT_CHECKPOINT),
                params![database, collection],
                raw_checkpoint,
            )
            .optional()?;
        row.map(RawCheckpoint::into_checkpoint).transpose()
    }

    /// Insert or replace a checkpoint
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn.lock().await;
        let (marker_key, marker_revision) = match &checkpoint.marker {
            Some(m) => (Some(m.key.as_str()), Some(m.revision as i64)),
            None => (None, None),
        };
        conn.execute(
            r#"
            INSERT INTO checkpoints (
                database, collection, phase, mode, marker_key, marker_revision,
                target_revision, records_applied, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(database, collection) DO UPDATE SET
                phase = ?3,
                mode = ?4,
                marker_key = ?5,
                marker_revision = ?6,
                target_revision = ?7,
                records_applied = ?8,
                updated_at = ?9
            "#,
            params![
                checkpoint.database,
                checkpoint.collection,
                checkpoint.phase.to_string(),
                checkpoint.mode.to_string(),
                marker_key,
                marker_revision,
                checkpoint.target_revision.map(|r| r as i64),
                checkpoint.records_applied as i64,
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// All checkpoints, optionally restricted to one database
    pub async fn list(&self, database: Option<&str>) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "{} WHERE (?1 IS NULL OR database = ?1) ORDER BY database, collection",
            SELECT_CHECKPOINT
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![database], raw_checkpoint)?;

        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?.into_checkpoint()?);
        }
        Ok(checkpoints)
    }

    /// Forget a collection's progress
    pub async fn remove(&self, database: &str, collection: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM checkpoints WHERE database = ?1 AND collection = ?2",
            params![database, collection],
        )?;
        Ok(())
    }

    /// Forget every checkpoint of a database
    pub async fn remove_database(&self, database: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM checkpoints WHERE database = ?1",
            params![database],
        )?;
        Ok(deleted as u64)
    }

    /// Forget every checkpoint
    pub async fn clear(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM checkpoints", [])?;
        Ok(deleted as u64)
    }

    /// Leader revisions each completed collection of `database` was synced to
    pub async fn done_revisions(&self, database: &str) -> Result<HashMap<String, Revision>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT collection, target_revision FROM checkpoints
            WHERE database = ?1 AND phase = 'done' AND target_revision IS NOT NULL
            "#,
        )?;
        let rows = stmt.query_map(params![database], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as Revision))
        })?;

        let mut revisions = HashMap::new();
        for row in rows {
            let (collection, revision) = row?;
            revisions.insert(collection, revision);
        }
        Ok(revisions)
    }

    /// Persist the summary of a run
    pub async fn record_run<T: Serialize>(
        &self,
        run_id: Uuid,
        status: &str,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
        summary: &T,
    ) -> Result<()> {
        let summary = serde_json::to_string(summary)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO sync_runs (run_id, status, started_at, finished_at, summary)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                run_id.to_string(),
                status,
                started_at.to_rfc3339(),
                finished_at.map(|t| t.to_rfc3339()),
                summary,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs, newest first
    pub async fn runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, status, started_at, finished_at, summary FROM sync_runs
            ORDER BY started_at DESC LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, status, started_at, finished_at, summary) = row?;
            runs.push(RunRecord {
                run_id: Uuid::parse_str(&run_id)
                    .map_err(|e| Error::State(format!("bad run id {}: {}", run_id, e)))?,
                status,
                started_at: parse_time(&started_at)?,
                finished_at: finished_at.as_deref().map(parse_time).transpose()?,
                summary: serde_json::from_str(&summary)?,
            });
        }
        Ok(runs)
    }
}

const SELECT_CHECKPOINT: &str = r#"
    SELECT database, collection, phase, mode, marker_key, marker_revision,
           target_revision, records_applied, updated_at
    FROM checkpoints"#;

struct RawCheckpoint {
    database: String,
    collection: String,
    phase: String,
    mode: String,
    marker_key: Option<String>,
    marker_revision: Option<i64>,
    target_revision: Option<i64>,
    records_applied: i64,
    updated_at: String,
}

fn raw_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        database: row.get(0)?,
        collection: row.get(1)?,
        phase: row.get(2)?,
        mode: row.get(3)?,
        marker_key: row.get(4)?,
        marker_revision: row.get(5)?,
        target_revision: row.get(6)?,
        records_applied: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl RawCheckpoint {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let marker = match (self.marker_key, self.marker_revision) {
            (Some(key), Some(revision)) => Some(ChunkMarker {
                key,
                revision: revision as Revision,
            }),
            _ => None,
        };
        Ok(Checkpoint {
            database: self.database,
            collection: self.collection,
            phase: self.phase.parse()?,
            mode: self.mode.parse()?,
            marker,
            target_revision: self.target_revision.map(|r| r as Revision),
            records_applied: self.records_applied as u64,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::State(format!("bad timestamp {}: {}", s, e)))
}
