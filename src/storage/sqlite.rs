//! SQLite storage engine
//!
//! Keeps every database of a node in one SQLite file. Index descriptors are
//! stored as metadata alongside the collection.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::LocalStorage;
use crate::error::{Error, Result};
use crate::inventory::{
    CollectionDescriptor, CollectionType, Document, IndexDescriptor, KeyRange, KeyRevision,
    Revision,
};

/// Storage engine backed by a single SQLite database file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the document store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Open a throwaway store that lives in memory
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS databases (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS collections (
                database TEXT NOT NULL,
                name TEXT NOT NULL,
                id TEXT NOT NULL,
                collection_type TEXT NOT NULL,
                indexes TEXT NOT NULL,
                revision INTEGER NOT NULL,
                PRIMARY KEY (database, name)
            );

            CREATE TABLE IF NOT EXISTS documents (
                database TEXT NOT NULL,
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                revision INTEGER NOT NULL,
                body BLOB NOT NULL,
                PRIMARY KEY (database, collection, key)
            );

            CREATE TABLE IF NOT EXISTS clock (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO clock (id, value) VALUES (0, 0);
            "#,
        )
        .map_err(storage_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageCorrupted("sqlite store lock poisoned".into()))
    }

    /// Write a record with a freshly assigned revision (leader-side writes)
    pub fn insert(&self, database: &str, collection: &str, key: &str, body: &[u8]) -> Result<Revision> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        ensure_collection(&tx, database, collection)?;
        let revision = tick(&tx)?;
        tx.execute(
            r#"
            INSERT INTO documents (database, collection, key, revision, body)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(database, collection, key) DO UPDATE SET revision = ?4, body = ?5
            "#,
            params![database, collection, key, revision as i64, body],
        )
        .map_err(storage_err)?;
        bump_collection(&tx, database, collection, revision)?;
        tx.commit().map_err(storage_err)?;
        Ok(revision)
    }

    /// Number of records in a collection
    pub fn count(&self, database: &str, collection: &str) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE database = ?1 AND collection = ?2",
                params![database, collection],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as u64)
    }
}

fn storage_err(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseCorrupt) | Some(rusqlite::ErrorCode::NotADatabase) => {
            Error::StorageCorrupted(e.to_string())
        }
        _ => Error::Storage(e.to_string()),
    }
}

fn tick(conn: &Connection) -> Result<Revision> {
    conn.execute("UPDATE clock SET value = value + 1 WHERE id = 0", [])
        .map_err(storage_err)?;
    let value: i64 = conn
        .query_row("SELECT value FROM clock WHERE id = 0", [], |row| row.get(0))
        .map_err(storage_err)?;
    Ok(value as Revision)
}

fn ensure_collection(conn: &Connection, database: &str, collection: &str) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM collections WHERE database = ?1 AND name = ?2",
            params![database, collection],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    match exists {
        Some(_) => Ok(()),
        None => Err(Error::NotFound(format!("collection {}/{}", database, collection))),
    }
}

fn bump_collection(conn: &Connection, database: &str, collection: &str, revision: Revision) -> Result<()> {
    conn.execute(
        "UPDATE collections SET revision = ?3 WHERE database = ?1 AND name = ?2",
        params![database, collection, revision as i64],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn load_indexes(conn: &Connection, database: &str, collection: &str) -> Result<Vec<IndexDescriptor>> {
    let raw: String = conn
        .query_row(
            "SELECT indexes FROM collections WHERE database = ?1 AND name = ?2",
            params![database, collection],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?
        .ok_or_else(|| Error::NotFound(format!("collection {}/{}", database, collection)))?;
    Ok(serde_json::from_str(&raw)?)
}

fn store_indexes(conn: &Connection, database: &str, collection: &str, indexes: &[IndexDescriptor]) -> Result<()> {
    conn.execute(
        "UPDATE collections SET indexes = ?3 WHERE database = ?1 AND name = ?2",
        params![database, collection, serde_json::to_string(indexes)?],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        key: row.get(0)?,
        revision: row.get::<_, i64>(1)? as Revision,
        body: row.get(2)?,
    })
}

impl LocalStorage for SqliteStore {
    fn list_databases(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT name FROM databases ORDER BY name")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn create_database(&self, name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("INSERT OR IGNORE INTO databases (name) VALUES (?1)", params![name])
            .map_err(storage_err)?;
        Ok(())
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute("DELETE FROM documents WHERE database = ?1", params![name])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM collections WHERE database = ?1", params![name])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM databases WHERE name = ?1", params![name])
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)
    }

    fn list_collections(&self, database: &str) -> Result<Vec<CollectionDescriptor>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT name, id, collection_type, indexes, revision
                FROM collections WHERE database = ?1 ORDER BY name
                "#,
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![database], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(storage_err)?;

        let mut collections = Vec::new();
        for row in rows {
            let (name, id, collection_type, indexes, revision) = row.map_err(storage_err)?;
            collections.push(CollectionDescriptor {
                name,
                id,
                collection_type: collection_type.parse::<CollectionType>()?,
                indexes: serde_json::from_str(&indexes)?,
                revision: Some(revision as Revision),
            });
        }
        Ok(collections)
    }

    fn create_collection(&self, database: &str, descriptor: &CollectionDescriptor) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        let revision = tick(&tx)?;
        tx.execute("INSERT OR IGNORE INTO databases (name) VALUES (?1)", params![database])
            .map_err(storage_err)?;
        tx.execute(
            r#"
            INSERT INTO collections (database, name, id, collection_type, indexes, revision)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                database,
                descriptor.name,
                descriptor.id,
                descriptor.collection_type.to_string(),
                serde_json::to_string(&descriptor.indexes)?,
                revision as i64,
            ],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)
    }

    fn drop_collection(&self, database: &str, name: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        tx.execute(
            "DELETE FROM documents WHERE database = ?1 AND collection = ?2",
            params![database, name],
        )
        .map_err(storage_err)?;
        tx.execute(
            "DELETE FROM collections WHERE database = ?1 AND name = ?2",
            params![database, name],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)
    }

    fn truncate_collection(&self, database: &str, name: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        ensure_collection(&tx, database, name)?;
        tx.execute(
            "DELETE FROM documents WHERE database = ?1 AND collection = ?2",
            params![database, name],
        )
        .map_err(storage_err)?;
        let revision = tick(&tx)?;
        bump_collection(&tx, database, name, revision)?;
        tx.commit().map_err(storage_err)
    }

    fn create_index(&self, database: &str, collection: &str, index: &IndexDescriptor) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        let mut indexes = load_indexes(&tx, database, collection)?;
        if indexes.iter().any(|i| i.name == index.name) {
            return Err(Error::IndexCreation {
                collection: collection.to_string(),
                index: index.name.clone(),
                reason: "an index with this name already exists".into(),
            });
        }
        indexes.push(index.clone());
        store_indexes(&tx, database, collection, &indexes)?;
        tx.commit().map_err(storage_err)
    }

    fn drop_index(&self, database: &str, collection: &str, name: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        let mut indexes = load_indexes(&tx, database, collection)?;
        indexes.retain(|i| i.name != name);
        store_indexes(&tx, database, collection, &indexes)?;
        tx.commit().map_err(storage_err)
    }

    fn apply_records(&self, database: &str, collection: &str, records: &[Document]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        ensure_collection(&tx, database, collection)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    r#"
                    INSERT INTO documents (database, collection, key, revision, body)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(database, collection, key) DO UPDATE SET revision = ?4, body = ?5
                    "#,
                )
                .map_err(storage_err)?;
            for record in records {
                stmt.execute(params![
                    database,
                    collection,
                    record.key,
                    record.revision as i64,
                    record.body
                ])
                .map_err(storage_err)?;
            }
        }
        let revision = tick(&tx)?;
        bump_collection(&tx, database, collection, revision)?;
        tx.commit().map_err(storage_err)
    }

    fn delete_keys(&self, database: &str, collection: &str, keys: &[String]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "DELETE FROM documents WHERE database = ?1 AND collection = ?2 AND key = ?3",
                )
                .map_err(storage_err)?;
            for key in keys {
                stmt.execute(params![database, collection, key])
                    .map_err(storage_err)?;
            }
        }
        let revision = tick(&tx)?;
        bump_collection(&tx, database, collection, revision)?;
        tx.commit().map_err(storage_err)
    }

    fn key_revisions(&self, database: &str, collection: &str, range: &KeyRange) -> Result<Vec<KeyRevision>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        ensure_collection(&conn, database, collection)?;

        let mut sql = String::from(
            "SELECT key, revision FROM documents WHERE database = ? AND collection = ?",
        );
        let mut values: Vec<&str> = vec![database, collection];
        if let Some(start) = &range.start {
            sql.push_str(" AND key >= ?");
            values.push(start);
        }
        if let Some(end) = &range.end {
            sql.push_str(" AND key < ?");
            values.push(end);
        }
        sql.push_str(" ORDER BY key");

        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(KeyRevision {
                    key: row.get(0)?,
                    revision: row.get::<_, i64>(1)? as Revision,
                })
            })
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn read_after(
        &self,
        database: &str,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        ensure_collection(&conn, database, collection)?;
        let mut stmt = conn
            .prepare_cached(
                r#"
                SELECT key, revision, body FROM documents
                WHERE database = ?1 AND collection = ?2 AND (?3 IS NULL OR key > ?3)
                ORDER BY key LIMIT ?4
                "#,
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![database, collection, after, limit as i64], row_to_document)
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
    }

    fn read_documents(&self, database: &str, collection: &str, keys: &[String]) -> Result<Vec<Document>> {
        let conn = self.lock()?;
        ensure_collection(&conn, database, collection)?;
        let mut stmt = conn
            .prepare_cached(
                r#"
                SELECT key, revision, body FROM documents
                WHERE database = ?1 AND collection = ?2 AND key = ?3
                "#,
            )
            .map_err(storage_err)?;

        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(doc) = stmt
                .query_row(params![database, collection, key], row_to_document)
                .optional()
                .map_err(storage_err)?
            {
                documents.push(doc);
            }
        }
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::IndexKind;
    use tempfile::tempdir;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        let descriptor = CollectionDescriptor::new("items", "c1")
            .with_index(IndexDescriptor::new("by_sku", IndexKind::Persistent, &["sku"]));
        store.create_collection("shop", &descriptor).unwrap();
        store
    }

    #[test]
    fn test_collection_roundtrip() {
        let store = store();
        assert_eq!(store.list_databases().unwrap(), vec!["shop".to_string()]);

        let colls = store.list_collections("shop").unwrap();
        assert_eq!(colls.len(), 1);
        assert_eq!(colls[0].name, "items");
        assert_eq!(colls[0].indexes[0].name, "by_sku");
        assert!(colls[0].revision.is_some());

        let dup = store.create_collection("shop", &CollectionDescriptor::new("items", "c2"));
        assert!(matches!(dup, Err(Error::Storage(_))));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let store = store();
        let chunk = vec![Document::new("a", 10, b"one".to_vec()), Document::new("b", 11, b"two".to_vec())];

        store.apply_records("shop", "items", &chunk).unwrap();
        store.apply_records("shop", "items", &chunk).unwrap();

        assert_eq!(store.count("shop", "items").unwrap(), 2);
        let docs = store.read_after("shop", "items", None, 10).unwrap();
        assert_eq!(docs, chunk);
    }

    #[test]
    fn test_ranges_and_deletes() {
        let store = store();
        for key in ["a", "b", "c", "d"] {
            store.insert("shop", "items", key, b"{}").unwrap();
        }

        let range = KeyRange::new(Some("b".into()), None);
        let keys: Vec<String> = store
            .key_revisions("shop", "items", &range)
            .unwrap()
            .into_iter()
            .map(|k| k.key)
            .collect();
        assert_eq!(keys, vec!["b", "c", "d"]);

        store
            .delete_keys("shop", "items", &["b".to_string(), "zz".to_string()])
            .unwrap();
        assert_eq!(store.count("shop", "items").unwrap(), 3);

        let after = store.read_after("shop", "items", Some("a"), 1).unwrap();
        assert_eq!(after[0].key, "c");

        let docs = store
            .read_documents("shop", "items", &["d".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_indexes_and_truncate() {
        let store = store();
        store.insert("shop", "items", "a", b"{}").unwrap();

        let idx = IndexDescriptor::new("by_name", IndexKind::Hash, &["name"]);
        store.create_index("shop", "items", &idx).unwrap();
        assert!(matches!(
            store.create_index("shop", "items", &idx),
            Err(Error::IndexCreation { .. })
        ));
        store.drop_index("shop", "items", "by_sku").unwrap();
        let colls = store.list_collections("shop").unwrap();
        assert_eq!(colls[0].indexes, vec![idx]);

        store.truncate_collection("shop", "items").unwrap();
        assert_eq!(store.count("shop", "items").unwrap(), 0);
    }

    #[test]
    fn test_persists_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docs").join("documents.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .create_collection("shop", &CollectionDescriptor::new("items", "c1"))
                .unwrap();
            store.insert("shop", "items", "a", b"{}").unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count("shop", "items").unwrap(), 1);
    }
}
