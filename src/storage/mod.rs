//! Storage Module
//!
//! The local document-store write path, seen by the syncer as a set of
//! blocking calls with their own internal atomicity.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::inventory::{CollectionDescriptor, Document, IndexDescriptor, KeyRange, KeyRevision};

/// Shared handle to a storage engine
pub type SharedStorage = Arc<dyn LocalStorage>;

/// Local storage apply interface.
///
/// All calls block. `apply_records` upserts by record key, so applying the
/// same batch twice leaves the same content as applying it once.
pub trait LocalStorage: Send + Sync {
    fn list_databases(&self) -> Result<Vec<String>>;

    fn create_database(&self, name: &str) -> Result<()>;

    fn drop_database(&self, name: &str) -> Result<()>;

    /// Collections of a database, with the engine's own revision marker
    fn list_collections(&self, database: &str) -> Result<Vec<CollectionDescriptor>>;

    /// Create a collection and its non-system indexes, with zero records
    fn create_collection(&self, database: &str, descriptor: &CollectionDescriptor) -> Result<()>;

    fn drop_collection(&self, database: &str, name: &str) -> Result<()>;

    /// Remove every record, keeping the collection and its indexes
    fn truncate_collection(&self, database: &str, name: &str) -> Result<()>;

    fn create_index(&self, database: &str, collection: &str, index: &IndexDescriptor) -> Result<()>;

    fn drop_index(&self, database: &str, collection: &str, name: &str) -> Result<()>;

    /// Insert or overwrite records keyed by their own identity
    fn apply_records(&self, database: &str, collection: &str, records: &[Document]) -> Result<()>;

    fn delete_keys(&self, database: &str, collection: &str, keys: &[String]) -> Result<()>;

    /// Sorted `(key, revision)` pairs inside `range`
    fn key_revisions(&self, database: &str, collection: &str, range: &KeyRange) -> Result<Vec<KeyRevision>>;

    /// Up to `limit` records with keys strictly greater than `after`, sorted by key
    fn read_after(
        &self,
        database: &str,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// Records for the given keys; missing keys are skipped
    fn read_documents(&self, database: &str, collection: &str, keys: &[String]) -> Result<Vec<Document>>;
}

/// Run a blocking storage call off the async runtime
pub async fn run_blocking<T, F>(storage: &SharedStorage, f: F) -> Result<T>
where
    F: FnOnce(&dyn LocalStorage) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let storage = Arc::clone(storage);
    tokio::task::spawn_blocking(move || f(storage.as_ref()))
        .await
        .map_err(|e| Error::Internal(format!("storage task failed: {}", e)))?
}
