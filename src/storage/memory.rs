//! In-memory storage engine

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::LocalStorage;
use crate::error::{Error, Result};
use crate::inventory::{
    CollectionDescriptor, Document, IndexDescriptor, KeyRange, KeyRevision, Revision,
};

type Databases = BTreeMap<String, BTreeMap<String, MemCollection>>;

struct MemCollection {
    descriptor: CollectionDescriptor,
    documents: BTreeMap<String, Document>,
    revision: Revision,
}

/// Storage engine keeping everything in ordered maps
pub struct MemoryStore {
    databases: RwLock<Databases>,
    /// Source of collection revision markers
    clock: AtomicU64,
    /// Number of `apply_records` calls served
    apply_calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(BTreeMap::new()),
            clock: AtomicU64::new(0),
            apply_calls: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> Revision {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Databases>> {
        self.databases
            .read()
            .map_err(|_| Error::StorageCorrupted("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Databases>> {
        self.databases
            .write()
            .map_err(|_| Error::StorageCorrupted("memory store lock poisoned".into()))
    }

    /// Write a record with a freshly assigned revision, returning the revision
    pub fn insert(&self, database: &str, collection: &str, key: &str, body: &[u8]) -> Result<Revision> {
        let revision = self.tick();
        let mut dbs = self.write()?;
        let coll = collection_mut(&mut dbs, database, collection)?;
        coll.documents
            .insert(key.to_string(), Document::new(key, revision, body.to_vec()));
        coll.revision = revision;
        Ok(revision)
    }

    /// Delete a single record, bumping the collection revision
    pub fn remove(&self, database: &str, collection: &str, key: &str) -> Result<bool> {
        let revision = self.tick();
        let mut dbs = self.write()?;
        let coll = collection_mut(&mut dbs, database, collection)?;
        let removed = coll.documents.remove(key).is_some();
        coll.revision = revision;
        Ok(removed)
    }

    pub fn get(&self, database: &str, collection: &str, key: &str) -> Result<Option<Document>> {
        let dbs = self.read()?;
        Ok(collection_ref(&dbs, database, collection)?.documents.get(key).cloned())
    }

    pub fn count(&self, database: &str, collection: &str) -> Result<usize> {
        let dbs = self.read()?;
        Ok(collection_ref(&dbs, database, collection)?.documents.len())
    }

    /// Every record of a collection, ordered by key
    pub fn documents(&self, database: &str, collection: &str) -> Result<Vec<Document>> {
        let dbs = self.read()?;
        Ok(collection_ref(&dbs, database, collection)?
            .documents
            .values()
            .cloned()
            .collect())
    }

    pub fn apply_calls(&self) -> u64 {
        self.apply_calls.load(Ordering::SeqCst)
    }
}

fn collection_ref<'a>(dbs: &'a Databases, database: &str, collection: &str) -> Result<&'a MemCollection> {
    dbs.get(database)
        .ok_or_else(|| Error::NotFound(format!("database {}", database)))?
        .get(collection)
        .ok_or_else(|| Error::NotFound(format!("collection {}/{}", database, collection)))
}

fn collection_mut<'a>(
    dbs: &'a mut Databases,
    database: &str,
    collection: &str,
) -> Result<&'a mut MemCollection> {
    dbs.get_mut(database)
        .ok_or_else(|| Error::NotFound(format!("database {}", database)))?
        .get_mut(collection)
        .ok_or_else(|| Error::NotFound(format!("collection {}/{}", database, collection)))
}

impl LocalStorage for MemoryStore {
    fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    fn create_database(&self, name: &str) -> Result<()> {
        self.write()?.entry(name.to_string()).or_default();
        Ok(())
    }

    fn drop_database(&self, name: &str) -> Result<()> {
        self.write()?.remove(name);
        Ok(())
    }

    fn list_collections(&self, database: &str) -> Result<Vec<CollectionDescriptor>> {
        let dbs = self.read()?;
        let colls = dbs
            .get(database)
            .ok_or_else(|| Error::NotFound(format!("database {}", database)))?;
        Ok(colls
            .values()
            .map(|c| {
                let mut descriptor = c.descriptor.clone();
                descriptor.revision = Some(c.revision);
                descriptor
            })
            .collect())
    }

    fn create_collection(&self, database: &str, descriptor: &CollectionDescriptor) -> Result<()> {
        let revision = self.tick();
        let mut dbs = self.write()?;
        let colls = dbs.entry(database.to_string()).or_default();
        if colls.contains_key(&descriptor.name) {
            return Err(Error::Storage(format!(
                "collection {}/{} already exists",
                database, descriptor.name
            )));
        }
        let mut descriptor = descriptor.clone();
        descriptor.revision = None;
        colls.insert(
            descriptor.name.clone(),
            MemCollection {
                descriptor,
                documents: BTreeMap::new(),
                revision,
            },
        );
        Ok(())
    }

    fn drop_collection(&self, database: &str, name: &str) -> Result<()> {
        let mut dbs = self.write()?;
        if let Some(colls) = dbs.get_mut(database) {
            colls.remove(name);
        }
        Ok(())
    }

    fn truncate_collection(&self, database: &str, name: &str) -> Result<()> {
        let revision = self.tick();
        let mut dbs = self.write()?;
        let coll = collection_mut(&mut dbs, database, name)?;
        coll.documents.clear();
        coll.revision = revision;
        Ok(())
    }

    fn create_index(&self, database: &str, collection: &str, index: &IndexDescriptor) -> Result<()> {
        let mut dbs = self.write()?;
        let coll = collection_mut(&mut dbs, database, collection)?;
        if coll.descriptor.index(&index.name).is_some() {
            return Err(Error::IndexCreation {
                collection: collection.to_string(),
                index: index.name.clone(),
                reason: "an index with this name already exists".into(),
            });
        }
        coll.descriptor.indexes.push(index.clone());
        Ok(())
    }

    fn drop_index(&self, database: &str, collection: &str, name: &str) -> Result<()> {
        let mut dbs = self.write()?;
        let coll = collection_mut(&mut dbs, database, collection)?;
        coll.descriptor.indexes.retain(|i| i.name != name);
        Ok(())
    }

    fn apply_records(&self, database: &str, collection: &str, records: &[Document]) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let revision = self.tick();
        let mut dbs = self.write()?;
        let coll = collection_mut(&mut dbs, database, collection)?;
        for record in records {
            coll.documents.insert(record.key.clone(), record.clone());
        }
        coll.revision = revision;
        Ok(())
    }

    fn delete_keys(&self, database: &str, collection: &str, keys: &[String]) -> Result<()> {
        let revision = self.tick();
        let mut dbs = self.write()?;
        let coll = collection_mut(&mut dbs, database, collection)?;
        for key in keys {
            coll.documents.remove(key);
        }
        coll.revision = revision;
        Ok(())
    }

    fn key_revisions(&self, database: &str, collection: &str, range: &KeyRange) -> Result<Vec<KeyRevision>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let dbs = self.read()?;
        let coll = collection_ref(&dbs, database, collection)?;
        Ok(coll
            .documents
            .range::<str, _>(range.bounds())
            .map(|(_, doc)| doc.key_revision())
            .collect())
    }

    fn read_after(
        &self,
        database: &str,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        use std::ops::Bound;

        let dbs = self.read()?;
        let coll = collection_ref(&dbs, database, collection)?;
        let start = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(coll
            .documents
            .range::<str, _>((start, Bound::Unbounded))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn read_documents(&self, database: &str, collection: &str, keys: &[String]) -> Result<Vec<Document>> {
        let dbs = self.read()?;
        let coll = collection_ref(&dbs, database, collection)?;
        Ok(keys
            .iter()
            .filter_map(|k| coll.documents.get(k).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_items() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_database("shop").unwrap();
        store
            .create_collection("shop", &CollectionDescriptor::new("items", "c1"))
            .unwrap();
        store
    }

    #[test]
    fn test_apply_is_idempotent() {
        let store = store_with_items();
        let chunk = vec![
            Document::new("a", 3, b"{\"n\":1}".to_vec()),
            Document::new("b", 4, b"{\"n\":2}".to_vec()),
        ];

        store.apply_records("shop", "items", &chunk).unwrap();
        let once = store.documents("shop", "items").unwrap();

        store.apply_records("shop", "items", &chunk).unwrap();
        let twice = store.documents("shop", "items").unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
        assert_eq!(store.apply_calls(), 2);
    }

    #[test]
    fn test_key_revisions_range() {
        let store = store_with_items();
        for key in ["a", "b", "c", "d"] {
            store.insert("shop", "items", key, b"{}").unwrap();
        }

        let range = KeyRange::new(Some("b".into()), Some("d".into()));
        let keys: Vec<String> = store
            .key_revisions("shop", "items", &range)
            .unwrap()
            .into_iter()
            .map(|kr| kr.key)
            .collect();
        assert_eq!(keys, vec!["b", "c"]);

        let inverted = KeyRange::new(Some("d".into()), Some("b".into()));
        assert!(store.key_revisions("shop", "items", &inverted).unwrap().is_empty());
    }

    #[test]
    fn test_read_after() {
        let store = store_with_items();
        for key in ["a", "b", "c"] {
            store.insert("shop", "items", key, b"{}").unwrap();
        }

        let first = store.read_after("shop", "items", None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = store.read_after("shop", "items", Some("b"), 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key, "c");
    }

    #[test]
    fn test_revision_advances_on_write() {
        let store = store_with_items();
        let before = store.list_collections("shop").unwrap()[0].revision;
        store.insert("shop", "items", "a", b"{}").unwrap();
        let after = store.list_collections("shop").unwrap()[0].revision;
        assert!(after > before);
    }

    #[test]
    fn test_missing_collection() {
        let store = store_with_items();
        let err = store.apply_records("shop", "ghost", &[]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
