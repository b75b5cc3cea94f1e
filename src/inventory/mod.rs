//! Inventory Module
//!
//! Schema snapshots (databases, collections, indexes, revision markers)
//! and the record-level types moved between leader and follower.

pub mod reconcile;

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub use reconcile::{
    reconcile, CreateAction, DropPolicy, IndexDiff, ReconciliationPlan, SchemaConflict,
    SyncAction, SyncMode,
};

/// Revision marker - monotonically increasing position in a collection's history
pub type Revision = u64;

/// Wire protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Collection type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionType {
    /// Plain document collection
    Document,
    /// Edge collection (documents carrying `_from`/`_to`)
    Edge,
}

impl std::fmt::Display for CollectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectionType::Document => write!(f, "document"),
            CollectionType::Edge => write!(f, "edge"),
        }
    }
}

impl std::str::FromStr for CollectionType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "document" => Ok(CollectionType::Document),
            "edge" => Ok(CollectionType::Edge),
            other => Err(crate::Error::Protocol(format!("unknown collection type: {}", other))),
        }
    }
}

/// Index type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    Primary,
    Edge,
    Persistent,
    Hash,
    Fulltext,
    Ttl,
}

impl IndexKind {
    /// System indexes exist implicitly with their collection and are never diffed
    pub fn is_system(&self) -> bool {
        matches!(self, IndexKind::Primary | IndexKind::Edge)
    }
}

/// Index descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
    pub unique: bool,
    pub sparse: bool,
}

impl IndexDescriptor {
    /// Create a non-unique, non-sparse index over the given fields
    pub fn new(name: impl Into<String>, kind: IndexKind, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
            sparse: false,
        }
    }

    /// Canonical encoding used to decide whether two definitions are identical
    pub fn fingerprint(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }
}

/// Collection descriptor as seen on one side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    /// Unique id assigned by the leader
    pub id: String,
    pub collection_type: CollectionType,
    pub indexes: Vec<IndexDescriptor>,
    /// Data revision marker; `None` when unknown (never synced locally)
    pub revision: Option<Revision>,
}

impl CollectionDescriptor {
    /// Create a document collection descriptor without indexes
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            collection_type: CollectionType::Document,
            indexes: Vec::new(),
            revision: None,
        }
    }

    pub fn with_type(mut self, collection_type: CollectionType) -> Self {
        self.collection_type = collection_type;
        self
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Look up an index by name
    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// System collections start with an underscore
    pub fn is_system(&self) -> bool {
        self.name.starts_with('_')
    }
}

/// Snapshot of one database's schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInventory {
    pub database: String,
    /// Collections ordered by name
    pub collections: BTreeMap<String, CollectionDescriptor>,
}

impl DatabaseInventory {
    /// Create an empty inventory
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collections: BTreeMap::new(),
        }
    }

    /// Build an inventory from a list of descriptors
    pub fn from_collections(
        database: impl Into<String>,
        collections: impl IntoIterator<Item = CollectionDescriptor>,
    ) -> Self {
        Self {
            database: database.into(),
            collections: collections
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CollectionDescriptor> {
        self.collections.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// Leader identity returned by the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub server_id: String,
    pub protocol_version: u32,
}

/// A single record: identity, revision and opaque encoded body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub revision: Revision,
    pub body: Vec<u8>,
}

impl Document {
    pub fn new(key: impl Into<String>, revision: Revision, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            revision,
            body: body.into(),
        }
    }

    /// Approximate transfer size in bytes
    pub fn size(&self) -> usize {
        self.key.len() + self.body.len() + std::mem::size_of::<Revision>()
    }

    pub fn key_revision(&self) -> KeyRevision {
        KeyRevision {
            key: self.key.clone(),
            revision: self.revision,
        }
    }
}

/// Record identity used by range comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRevision {
    pub key: String,
    pub revision: Revision,
}

impl KeyRevision {
    pub fn new(key: impl Into<String>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            revision,
        }
    }
}

/// Half-open key range `[start, end)`; `None` is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl KeyRange {
    /// The whole key space
    pub fn full() -> Self {
        Self::default()
    }

    pub fn new(start: Option<String>, end: Option<String>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: &str) -> bool {
        let after_start = self.start.as_deref().map_or(true, |s| key >= s);
        let before_end = self.end.as_deref().map_or(true, |e| key < e);
        after_start && before_end
    }

    /// True when no key can fall inside the range
    pub fn is_empty(&self) -> bool {
        matches!((&self.start, &self.end), (Some(s), Some(e)) if s >= e)
    }

    /// Bounds suitable for `BTreeMap::range`
    pub fn bounds(&self) -> (Bound<&str>, Bound<&str>) {
        let start = match &self.start {
            Some(s) => Bound::Included(s.as_str()),
            None => Bound::Unbounded,
        };
        let end = match &self.end {
            Some(e) => Bound::Excluded(e.as_str()),
            None => Bound::Unbounded,
        };
        (start, end)
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.as_deref().unwrap_or("-inf"),
            self.end.as_deref().unwrap_or("+inf")
        )
    }
}

/// Resumption marker: the last record applied from a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMarker {
    pub key: String,
    pub revision: Revision,
}

impl std::fmt::Display for ChunkMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.key, self.revision)
    }
}

/// Bounded batch of records fetched from the leader for one collection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunk {
    /// Records ordered by key
    pub records: Vec<Document>,
    /// Marker of the last record, or the request marker for an empty chunk
    pub marker: Option<ChunkMarker>,
    /// Leader signals no records exist after this chunk
    pub end_of_collection: bool,
}

impl TransferChunk {
    pub fn size(&self) -> usize {
        self.records.iter().map(Document::size).sum()
    }
}

/// Checksum over one sub-range, as computed by the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSummary {
    pub range: KeyRange,
    pub count: u64,
    pub checksum: String,
}

/// SHA-1 over ordered `(key, revision)` pairs
pub fn range_checksum(entries: &[KeyRevision]) -> String {
    let mut hasher = Sha1::new();
    for entry in entries {
        hasher.update(entry.key.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.revision.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Partition `range` into at most `granularity` contiguous sub-ranges of
/// roughly equal record count. `entries` must be the sorted contents of
/// `range`. The returned ranges cover `range` completely, so keys that exist
/// only on the other side still fall into exactly one of them.
pub fn split_range(entries: &[KeyRevision], range: &KeyRange, granularity: usize) -> Vec<RangeSummary> {
    if entries.is_empty() {
        return vec![RangeSummary {
            range: range.clone(),
            count: 0,
            checksum: range_checksum(&[]),
        }];
    }

    let groups = granularity.max(1).min(entries.len());
    let per_group = entries.len().div_ceil(groups);
    let chunks: Vec<&[KeyRevision]> = entries.chunks(per_group).collect();
    let last = chunks.len() - 1;

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let start = if i == 0 {
                range.start.clone()
            } else {
                Some(chunk[0].key.clone())
            };
            let end = if i == last {
                range.end.clone()
            } else {
                Some(chunks[i + 1][0].key.clone())
            };
            RangeSummary {
                range: KeyRange::new(start, end),
                count: chunk.len() as u64,
                checksum: range_checksum(chunk),
            }
        })
        .collect()
}
