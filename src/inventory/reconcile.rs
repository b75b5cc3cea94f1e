//! Inventory Reconciliation
//!
//! Diffs the local and remote schema of one database and produces the
//! plan of collection creates, drops and data transfers. Pure computation.

use std::collections::{BTreeSet, HashMap};
use serde::{Deserialize, Serialize};

use super::{CollectionDescriptor, DatabaseInventory, IndexDescriptor};

/// Which destructive schema actions the follower may take
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropPolicy {
    /// Drop local collections and indexes that the leader does not have
    #[serde(default)]
    pub drop_extraneous: bool,
    /// Drop local databases that the leader does not have
    #[serde(default)]
    pub drop_extraneous_databases: bool,
    /// Drop and recreate collections whose type differs from the leader's
    #[serde(default)]
    pub allow_recreate: bool,
}

/// How a collection's data is transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Truncate and dump every record
    Full,
    /// Compare range checksums and transfer only differing ranges
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(crate::Error::State(format!("unknown sync mode: {}", other))),
        }
    }
}

/// Index changes needed on a collection present on both sides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDiff {
    pub to_create: Vec<IndexDescriptor>,
    pub to_drop: Vec<String>,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_drop.is_empty()
    }
}

/// Materialize a collection (schema only) before its data is transferred
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAction {
    pub descriptor: CollectionDescriptor,
    /// A local collection of the same name must be dropped first
    pub replace_existing: bool,
}

/// Bring an existing collection up to date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAction {
    /// Remote descriptor
    pub descriptor: CollectionDescriptor,
    /// `None` when only the indexes need work
    pub transfer: Option<SyncMode>,
    pub indexes: IndexDiff,
}

/// Collection that cannot be aligned under the current policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConflict {
    pub collection: String,
    pub reason: String,
}

/// Schema actions for one database.
///
/// Every collection name appears in exactly one of `to_create`, `to_drop`,
/// `to_sync` and `untouched`. Conflicted collections are also untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    pub database: String,
    pub to_create: Vec<CreateAction>,
    pub to_drop: Vec<String>,
    pub to_sync: Vec<SyncAction>,
    pub untouched: Vec<String>,
    pub conflicts: Vec<SchemaConflict>,
}

impl ReconciliationPlan {
    pub fn create_names(&self) -> BTreeSet<&str> {
        self.to_create.iter().map(|c| c.descriptor.name.as_str()).collect()
    }

    pub fn sync_names(&self) -> BTreeSet<&str> {
        self.to_sync.iter().map(|s| s.descriptor.name.as_str()).collect()
    }

    pub fn drop_names(&self) -> BTreeSet<&str> {
        self.to_drop.iter().map(|s| s.as_str()).collect()
    }

    pub fn untouched_names(&self) -> BTreeSet<&str> {
        self.untouched.iter().map(|s| s.as_str()).collect()
    }

    /// Collections that will receive a data transfer
    pub fn transfer_count(&self) -> usize {
        self.to_create.len() + self.to_sync.iter().filter(|s| s.transfer.is_some()).count()
    }

    /// True when nothing needs to change
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_drop.is_empty() && self.to_sync.is_empty()
    }
}

/// Diff local against remote schema.
///
/// With `incremental == false` every remote collection is transferred in
/// full. With `incremental == true` a collection whose locally recorded
/// revision equals the remote one is left untouched (unless its indexes
/// differ), all others are compared incrementally.
pub fn reconcile(
    local: &DatabaseInventory,
    remote: &DatabaseInventory,
    policy: &DropPolicy,
    incremental: bool,
) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan {
        database: remote.database.clone(),
        ..Default::default()
    };

    for (name, remote_coll) in &remote.collections {
        let Some(local_coll) = local.get(name) else {
            plan.to_create.push(CreateAction {
                descriptor: remote_coll.clone(),
                replace_existing: false,
            });
            continue;
        };

        if local_coll.collection_type != remote_coll.collection_type {
            if policy.allow_recreate {
                plan.to_create.push(CreateAction {
                    descriptor: remote_coll.clone(),
                    replace_existing: true,
                });
            } else {
                plan.conflicts.push(SchemaConflict {
                    collection: name.clone(),
                    reason: format!(
                        "collection type is {} locally but {} on the leader",
                        local_coll.collection_type, remote_coll.collection_type
                    ),
                });
                plan.untouched.push(name.clone());
            }
            continue;
        }

        let indexes = diff_indexes(local_coll, remote_coll, policy);
        let up_to_date = incremental
            && remote_coll.revision.is_some()
            && local_coll.revision == remote_coll.revision;

        let transfer = match (incremental, up_to_date) {
            (false, _) => Some(SyncMode::Full),
            (true, true) => None,
            (true, false) => Some(SyncMode::Incremental),
        };

        if transfer.is_none() && indexes.is_empty() {
            plan.untouched.push(name.clone());
        } else {
            plan.to_sync.push(SyncAction {
                descriptor: remote_coll.clone(),
                transfer,
                indexes,
            });
        }
    }

    for name in local.names() {
        if remote.contains(name) {
            continue;
        }
        if policy.drop_extraneous {
            plan.to_drop.push(name.to_string());
        } else {
            plan.untouched.push(name.to_string());
        }
    }

    plan
}

fn diff_indexes(
    local: &CollectionDescriptor,
    remote: &CollectionDescriptor,
    policy: &DropPolicy,
) -> IndexDiff {
    let local_indexes: HashMap<&str, &IndexDescriptor> = local
        .indexes
        .iter()
        .filter(|i| !i.kind.is_system())
        .map(|i| (i.name.as_str(), i))
        .collect();

    let mut diff = IndexDiff::default();

    for index in remote.indexes.iter().filter(|i| !i.kind.is_system()) {
        match local_indexes.get(index.name.as_str()) {
            None => diff.to_create.push(index.clone()),
            Some(existing) if existing.fingerprint() != index.fingerprint() => {
                // Same name, different definition: rebuild from the leader's
                diff.to_drop.push(index.name.clone());
                diff.to_create.push(index.clone());
            }
            Some(_) => {}
        }
    }

    if policy.drop_extraneous {
        for name in local_indexes.keys() {
            if remote.index(name).is_none() {
                diff.to_drop.push(name.to_string());
            }
        }
        diff.to_drop.sort();
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{CollectionType, IndexKind};

    fn coll(name: &str) -> CollectionDescriptor {
        CollectionDescriptor::new(name, format!("id-{}", name))
    }

    fn inventory(colls: Vec<CollectionDescriptor>) -> DatabaseInventory {
        DatabaseInventory::from_collections("shop", colls)
    }

    fn assert_partition(local: &DatabaseInventory, remote: &DatabaseInventory, plan: &ReconciliationPlan) {
        let create = plan.create_names();
        let sync = plan.sync_names();
        let drop = plan.drop_names();
        let untouched = plan.untouched_names();

        assert_eq!(create.len(), plan.to_create.len(), "duplicate in to_create");
        assert_eq!(sync.len(), plan.to_sync.len(), "duplicate in to_sync");
        assert_eq!(untouched.len(), plan.untouched.len(), "duplicate in untouched");

        assert!(create.is_disjoint(&sync));
        assert!(create.is_disjoint(&drop));
        assert!(create.is_disjoint(&untouched));
        assert!(sync.is_disjoint(&drop));
        assert!(sync.is_disjoint(&untouched));
        assert!(drop.is_disjoint(&untouched));

        let all: BTreeSet<&str> = local.names().chain(remote.names()).collect();
        let union: BTreeSet<&str> = create
            .iter()
            .chain(sync.iter())
            .chain(drop.iter())
            .chain(untouched.iter())
            .copied()
            .collect();
        assert_eq!(all, union);

        for conflict in &plan.conflicts {
            assert!(untouched.contains(conflict.collection.as_str()));
        }
    }

    #[test]
    fn test_create_sync_untouched_scenario() {
        let local = inventory(vec![coll("A"), coll("B")]);
        let remote = inventory(vec![coll("A"), coll("C")]);

        let plan = reconcile(&local, &remote, &DropPolicy::default(), false);

        assert_eq!(plan.create_names(), BTreeSet::from(["C"]));
        assert!(plan.to_drop.is_empty());
        assert_eq!(plan.sync_names(), BTreeSet::from(["A"]));
        assert_eq!(plan.untouched, vec!["B".to_string()]);
        assert_partition(&local, &remote, &plan);
    }

    #[test]
    fn test_drop_requires_policy() {
        let local = inventory(vec![coll("A"), coll("B")]);
        let remote = inventory(vec![coll("A")]);
        let policy = DropPolicy {
            drop_extraneous: true,
            ..Default::default()
        };

        let plan = reconcile(&local, &remote, &policy, true);
        assert_eq!(plan.to_drop, vec!["B".to_string()]);
        assert_partition(&local, &remote, &plan);
    }

    #[test]
    fn test_full_mode_syncs_everything() {
        let local = inventory(vec![coll("A").with_revision(7), coll("B").with_revision(3)]);
        let remote = inventory(vec![coll("A").with_revision(7), coll("B").with_revision(9)]);

        let plan = reconcile(&local, &remote, &DropPolicy::default(), false);
        assert_eq!(plan.to_sync.len(), 2);
        assert!(plan.to_sync.iter().all(|s| s.transfer == Some(SyncMode::Full)));
        assert!(plan.untouched.is_empty());
    }

    #[test]
    fn test_incremental_skips_matching_revisions() {
        let local = inventory(vec![coll("A").with_revision(7), coll("B").with_revision(3), coll("C")]);
        let remote = inventory(vec![
            coll("A").with_revision(7),
            coll("B").with_revision(9),
            coll("C").with_revision(1),
        ]);

        let plan = reconcile(&local, &remote, &DropPolicy::default(), true);
        assert_eq!(plan.untouched, vec!["A".to_string()]);
        assert_eq!(plan.sync_names(), BTreeSet::from(["B", "C"]));
        assert!(plan
            .to_sync
            .iter()
            .all(|s| s.transfer == Some(SyncMode::Incremental)));
        assert_partition(&local, &remote, &plan);
    }

    #[test]
    fn test_type_mismatch_recreates_with_consent() {
        let local = inventory(vec![coll("links")]);
        let remote = inventory(vec![coll("links").with_type(CollectionType::Edge)]);

        let forbidden = reconcile(&local, &remote, &DropPolicy::default(), true);
        assert!(forbidden.to_create.is_empty());
        assert!(forbidden.to_sync.is_empty());
        assert_eq!(forbidden.conflicts.len(), 1);
        assert_eq!(forbidden.conflicts[0].collection, "links");
        assert_partition(&local, &remote, &forbidden);

        let policy = DropPolicy {
            allow_recreate: true,
            ..Default::default()
        };
        let allowed = reconcile(&local, &remote, &policy, true);
        assert_eq!(allowed.to_create.len(), 1);
        assert!(allowed.to_create[0].replace_existing);
        assert_eq!(allowed.to_create[0].descriptor.collection_type, CollectionType::Edge);
        assert!(allowed.conflicts.is_empty());
        assert_partition(&local, &remote, &allowed);
    }

    #[test]
    fn test_index_diff() {
        let by_sku = IndexDescriptor::new("by_sku", IndexKind::Persistent, &["sku"]);
        let by_name = IndexDescriptor::new("by_name", IndexKind::Hash, &["name"]);
        let mut by_price_unique = IndexDescriptor::new("by_price", IndexKind::Persistent, &["price"]);
        let by_price = by_price_unique.clone();
        by_price_unique.unique = true;
        let legacy = IndexDescriptor::new("legacy", IndexKind::Hash, &["old"]);

        let local = inventory(vec![coll("items")
            .with_revision(5)
            .with_index(IndexDescriptor::new("primary", IndexKind::Primary, &["_key"]))
            .with_index(by_sku.clone())
            .with_index(by_price)
            .with_index(legacy)]);
        let remote = inventory(vec![coll("items")
            .with_revision(5)
            .with_index(by_sku)
            .with_index(by_name.clone())
            .with_index(by_price_unique.clone())]);

        let plan = reconcile(&local, &remote, &DropPolicy::default(), true);
        assert_eq!(plan.to_sync.len(), 1);
        let action = &plan.to_sync[0];
        assert_eq!(action.transfer, None);
        assert_eq!(action.indexes.to_create, vec![by_name.clone(), by_price_unique.clone()]);
        assert_eq!(action.indexes.to_drop, vec!["by_price".to_string()]);

        let policy = DropPolicy {
            drop_extraneous: true,
            ..Default::default()
        };
        let plan = reconcile(&local, &remote, &policy, true);
        assert_eq!(
            plan.to_sync[0].indexes.to_drop,
            vec!["by_price".to_string(), "legacy".to_string()]
        );
    }

    #[test]
    fn test_identical_indexes_not_rebuilt() {
        let idx = IndexDescriptor::new("by_sku", IndexKind::Persistent, &["sku"]);
        let local = inventory(vec![coll("items").with_revision(2).with_index(idx.clone())]);
        let remote = inventory(vec![coll("items").with_revision(2).with_index(idx)]);

        let plan = reconcile(&local, &remote, &DropPolicy::default(), true);
        assert!(plan.is_noop());
        assert_eq!(plan.untouched, vec!["items".to_string()]);
    }

    #[test]
    fn test_partition_holds_across_inputs() {
        let names = ["a", "b", "c", "d", "e"];
        let policies = [
            DropPolicy::default(),
            DropPolicy {
                drop_extraneous: true,
                allow_recreate: true,
                ..Default::default()
            },
        ];

        // Each name is absent, present, or present with another type/revision
        for mask in 0..(3u32.pow(names.len() as u32)) {
            let mut local = Vec::new();
            let mut remote = Vec::new();
            let mut m = mask;
            for (i, name) in names.iter().enumerate() {
                match m % 3 {
                    0 => local.push(coll(name).with_revision(i as u64)),
                    1 => remote.push(coll(name).with_revision(i as u64)),
                    _ => {
                        local.push(coll(name).with_revision(i as u64));
                        let remote_coll = if i % 2 == 0 {
                            coll(name).with_type(CollectionType::Edge)
                        } else {
                            coll(name).with_revision(i as u64 + 1)
                        };
                        remote.push(remote_coll);
                    }
                }
                m /= 3;
            }
            let local = inventory(local);
            let remote = inventory(remote);

            for policy in &policies {
                for incremental in [false, true] {
                    let plan = reconcile(&local, &remote, policy, incremental);
                    assert_partition(&local, &remote, &plan);
                }
            }
        }
    }
}
