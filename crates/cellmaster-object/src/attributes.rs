//! Attribute storage with transactional branching
//!
//! Attributes live in sets keyed by [`VersionedObjectId`]. The trunk set of
//! an object holds committed values; a transaction only gets a set of its
//! own (a delta) once it writes. Reading under a transaction walks the
//! transaction, its ancestors and finally the trunk; the first set that
//! mentions a key decides, and a tombstone (`None`) means "absent".

use cellmaster_common::{NULL_TRANSACTION_ID, ObjectId, TransactionId, VersionedObjectId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Attributes of one object version. `None` values are tombstones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSet {
    attributes: BTreeMap<String, Option<Vec<u8>>>,
}

impl AttributeSet {
    pub fn get(&self, key: &str) -> Option<&Option<Vec<u8>>> {
        self.attributes.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Option<Vec<u8>>) {
        self.attributes.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<Vec<u8>>> {
        self.attributes.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Vec<u8>>)> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl FromIterator<(String, Vec<u8>)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self {
            attributes: iter.into_iter().map(|(k, v)| (k, Some(v))).collect(),
        }
    }
}

/// Every attribute set of every object.
#[derive(Debug, Default)]
pub struct AttributeStore {
    sets: HashMap<ObjectId, BTreeMap<TransactionId, AttributeSet>>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.sets.clear();
    }

    pub fn find(&self, id: VersionedObjectId) -> Option<&AttributeSet> {
        self.sets.get(&id.object_id)?.get(&id.transaction_id)
    }

    /// The set of `id`, created empty on first write.
    pub fn find_or_create(&mut self, id: VersionedObjectId) -> &mut AttributeSet {
        self.sets
            .entry(id.object_id)
            .or_default()
            .entry(id.transaction_id)
            .or_default()
    }

    pub fn remove(&mut self, id: VersionedObjectId) -> Option<AttributeSet> {
        let versions = self.sets.get_mut(&id.object_id)?;
        let removed = versions.remove(&id.transaction_id);
        if versions.is_empty() {
            self.sets.remove(&id.object_id);
        }
        removed
    }

    /// Drop every version of an object.
    pub fn remove_object(&mut self, object_id: ObjectId) {
        self.sets.remove(&object_id);
    }

    /// Value of `key` as seen through `chain` (transaction first, trunk last).
    pub fn lookup(&self, object_id: ObjectId, chain: &[TransactionId], key: &str) -> Option<&[u8]> {
        let versions = self.sets.get(&object_id)?;
        chain
            .iter()
            .filter_map(|transaction_id| versions.get(transaction_id)?.get(key))
            .next()?
            .as_deref()
    }

    /// Every attribute visible through `chain`.
    pub fn list(&self, object_id: ObjectId, chain: &[TransactionId]) -> BTreeMap<String, Vec<u8>> {
        let mut visible = BTreeMap::new();
        let Some(versions) = self.sets.get(&object_id) else {
            return visible;
        };
        for transaction_id in chain.iter().rev() {
            let Some(set) = versions.get(transaction_id) else {
                continue;
            };
            for (key, value) in set.iter() {
                match value {
                    Some(value) => {
                        visible.insert(key.clone(), value.clone());
                    }
                    None => {
                        visible.remove(key);
                    }
                }
            }
        }
        visible
    }

    /// Write `key` in the version `id`. Writing a tombstone into the trunk
    /// deletes the key instead.
    pub fn write(&mut self, id: VersionedObjectId, key: &str, value: Option<Vec<u8>>) {
        if id.is_branched() {
            self.find_or_create(id).set(key, value);
            return;
        }
        match value {
            Some(value) => self.find_or_create(id).set(key, Some(value)),
            None => {
                if let Some(trunk) = self.sets.get_mut(&id.object_id).and_then(|v| v.get_mut(&NULL_TRANSACTION_ID)) {
                    trunk.remove(key);
                }
            }
        }
    }

    /// Fold the delta of `transaction_id` into its parent.
    ///
    /// `parent_chain` starts at the parent transaction (or is just the
    /// trunk). Merging into the trunk applies tombstones as deletions.
    /// Merging into a parent transaction keeps a tombstone only while some
    /// ancestor of the parent still has a value for the key; otherwise the
    /// key simply disappears from the parent's delta.
    pub fn merge(&mut self, object_id: ObjectId, transaction_id: TransactionId, parent_chain: &[TransactionId]) {
        let Some(delta) = self.remove(VersionedObjectId::branched(object_id, transaction_id)) else {
            return;
        };
        let Some((&parent, ancestors)) = parent_chain.split_first() else {
            panic!("merge of {object_id} in {transaction_id} without a parent chain");
        };
        let parent_id = VersionedObjectId::branched(object_id, parent);

        if parent.is_null() {
            for (key, value) in delta.attributes {
                self.write(parent_id, &key, value);
            }
            if self.find(parent_id).is_some_and(AttributeSet::is_empty) {
                self.remove(parent_id);
            }
            return;
        }

        let updates: Vec<(String, Option<Option<Vec<u8>>>)> = delta
            .attributes
            .into_iter()
            .map(|(key, value)| {
                let update = match value {
                    Some(value) => Some(Some(value)),
                    None if self.lookup(object_id, ancestors, &key).is_some() => Some(None),
                    None => None,
                };
                (key, update)
            })
            .collect();
        let target = self.find_or_create(parent_id);
        for (key, update) in updates {
            match update {
                Some(value) => target.set(key, value),
                None => {
                    target.remove(&key);
                }
            }
        }
        if target.is_empty() {
            self.remove(parent_id);
        }
    }

    /// Snapshot form, ordered by version id.
    pub fn entries(&self) -> Vec<(VersionedObjectId, AttributeSet)> {
        let mut entries: Vec<_> = self
            .sets
            .iter()
            .flat_map(|(object_id, versions)| {
                versions.iter().map(|(transaction_id, set)| {
                    (VersionedObjectId::branched(*object_id, *transaction_id), set.clone())
                })
            })
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn load(&mut self, entries: Vec<(VersionedObjectId, AttributeSet)>) {
        self.sets.clear();
        for (id, set) in entries {
            let previous = self
                .sets
                .entry(id.object_id)
                .or_default()
                .insert(id.transaction_id, set);
            assert!(previous.is_none(), "duplicate attribute set {id}");
        }
    }
}
