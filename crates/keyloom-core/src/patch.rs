//! Batched store mutations.
//!
//! A [`KeyPatch`] is the unit of write traffic: a set of `(key type, id) ->
//! value | delete` entries applied in one store call. Transactions accumulate
//! one patch per scope and commit it atomically.

use std::collections::HashMap;

use bytes::Bytes;

use crate::KeyType;

/// A batched set of writes and deletions, grouped by key type.
///
/// `Some(bytes)` inserts or replaces an entry; `None` deletes it. Within one
/// patch the last write to an id wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPatch {
    entries: HashMap<KeyType, HashMap<String, Option<Bytes>>>,
}

impl KeyPatch {
    /// Create an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a patch containing a single insert.
    pub fn insert_one(key_type: KeyType, id: impl Into<String>, value: Bytes) -> Self {
        let mut patch = Self::new();
        patch.insert(key_type, id, value);
        patch
    }

    /// Create a patch containing a single deletion.
    pub fn delete_one(key_type: KeyType, id: impl Into<String>) -> Self {
        let mut patch = Self::new();
        patch.delete(key_type, id);
        patch
    }

    /// Queue an insert or replacement.
    pub fn insert(&mut self, key_type: KeyType, id: impl Into<String>, value: Bytes) {
        self.entries.entry(key_type).or_default().insert(id.into(), Some(value));
    }

    /// Queue a deletion.
    pub fn delete(&mut self, key_type: KeyType, id: impl Into<String>) {
        self.entries.entry(key_type).or_default().insert(id.into(), None);
    }

    /// Remove a queued entry without applying it.
    ///
    /// Used when a deletion fails validation and must be dropped from the
    /// write set.
    pub fn remove(&mut self, key_type: KeyType, id: &str) {
        if let Some(ids) = self.entries.get_mut(&key_type) {
            ids.remove(id);
            if ids.is_empty() {
                self.entries.remove(&key_type);
            }
        }
    }

    /// Merge another patch into this one. Entries in `other` win.
    pub fn merge(&mut self, other: KeyPatch) {
        for (key_type, ids) in other.entries {
            self.entries.entry(key_type).or_default().extend(ids);
        }
    }

    /// True if no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of queued entries across all key types.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    /// Key types present in this patch.
    pub fn types(&self) -> impl Iterator<Item = KeyType> + '_ {
        self.entries.keys().copied()
    }

    /// Entries queued for one key type.
    pub fn entries_for(&self, key_type: KeyType) -> Option<&HashMap<String, Option<Bytes>>> {
        self.entries.get(&key_type)
    }

    /// Look up a queued entry.
    ///
    /// Outer `None`: the id is not in the patch. Inner `None`: a deletion is
    /// queued for it.
    pub fn get(&self, key_type: KeyType, id: &str) -> Option<Option<&Bytes>> {
        self.entries.get(&key_type).and_then(|ids| ids.get(id)).map(Option::as_ref)
    }

    /// Split off all entries of one key type, leaving the rest in place.
    pub fn take_type(&mut self, key_type: KeyType) -> Option<HashMap<String, Option<Bytes>>> {
        self.entries.remove(&key_type)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_patch_has_no_types() {
        let patch = KeyPatch::new();
        assert!(patch.is_empty());
        assert_eq!(patch.len(), 0);
        assert_eq!(patch.types().count(), 0);
    }

    #[test]
    fn last_write_wins_within_patch() {
        let mut patch = KeyPatch::new();
        patch.insert(KeyType::PreKey, "7", Bytes::from_static(b"old"));
        patch.insert(KeyType::PreKey, "7", Bytes::from_static(b"new"));

        assert_eq!(patch.len(), 1);
        assert_eq!(
            patch.get(KeyType::PreKey, "7"),
            Some(Some(&Bytes::from_static(b"new")))
        );
    }

    #[test]
    fn deletion_overrides_insert() {
        let mut patch = KeyPatch::new();
        patch.insert(KeyType::Session, "alice.0", Bytes::from_static(b"state"));
        patch.delete(KeyType::Session, "alice.0");

        assert_eq!(patch.get(KeyType::Session, "alice.0"), Some(None));
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = KeyPatch::insert_one(KeyType::PreKey, "1", Bytes::from_static(b"a"));
        base.insert(KeyType::Session, "bob.0", Bytes::from_static(b"s"));

        let mut other = KeyPatch::new();
        other.delete(KeyType::PreKey, "1");
        other.insert(KeyType::PreKey, "2", Bytes::from_static(b"b"));

        base.merge(other);

        assert_eq!(base.get(KeyType::PreKey, "1"), Some(None));
        assert_eq!(base.get(KeyType::PreKey, "2"), Some(Some(&Bytes::from_static(b"b"))));
        assert_eq!(base.get(KeyType::Session, "bob.0"), Some(Some(&Bytes::from_static(b"s"))));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn remove_drops_empty_type_table() {
        let mut patch = KeyPatch::delete_one(KeyType::PreKey, "9");
        patch.remove(KeyType::PreKey, "9");

        assert!(patch.is_empty());
        assert_eq!(patch.get(KeyType::PreKey, "9"), None);
    }

    #[test]
    fn take_type_splits_patch() {
        let mut patch = KeyPatch::insert_one(KeyType::SenderKey, "g::a.0", Bytes::new());
        patch.insert(KeyType::Session, "a.0", Bytes::new());

        let sender_keys = patch.take_type(KeyType::SenderKey).unwrap();
        assert_eq!(sender_keys.len(), 1);
        assert_eq!(patch.types().collect::<Vec<_>>(), vec![KeyType::Session]);
    }
}
