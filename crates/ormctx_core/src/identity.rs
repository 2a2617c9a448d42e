//! Insertion-ordered map keyed by object identity.

use crate::collection::CollectionRef;
use crate::instance::{EntityRef, Instance};
use std::collections::btree_map::{self, BTreeMap};
use std::collections::HashMap;
use std::sync::Arc;

/// Keys whose identity is their address.
pub trait IdentityKey: Clone {
    /// Stable address of the referenced object.
    fn identity(&self) -> usize;
}

impl IdentityKey for EntityRef {
    fn identity(&self) -> usize {
        self.addr()
    }
}

impl IdentityKey for Instance {
    fn identity(&self) -> usize {
        self.addr()
    }
}

impl IdentityKey for CollectionRef {
    fn identity(&self) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// A map that compares keys by identity and iterates in insertion order.
///
/// Re-inserting a present key replaces its value but keeps its position.
/// The map holds its keys strongly, so an address cannot be reused while
/// its entry is present.
#[derive(Debug, Clone)]
pub struct IdentityMap<K, V> {
    entries: BTreeMap<u64, (K, V)>,
    index: HashMap<usize, u64>,
    next_seq: u64,
}

impl<K: IdentityKey, V> Default for IdentityMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IdentityKey, V> IdentityMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty map sized for `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::with_capacity(capacity),
            next_seq: 0,
        }
    }

    fn sequence_for(&mut self, key: &K) -> u64 {
        let next = &mut self.next_seq;
        *self.index.entry(key.identity()).or_insert_with(|| {
            let seq = *next;
            *next += 1;
            seq
        })
    }

    /// Inserts or replaces, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let seq = self.sequence_for(&key);
        self.entries.insert(seq, (key, value)).map(|(_, old)| old)
    }

    /// Inserts or replaces, returning the stored value.
    pub fn insert_and_get(&mut self, key: K, value: V) -> &mut V {
        let seq = self.sequence_for(&key);
        match self.entries.entry(seq) {
            btree_map::Entry::Occupied(slot) => {
                let slot = slot.into_mut();
                slot.1 = value;
                &mut slot.1
            }
            btree_map::Entry::Vacant(slot) => &mut slot.insert((key, value)).1,
        }
    }

    /// Value for a key.
    pub fn get(&self, key: &K) -> Option<&V> {
        let seq = self.index.get(&key.identity())?;
        self.entries.get(seq).map(|(_, v)| v)
    }

    /// Mutable value for a key.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let seq = self.index.get(&key.identity())?;
        self.entries.get_mut(seq).map(|(_, v)| v)
    }

    /// Removes a key, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let seq = self.index.remove(&key.identity())?;
        self.entries.remove(&seq).map(|(_, v)| v)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.index.contains_key(&key.identity())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.values().map(|(k, v)| (k, v))
    }

    /// Mutable entries in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.entries.values_mut().map(|(k, v)| (&*k, v))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.values().map(|(k, _)| k)
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|(_, v)| v)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Owned copy of the entries, safe to walk while the map is mutated.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.entries.values().cloned().collect()
    }
}
