//! Queue of keys and collections eligible for batch loading.
//!
//! When a proxy or an uninitialized collection is registered, its key is
//! remembered here so that loading one of them can fetch up to
//! `batch_size` siblings in the same round trip.

use crate::collection::{CollectionEntry, CollectionRef};
use crate::identity::IdentityMap;
use crate::key::EntityKey;
use crate::persister::{CollectionPersister, EntityPersister};
use ormctx_codec::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// A query whose results can drive a subselect fetch of their collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubselectFetch {
    query: String,
    result_keys: Vec<EntityKey>,
}

impl SubselectFetch {
    /// Creates a subselect registration.
    pub fn new(query: impl Into<String>, result_keys: Vec<EntityKey>) -> Self {
        Self {
            query: query.into(),
            result_keys,
        }
    }

    /// Text of the originating query.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Keys of the owners returned by the query.
    pub fn result_keys(&self) -> &[EntityKey] {
        &self.result_keys
    }
}

/// Insertion-ordered set of entity keys.
#[derive(Debug, Default)]
struct OrderedKeys {
    order: BTreeMap<u64, EntityKey>,
    index: HashMap<EntityKey, u64>,
    next_seq: u64,
}

impl OrderedKeys {
    fn insert(&mut self, key: EntityKey) {
        if self.index.contains_key(&key) {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.index.insert(key, seq);
    }

    fn remove(&mut self, key: &EntityKey) -> bool {
        match self.index.remove(key) {
            Some(seq) => self.order.remove(&seq).is_some(),
            None => false,
        }
    }

    fn contains(&self, key: &EntityKey) -> bool {
        self.index.contains_key(key)
    }

    fn iter(&self) -> impl Iterator<Item = &EntityKey> {
        self.order.values()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Fills a batch window starting with `first`.
///
/// Candidates are taken in registration order, skipping `first` itself.
/// The window wraps around once full so that the keys registered right
/// after `first` win; the walk stops at the first slot after `first`'s
/// position once the window has wrapped.
fn fill_window<'a>(
    first: &Value,
    candidates: impl Iterator<Item = &'a Value>,
    max_batch_size: usize,
) -> Vec<Value> {
    let size = max_batch_size.max(1);
    let mut ids: Vec<Option<Value>> = vec![None; size];
    ids[0] = Some(first.clone());
    if size == 1 {
        return vec![first.clone()];
    }

    let mut i = 1;
    let mut end: Option<usize> = None;
    let mut check_for_end = false;
    for candidate in candidates {
        if check_for_end && Some(i) == end {
            break;
        }
        if candidate == first {
            end = Some(i);
        } else {
            ids[i] = Some(candidate.clone());
            i += 1;
        }
        if i == size {
            i = 1;
            if end.is_some() {
                check_for_end = true;
            }
        }
    }
    ids.into_iter().flatten().collect()
}

/// Batch-loadable keys, subselect registrations and batch-loadable
/// collections of one persistence context.
#[derive(Debug)]
pub struct BatchFetchQueue {
    enabled: bool,
    entity_keys: Option<HashMap<String, OrderedKeys>>,
    subselects: Option<HashMap<EntityKey, SubselectFetch>>,
    collections: Option<HashMap<String, IdentityMap<CollectionRef, Value>>>,
}

impl Default for BatchFetchQueue {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BatchFetchQueue {
    /// Creates an empty queue; a disabled queue ignores registrations.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entity_keys: None,
            subselects: None,
            collections: None,
        }
    }

    /// Whether registrations are recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.entity_keys = None;
        self.subselects = None;
        self.collections = None;
    }

    // ---- subselects ----

    /// Subselect registered for an owner key.
    pub fn get_subselect(&self, key: &EntityKey) -> Option<&SubselectFetch> {
        self.subselects.as_ref()?.get(key)
    }

    /// Registers a subselect for an owner key.
    pub fn add_subselect(&mut self, key: EntityKey, fetch: SubselectFetch) {
        if !self.enabled {
            return;
        }
        self.subselects.get_or_insert_with(HashMap::new).insert(key, fetch);
    }

    /// Removes the subselect of an owner key.
    pub fn remove_subselect(&mut self, key: &EntityKey) -> Option<SubselectFetch> {
        self.subselects.as_mut()?.remove(key)
    }

    /// Removes every subselect.
    pub fn clear_subselects(&mut self) {
        self.subselects = None;
    }

    // ---- entity keys ----

    /// Queues a key if its persister loads in batches.
    pub fn add_batch_loadable_entity_key(&mut self, key: &EntityKey, persister: &dyn EntityPersister) {
        if !self.enabled || persister.batch_size() <= 1 {
            return;
        }
        self.entity_keys
            .get_or_insert_with(HashMap::new)
            .entry(key.entity_name().to_string())
            .or_default()
            .insert(key.clone());
    }

    /// Dequeues a key, typically once its entity is loaded.
    pub fn remove_batch_loadable_entity_key(&mut self, key: &EntityKey) -> bool {
        let Some(by_name) = self.entity_keys.as_mut() else {
            return false;
        };
        let Some(set) = by_name.get_mut(key.entity_name()) else {
            return false;
        };
        let removed = set.remove(key);
        if set.is_empty() {
            by_name.remove(key.entity_name());
        }
        removed
    }

    /// Whether a key is queued.
    pub fn contains_entity_key(&self, key: &EntityKey) -> bool {
        self.entity_keys
            .as_ref()
            .and_then(|m| m.get(key.entity_name()))
            .is_some_and(|set| set.contains(key))
    }

    /// Number of queued keys for an entity name.
    pub fn batch_loadable_entity_count(&self, entity_name: &str) -> usize {
        self.entity_keys
            .as_ref()
            .and_then(|m| m.get(entity_name))
            .map_or(0, |set| set.index.len())
    }

    /// Identifiers to load together with `id`, `id` first.
    pub fn batch_load_ids(&self, persister: &dyn EntityPersister, id: &Value, max_batch_size: usize) -> Vec<Value> {
        let queued = self
            .entity_keys
            .as_ref()
            .and_then(|m| m.get(persister.entity_name()));
        match queued {
            Some(set) => fill_window(id, set.iter().map(EntityKey::identifier), max_batch_size),
            None => vec![id.clone()],
        }
    }

    // ---- collections ----

    /// Queues an uninitialized collection under its loaded role.
    pub fn add_batch_loadable_collection(&mut self, collection: &CollectionRef, entry: &CollectionEntry) {
        if !self.enabled {
            return;
        }
        let (Some(role), Some(key)) = (entry.role(), entry.loaded_key()) else {
            return;
        };
        self.collections
            .get_or_insert_with(HashMap::new)
            .entry(role.to_string())
            .or_default()
            .insert(collection.clone(), key.clone());
    }

    /// Dequeues a collection, typically once it is initialized.
    pub fn remove_batch_loadable_collection(&mut self, collection: &CollectionRef, entry: &CollectionEntry) -> bool {
        let Some(role) = entry.role() else {
            return false;
        };
        let Some(by_role) = self.collections.as_mut() else {
            return false;
        };
        let Some(map) = by_role.get_mut(role) else {
            return false;
        };
        let removed = map.remove(collection).is_some();
        if map.is_empty() {
            by_role.remove(role);
        }
        removed
    }

    /// Whether a collection is queued.
    pub fn contains_collection(&self, collection: &CollectionRef) -> bool {
        let role = collection.role();
        self.collections
            .as_ref()
            .zip(role)
            .and_then(|(m, role)| m.get(&role).map(|c| c.contains_key(collection)))
            .unwrap_or(false)
    }

    /// Keys of collections to initialize together with `key`, `key` first.
    pub fn collection_batch(&self, persister: &dyn CollectionPersister, key: &Value, max_batch_size: usize) -> Vec<Value> {
        let Some(queued) = self.collections.as_ref().and_then(|m| m.get(persister.role())) else {
            return vec![key.clone()];
        };
        let candidates = queued.iter().filter_map(|(collection, loaded_key)| {
            if collection.was_initialized() {
                warn!(role = persister.role(), key = %loaded_key, "initialized collection found in batch fetch queue");
                None
            } else {
                Some(loaded_key)
            }
        });
        fill_window(key, candidates, max_batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Integer).collect()
    }

    #[test]
    fn window_takes_following_keys_first() {
        let queued = ids(&[1, 2, 3, 4, 5, 6, 7]);
        let batch = fill_window(&Value::Integer(5), queued.iter(), 3);
        // wraps past 6 and 7, overwriting the slots filled by 1 and 2
        assert_eq!(batch, ids(&[5, 6, 7]));
    }

    #[test]
    fn window_stops_after_wrapping_back_to_start() {
        let queued = ids(&[1, 2, 3, 4, 5, 6]);
        let batch = fill_window(&Value::Integer(2), queued.iter(), 3);
        // 4 overwrites 1, then the walk reaches the slot after 2 and stops
        assert_eq!(batch, ids(&[2, 4, 3]));
    }

    #[test]
    fn window_with_few_candidates() {
        let queued = ids(&[7, 8]);
        let batch = fill_window(&Value::Integer(9), queued.iter(), 10);
        assert_eq!(batch, ids(&[9, 7, 8]));
        assert_eq!(fill_window(&Value::Integer(9), queued.iter(), 1), ids(&[9]));
    }

    #[test]
    fn subselects_are_keyed_by_owner() {
        let mut queue = BatchFetchQueue::default();
        let key = EntityKey::from_parts("Order", "Order", Value::Integer(1), None);
        queue.add_subselect(key.clone(), SubselectFetch::new("from Order", vec![key.clone()]));

        assert_eq!(queue.get_subselect(&key).map(SubselectFetch::query), Some("from Order"));
        assert!(queue.remove_subselect(&key).is_some());
        assert!(queue.get_subselect(&key).is_none());
    }

    #[test]
    fn disabled_queue_ignores_registrations() {
        let mut queue = BatchFetchQueue::new(false);
        let key = EntityKey::from_parts("Order", "Order", Value::Integer(1), None);
        queue.add_subselect(key.clone(), SubselectFetch::new("q", Vec::new()));
        assert!(queue.get_subselect(&key).is_none());
        assert!(!queue.is_enabled());
    }

    #[test]
    fn ordered_keys_keep_first_position() {
        let mut set = OrderedKeys::default();
        let a = EntityKey::from_parts("A", "A", Value::Integer(1), None);
        let b = EntityKey::from_parts("A", "A", Value::Integer(2), None);
        set.insert(a.clone());
        set.insert(b.clone());
        set.insert(a.clone());

        let order: Vec<_> = set.iter().cloned().collect();
        assert_eq!(order, vec![a.clone(), b]);
        assert!(set.remove(&a));
        assert!(!set.contains(&a));
    }
}
