//! Identity-keyed registry of entity entries.

use crate::entry::EntityEntry;
use crate::identity::IdentityMap;
use crate::instance::EntityRef;

/// Entity to entry registry, iterated in registration order.
#[derive(Debug, Default)]
pub struct EntityEntryContext {
    entries: IdentityMap<EntityRef, EntityEntry>,
}

impl EntityEntryContext {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry, replacing any previous one for the instance.
    pub fn add_entity_entry(&mut self, entity: EntityRef, entry: EntityEntry) -> &mut EntityEntry {
        self.entries.insert_and_get(entity, entry)
    }

    /// Entry of an instance.
    pub fn get_entity_entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entries.get(entity)
    }

    /// Mutable entry of an instance.
    pub fn get_entity_entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entries.get_mut(entity)
    }

    /// Whether the instance has an entry.
    pub fn has_entity_entry(&self, entity: &EntityRef) -> bool {
        self.entries.contains_key(entity)
    }

    /// Removes the entry of an instance.
    pub fn remove_entity_entry(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        self.entries.remove(entity)
    }

    /// Owned copy of all pairs; safe to walk while the context is mutated.
    pub fn reentrant_safe_entity_entries(&self) -> Vec<(EntityRef, EntityEntry)> {
        self.entries.snapshot()
    }

    /// Pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&EntityRef, &EntityEntry)> {
        self.entries.iter()
    }

    /// Managed instances in registration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityRef> {
        self.entries.keys()
    }

    /// Resets every lock to none, as at transaction end.
    pub fn downgrade_locks(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            entry.downgrade_lock();
        }
    }

    /// Number of tracked instances.
    pub fn number_of_managed_entities(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
