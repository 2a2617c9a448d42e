//! Collection wrappers, their entries and owner resolution.

use super::PersistenceContext;
use crate::collection::{CollectionData, CollectionEntry, CollectionRef};
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityMap;
use crate::instance::EntityRef;
use crate::key::{CollectionKey, EntityUniqueKey};
use crate::persister::{CollectionPersister, EntityPersister};
use ormctx_codec::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

impl PersistenceContext {
    fn collection_entries_mut(&mut self) -> &mut IdentityMap<CollectionRef, CollectionEntry> {
        let capacity = self.config.initial_capacity;
        self.collection_entries
            .get_or_insert_with(|| IdentityMap::with_capacity(capacity))
    }

    fn collections_by_key_mut(&mut self) -> &mut HashMap<CollectionKey, CollectionRef> {
        let capacity = self.config.initial_capacity;
        self.collections_by_key
            .get_or_insert_with(|| HashMap::with_capacity(capacity))
    }

    /// Indexes a wrapper by identity and by key.
    ///
    /// A different wrapper previously indexed under the same key is
    /// unbound from the session and forgotten.
    fn add_collection(&mut self, collection: &CollectionRef, entry: CollectionEntry, key: Value) -> CoreResult<()> {
        let role = entry
            .loaded_persister()
            .map(|p| p.role().to_string())
            .or_else(|| entry.role().map(str::to_string))
            .unwrap_or_default();
        self.collection_entries_mut().insert(Arc::clone(collection), entry);

        let collection_key = CollectionKey::new(role, key);
        let Some(old) = self
            .collections_by_key_mut()
            .insert(collection_key, Arc::clone(collection))
        else {
            return Ok(());
        };
        if Arc::ptr_eq(&old, collection) {
            return Err(CoreError::assertion_failure("bug adding collection twice"));
        }
        old.unset_session(self.session.id());
        self.collection_entries_mut().remove(&old);
        Ok(())
    }

    fn queue_for_batch(&mut self, persister: &dyn CollectionPersister, collection: &CollectionRef, entry: &CollectionEntry) {
        if persister.batch_size() > 1 {
            self.batch_fetch_queue()
                .add_batch_loadable_collection(collection, entry);
        }
    }

    /// Admits a wrapper about to be loaded for `id`.
    ///
    /// # Errors
    ///
    /// Returns an assertion failure if the wrapper is already indexed
    /// under that key.
    pub fn add_uninitialized_collection(
        &mut self,
        persister: &Arc<dyn CollectionPersister>,
        collection: &CollectionRef,
        id: Value,
    ) -> CoreResult<()> {
        let entry = CollectionEntry::for_loading(collection, persister, id.clone(), self.flushing);
        self.add_collection(collection, entry.clone(), id)?;
        self.queue_for_batch(persister.as_ref(), collection, &entry);
        Ok(())
    }

    /// Admits an uninitialized wrapper from a detached graph.
    ///
    /// # Errors
    ///
    /// Returns an assertion failure if the wrapper is already indexed
    /// under its key.
    pub fn add_uninitialized_detached_collection(
        &mut self,
        persister: &Arc<dyn CollectionPersister>,
        collection: &CollectionRef,
    ) -> CoreResult<()> {
        let key = collection.key();
        let entry = CollectionEntry::for_detached_uninitialized(persister, key.clone());
        self.add_collection(collection, entry.clone(), key.unwrap_or(Value::Null))?;
        self.queue_for_batch(persister.as_ref(), collection, &entry);
        Ok(())
    }

    /// Admits a wrapper created during flush; it has no key yet.
    pub fn add_new_collection(&mut self, persister: &Arc<dyn CollectionPersister>, collection: &CollectionRef) {
        let entry = CollectionEntry::for_new(persister, collection);
        self.collection_entries_mut().insert(Arc::clone(collection), entry);
    }

    /// Admits an initialized wrapper from a detached graph.
    ///
    /// A wrapper that was never associated with a key is treated as new.
    ///
    /// # Errors
    ///
    /// Returns an assertion failure if the wrapper is already indexed
    /// under its key.
    pub fn add_initialized_detached_collection(
        &mut self,
        persister: &Arc<dyn CollectionPersister>,
        collection: &CollectionRef,
    ) -> CoreResult<()> {
        if collection.is_unreferenced() {
            self.add_new_collection(persister, collection);
            return Ok(());
        }
        let entry = CollectionEntry::for_detached_initialized(collection, persister);
        self.add_collection(collection, entry, collection.key().unwrap_or(Value::Null))
    }

    /// Admits a wrapper whose elements were just loaded for `id`.
    ///
    /// # Errors
    ///
    /// Returns an assertion failure if the wrapper is already indexed
    /// under that key.
    pub fn add_initialized_collection(
        &mut self,
        persister: &Arc<dyn CollectionPersister>,
        collection: &CollectionRef,
        id: Value,
    ) -> CoreResult<&CollectionEntry> {
        let mut entry = CollectionEntry::for_loading(collection, persister, id.clone(), self.flushing);
        entry.post_initialize(collection);
        self.add_collection(collection, entry, id)?;
        self.get_collection_entry(collection).ok_or_else(|| {
            CoreError::assertion_failure("collection entry missing right after admission")
        })
    }

    /// Entry of a wrapper.
    pub fn get_collection_entry(&self, collection: &CollectionRef) -> Option<&CollectionEntry> {
        self.collection_entries.as_ref()?.get(collection)
    }

    /// Mutable entry of a wrapper, for flush bookkeeping.
    pub fn get_collection_entry_mut(&mut self, collection: &CollectionRef) -> Option<&mut CollectionEntry> {
        self.collection_entries.as_mut()?.get_mut(collection)
    }

    /// Whether a wrapper has an entry.
    pub fn contains_collection(&self, collection: &CollectionRef) -> bool {
        self.collection_entries
            .as_ref()
            .is_some_and(|m| m.contains_key(collection))
    }

    /// Wrapper indexed under a key.
    pub fn get_collection(&self, key: &CollectionKey) -> Option<CollectionRef> {
        self.collections_by_key.as_ref()?.get(key).cloned()
    }

    /// Snapshot taken when a wrapper was loaded.
    pub fn get_snapshot(&self, collection: &CollectionRef) -> Option<CollectionData> {
        self.get_collection_entry(collection)?.snapshot().cloned()
    }

    /// Removes the entry of a wrapper.
    pub fn remove_collection_entry(&mut self, collection: &CollectionRef) -> Option<CollectionEntry> {
        self.collection_entries.as_mut()?.remove(collection)
    }

    /// Indexes a wrapper under a key, returning the one it replaced.
    pub fn add_collection_by_key(&mut self, key: CollectionKey, collection: CollectionRef) -> Option<CollectionRef> {
        self.collections_by_key_mut().insert(key, collection)
    }

    /// Removes the wrapper indexed under a key.
    pub fn remove_collection_by_key(&mut self, key: &CollectionKey) -> Option<CollectionRef> {
        self.collections_by_key.as_mut()?.remove(key)
    }

    /// Drops the key index; entries stay.
    pub fn clear_collections_by_key(&mut self) {
        if let Some(by_key) = self.collections_by_key.as_mut() {
            by_key.clear();
        }
    }

    /// Number of tracked wrappers.
    pub fn collection_entries_len(&self) -> usize {
        self.collection_entries.as_ref().map_or(0, IdentityMap::len)
    }

    /// Calls `action` for every wrapper and entry in admission order.
    pub fn for_each_collection_entry(&self, mut action: impl FnMut(&CollectionRef, &CollectionEntry)) {
        if let Some(entries) = &self.collection_entries {
            for (collection, entry) in entries.iter() {
                action(collection, entry);
            }
        }
    }

    /// Wrappers and entries copied out, safe to walk while the context
    /// changes.
    pub fn reentrant_safe_collection_entries(&self) -> Vec<(CollectionRef, CollectionEntry)> {
        self.collection_entries
            .as_ref()
            .map(IdentityMap::snapshot)
            .unwrap_or_default()
    }

    /// Keys and wrappers of the key index.
    pub fn collections_by_key(&self) -> impl Iterator<Item = (&CollectionKey, &CollectionRef)> {
        self.collections_by_key.iter().flat_map(HashMap::iter)
    }

    // ---- non-lazy collections ----

    /// Queues a collection to be initialized once the current load ends.
    pub fn add_non_lazy_collection(&mut self, collection: CollectionRef) {
        self.non_lazy_collections
            .get_or_insert_with(Vec::new)
            .push(collection);
    }

    /// Initializes queued non-lazy collections through their sessions.
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure.
    pub fn initialize_non_lazy_collections(&mut self) -> CoreResult<()> {
        self.initialize_non_lazy_collections_with(|_, collection| collection.force_initialization())
    }

    /// Drains the non-lazy queue, last queued first, with a custom action.
    ///
    /// Only the outermost call drains; calls made while a load is in
    /// progress, including from `initialize`, return immediately. Null
    /// association marks are cleared when the drain ends.
    ///
    /// # Errors
    ///
    /// Returns the first error of `initialize`; the remaining queue is kept.
    pub fn initialize_non_lazy_collections_with<F>(&mut self, mut initialize: F) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &CollectionRef) -> CoreResult<()>,
    {
        if self.load_counter != 0 {
            return Ok(());
        }
        debug!("initializing non-lazy collections");
        self.load_counter += 1;
        let result = self.drain_non_lazy(&mut initialize);
        self.load_counter -= 1;
        self.clear_null_properties();
        result
    }

    fn drain_non_lazy<F>(&mut self, initialize: &mut F) -> CoreResult<()>
    where
        F: FnMut(&mut Self, &CollectionRef) -> CoreResult<()>,
    {
        while let Some(collection) = self.non_lazy_collections.as_mut().and_then(Vec::pop) {
            initialize(self, &collection)?;
        }
        Ok(())
    }

    // ---- unowned collections ----

    /// Parks a wrapper whose owner is not loaded yet.
    pub fn add_unowned_collection(&mut self, key: CollectionKey, collection: CollectionRef) {
        self.unowned_collections
            .get_or_insert_with(HashMap::new)
            .insert(key, collection);
    }

    /// Takes a parked wrapper.
    pub fn use_unowned_collection(&mut self, key: &CollectionKey) -> Option<CollectionRef> {
        self.unowned_collections.as_mut()?.remove(key)
    }

    // ---- owners ----

    fn owner_by_id(&self, id: Value, owner: &dyn EntityPersister) -> CoreResult<Option<EntityRef>> {
        Ok(self.get_entity(&self.generate_entity_key(id, owner)?))
    }

    /// Loaded owner of a collection key.
    ///
    /// A key that refers to a unique owner property is resolved through
    /// the unique-key index, then through the owner persister.
    ///
    /// # Errors
    ///
    /// Returns an error if the owner entity is unknown or the unique-key
    /// lookup fails.
    pub fn get_collection_owner(
        &self,
        key: &Value,
        persister: &dyn CollectionPersister,
    ) -> CoreResult<Option<EntityRef>> {
        let owner = self.entity_persister(persister.owner_entity_name())?;
        let Some(property) = persister.lhs_property_name() else {
            return self.owner_by_id(key.clone(), owner.as_ref());
        };

        let unique_key = EntityUniqueKey::new(
            owner.entity_name(),
            property,
            key.clone(),
            persister.key_type(),
        );
        if let Some(entity) = self.get_entity_by_unique_key(&unique_key) {
            return Ok(Some(entity));
        }
        match owner.id_by_unique_key(key, property)? {
            Some(id) => self.owner_by_id(id, owner.as_ref()),
            None => Ok(None),
        }
    }

    /// Owner the collection was loaded for, if it is in the context.
    ///
    /// # Errors
    ///
    /// Returns an error if the owner entity is unknown.
    pub fn get_loaded_collection_owner_or_null(&self, collection: &CollectionRef) -> CoreResult<Option<EntityRef>> {
        let Some(persister) = self
            .get_collection_entry(collection)
            .and_then(CollectionEntry::loaded_persister)
        else {
            return Ok(None);
        };
        let Some(id) = self.get_loaded_collection_owner_id_or_null(collection) else {
            return Ok(None);
        };
        let owner = self.entity_persister(persister.owner_entity_name())?;
        self.owner_by_id(id, owner.as_ref())
    }

    /// Identifier of the owner the collection was loaded for.
    pub fn get_loaded_collection_owner_id_or_null(&self, collection: &CollectionRef) -> Option<Value> {
        let entry = self.get_collection_entry(collection)?;
        let key = entry.loaded_key()?;
        entry.loaded_persister()?.id_of_owner(key)
    }
}
